//! The offline cache manager.
//!
//! `OfflineWorker` owns the configuration, the route table and the
//! lifecycle state for one worker version, and answers the four events the
//! host dispatches: install, activate, fetch and message.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::Error;
use crate::cache::{CacheDb, CacheEntry};
use crate::config::OfflineConfig;
use crate::lifecycle::{Phase, WorkerState};
use crate::network::Network;
use crate::request::Request;
use crate::routing::{Decision, PassReason, RouteTable};
use crate::strategy::{Served, StrategyContext, enforce_expiration};
use crate::url::resolve;

/// Result of a successful install.
#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct InstallReport {
    pub store: String,
    /// Manifest URLs now in the precache store, in manifest order.
    pub precached: Vec<String>,
    /// Whether the worker asked to activate without waiting.
    pub skip_waiting: bool,
}

/// Result of a successful activation.
#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct ActivateReport {
    /// Stores removed because they belong to another version.
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
    pub clients_claimed: bool,
}

/// Outcome of an intercepted fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the host performs the request itself.
    Passthrough(PassReason),
    Served(Served),
}

/// Control messages a page can post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

/// What handling a message did.
#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageOutcome {
    /// Unknown or malformed payload.
    Ignored,
    /// Flag recorded; nothing was waiting to activate.
    SkipWaitingSet,
    /// The waiting worker was activated on the spot.
    Activated(ActivateReport),
}

pub struct OfflineWorker {
    config: Arc<OfflineConfig>,
    routes: RouteTable,
    strategies: StrategyContext,
    state: RwLock<WorkerState>,
    /// Held for the whole install so concurrent installs cannot interleave.
    install_lock: Mutex<()>,
}

impl OfflineWorker {
    /// Build a worker for `config`'s version in the `installing` phase.
    pub fn new(config: OfflineConfig, db: CacheDb, network: Arc<dyn Network>) -> Result<Self, Error> {
        let routes = RouteTable::from_config(&config)?;
        let offline_fallback =
            resolve(routes.origin(), &config.offline_fallback).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let strategies = StrategyContext {
            db,
            network,
            precache_store: config.precache_store_name(),
            runtime_store: config.runtime_store_name(),
            offline_fallback,
        };
        let state = RwLock::new(WorkerState::new(config.version.clone()));

        Ok(Self { config: Arc::new(config), routes, strategies, state, install_lock: Mutex::new(()) })
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn db(&self) -> &CacheDb {
        &self.strategies.db
    }

    /// Snapshot of the lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut WorkerState) -> T) -> T {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Rebuild lifecycle state after a restart.
    ///
    /// A version whose precache store exists finished installing in an
    /// earlier run. With no other version's stores left it had also
    /// activated, so it serves immediately. Otherwise it is waiting: it
    /// resumes as installed and activates again if skip-waiting is set.
    pub async fn resume(&self) -> Result<Phase, Error> {
        if !self.db().has_store(&self.strategies.precache_store).await? {
            return Ok(self.phase());
        }

        let current = self.config.current_store_names();
        let stale = self
            .db()
            .store_names()
            .await?
            .into_iter()
            .filter(|name| !current.contains(name))
            .count();

        if stale == 0 {
            self.with_state(WorkerState::resume_activated);
            tracing::info!(version = %self.config.version, "resumed activated worker");
            return Ok(self.phase());
        }

        let skip_waiting = self.config.skip_waiting_on_install;
        self.with_state(|s| s.resume_installed(skip_waiting));
        tracing::info!(version = %self.config.version, stale, "resumed waiting worker");
        if skip_waiting {
            self.activate().await?;
        }
        Ok(self.phase())
    }

    /// Install event: precache every manifest URL, all or nothing.
    ///
    /// On failure the worker becomes redundant and no precache entry is
    /// written; stores of other versions are left alone.
    pub async fn install(&self) -> Result<InstallReport, Error> {
        let Ok(_guard) = self.install_lock.try_lock() else {
            return Err(Error::InvalidState("install already in progress".into()));
        };
        let phase = self.phase();
        if phase != Phase::Installing {
            return Err(Error::InvalidState(format!("install dispatched while {phase}")));
        }

        match self.precache().await {
            Ok(entries) => {
                let precached: Vec<String> = entries.iter().map(|e| e.url.clone()).collect();
                let store = self.strategies.precache_store.clone();
                self.db().put_entries(&store, entries).await?;
                self.db().open_store(&self.strategies.runtime_store).await?;

                let skip_waiting = self.config.skip_waiting_on_install;
                self.with_state(|s| {
                    s.skip_waiting |= skip_waiting;
                    s.advance(Phase::Installed)
                })?;
                tracing::info!(store = %store, count = precached.len(), "precache complete");

                Ok(InstallReport { store, precached, skip_waiting: self.state().skip_waiting })
            }
            Err(e) => {
                tracing::warn!(version = %self.config.version, error = %e, "install failed");
                self.with_state(|s| s.advance(Phase::Redundant))?;
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<Vec<CacheEntry>, Error> {
        let mut entries = Vec::with_capacity(self.config.precache.len());
        for item in &self.config.precache {
            let url = resolve(self.routes.origin(), item).map_err(|e| Error::InvalidUrl(format!("{item}: {e}")))?;
            let request = Request::get(url);

            let response = self
                .strategies
                .network
                .fetch(&request)
                .await
                .map_err(|e| Error::InstallFailed(format!("{}: {e}", request.url)))?;
            if !response.is_ok() {
                return Err(Error::InstallFailed(format!("{}: status {}", request.url, response.status)));
            }
            tracing::debug!(url = %request.url, bytes = response.body.len(), "precached");
            entries.push(CacheEntry::new(&request, "precache", response));
        }
        Ok(entries)
    }

    /// Activate event: drop stores of other versions, then claim pages.
    pub async fn activate(&self) -> Result<ActivateReport, Error> {
        self.with_state(|s| s.advance(Phase::Activating))?;

        match self.clean_stores().await {
            Ok((deleted, kept)) => {
                self.with_state(|s| {
                    s.clients_claimed = true;
                    s.advance(Phase::Activated)
                })?;
                Ok(ActivateReport { deleted, kept, clients_claimed: true })
            }
            Err(e) => {
                self.with_state(|s| s.advance(Phase::Installed))?;
                Err(e)
            }
        }
    }

    async fn clean_stores(&self) -> Result<(Vec<String>, Vec<String>), Error> {
        let current = self.config.current_store_names();
        let mut deleted = Vec::new();
        let mut kept = Vec::new();

        for name in self.db().store_names().await? {
            if current.contains(&name) {
                kept.push(name);
            } else {
                self.db().delete_store(&name).await?;
                tracing::info!(store = %name, "deleted outdated cache store");
                deleted.push(name);
            }
        }
        Ok((deleted, kept))
    }

    /// Fetch event.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, Error> {
        if !self.state().is_serving() {
            return Ok(FetchOutcome::Passthrough(PassReason::NotActive));
        }

        match self.routes.select(&request) {
            Decision::Passthrough(reason) => {
                tracing::debug!(url = %request.url, "not intercepted");
                Ok(FetchOutcome::Passthrough(reason))
            }
            Decision::Handle(route) => self.strategies.execute(route, &request).await.map(FetchOutcome::Served),
        }
    }

    /// Message event.
    pub async fn handle_message(&self, payload: &serde_json::Value) -> Result<MessageOutcome, Error> {
        let message: ControlMessage = match serde_json::from_value(payload.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring unrecognized message");
                return Ok(MessageOutcome::Ignored);
            }
        };

        match message {
            ControlMessage::SkipWaiting => {
                let waiting = self.with_state(|s| {
                    s.skip_waiting = true;
                    s.phase == Phase::Installed
                });
                if waiting {
                    tracing::info!("skip waiting requested, activating now");
                    self.activate().await.map(MessageOutcome::Activated)
                } else {
                    Ok(MessageOutcome::SkipWaitingSet)
                }
            }
        }
    }

    /// Names of every existing store.
    pub async fn keys(&self) -> Result<Vec<String>, Error> {
        self.db().store_names().await
    }

    /// Apply expiration bounds to the runtime store.
    ///
    /// With `bucket` set only that bucket is trimmed. Returns the number of
    /// evicted entries.
    pub async fn purge(&self, bucket: Option<&str>) -> Result<u64, Error> {
        if let Some(name) = bucket
            && self.routes.route_for_bucket(name).is_none()
        {
            return Err(Error::InvalidInput(format!("unknown bucket: {name}")));
        }

        let mut total = 0;
        for route in self.routes.routes() {
            if bucket.is_some_and(|b| b != route.bucket) {
                continue;
            }
            if let Some(exp) = route.expiration() {
                total += enforce_expiration(self.db(), &self.strategies.runtime_store, route.bucket, exp).await?;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::now_ms;
    use crate::network::stub::StubNetwork;
    use crate::request::{Destination, Response};
    use crate::routing::{BUCKET_IMAGES, BUCKET_PAGES};
    use crate::strategy::Source;
    use crate::url::canonicalize;
    use bytes::Bytes;
    use serde_json::json;

    const ORIGIN: &str = "https://taxi.example.com";

    fn config(precache: &[&str]) -> OfflineConfig {
        OfflineConfig {
            origin: ORIGIN.into(),
            precache: precache.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn worker(config: OfflineConfig, net: Arc<StubNetwork>, db: CacheDb) -> OfflineWorker {
        OfflineWorker::new(config, db, net).unwrap()
    }

    fn serve_app(net: &StubNetwork) {
        net.serve(&format!("{ORIGIN}/"), 200, "<html>kalkulator</html>");
        net.serve(&format!("{ORIGIN}/static/style.css"), 200, "body{}");
    }

    fn url(path: &str) -> url::Url {
        canonicalize(&format!("{ORIGIN}{path}")).unwrap()
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/", "/static/style.css"]), net, db).await;

        let report = w.install().await.unwrap();
        assert_eq!(report.precached, vec![format!("{ORIGIN}/"), format!("{ORIGIN}/static/style.css")]);
        assert!(report.skip_waiting);
        assert_eq!(w.phase(), Phase::Installed);

        for path in ["/", "/static/style.css"] {
            let hit = w
                .db()
                .match_request(&[report.store.as_str()], &Request::get(url(path)))
                .await
                .unwrap();
            assert!(hit.is_some(), "{path} should be precached");
        }
    }

    #[tokio::test]
    async fn test_install_then_activate_leaves_exactly_current_stores() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        db.open_store("taxi-calculator-offline-v0").await.unwrap();
        db.open_store("taxi-calculator-offline-runtime-v0").await.unwrap();
        let cfg = config(&["/", "/static/style.css"]);
        let expected = cfg.current_store_names();
        let w = worker(cfg, net, db).await;

        w.install().await.unwrap();
        let report = w.activate().await.unwrap();

        let mut keys = w.keys().await.unwrap();
        keys.sort();
        let mut expected = expected.to_vec();
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.clients_claimed);
        assert_eq!(w.phase(), Phase::Activated);
    }

    #[tokio::test]
    async fn test_install_failure_is_all_or_nothing() {
        let net = Arc::new(StubNetwork::new());
        net.serve(&format!("{ORIGIN}/"), 200, "<html></html>");
        let db = CacheDb::open_in_memory().await.unwrap();
        db.open_store("taxi-calculator-offline-precache-v0").await.unwrap();
        let cfg = config(&["/", "/static/missing.css"]);
        let precache_store = cfg.precache_store_name();
        let w = worker(cfg, net, db).await;

        let result = w.install().await;
        assert!(matches!(result, Err(Error::InstallFailed(msg)) if msg.contains("missing.css")));
        assert_eq!(w.phase(), Phase::Redundant);
        assert!(!w.db().has_store(&precache_store).await.unwrap());
        assert!(w.db().has_store("taxi-calculator-offline-precache-v0").await.unwrap());
        assert!(matches!(w.activate().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_install_fails_offline() {
        let net = Arc::new(StubNetwork::new());
        net.set_offline(true);
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/"]), net, db).await;

        assert!(matches!(w.install().await, Err(Error::InstallFailed(_))));
    }

    #[tokio::test]
    async fn test_install_twice_rejected() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/"]), net, db).await;

        w.install().await.unwrap();
        assert!(matches!(w.install().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_fetch_passthrough_until_activated() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/"]), net, db).await;
        w.install().await.unwrap();

        let outcome = w.handle_fetch(Request::navigate(url("/"))).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough(PassReason::NotActive)));

        w.activate().await.unwrap();
        let outcome = w.handle_fetch(Request::navigate(url("/"))).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Served(s) if s.source == Source::Cache));
    }

    #[tokio::test]
    async fn test_fetch_cross_origin_passthrough() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/"]), net.clone(), db).await;
        w.install().await.unwrap();
        w.activate().await.unwrap();
        let hits = net.hits();

        let request = Request::get(canonicalize("https://auth.uber.com/oauth/v2/authorize").unwrap());
        let outcome = w.handle_fetch(request).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough(PassReason::CrossOrigin)));
        assert_eq!(net.hits(), hits);
    }

    #[tokio::test]
    async fn test_offline_oblicz_scenario() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/", "/static/style.css"]), net.clone(), db).await;
        w.install().await.unwrap();
        w.activate().await.unwrap();
        net.set_offline(true);

        let nav = Request::navigate(url("/oblicz"));
        let FetchOutcome::Served(served) = w.handle_fetch(nav).await.unwrap() else {
            panic!("navigation should be served");
        };
        assert_eq!(served.source, Source::OfflineFallback);
        assert_eq!(served.bucket, BUCKET_PAGES);
        assert_eq!(served.response.body, Bytes::from_static(b"<html>kalkulator</html>"));

        let api = Request::parse("POST", &format!("{ORIGIN}/oblicz"), Destination::Empty, None).unwrap();
        assert!(matches!(w.handle_fetch(api).await, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_skip_waiting_message_activates_waiting_worker() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        let cfg = OfflineConfig { skip_waiting_on_install: false, ..config(&["/"]) };
        let w = worker(cfg, net, db).await;

        let report = w.install().await.unwrap();
        assert!(!report.skip_waiting);

        let outcome = w.handle_message(&json!({"type": "SKIP_WAITING"})).await.unwrap();
        assert!(matches!(outcome, MessageOutcome::Activated(_)));
        assert_eq!(w.phase(), Phase::Activated);
        assert!(w.state().skip_waiting);
    }

    #[tokio::test]
    async fn test_skip_waiting_before_install_only_sets_flag() {
        let net = Arc::new(StubNetwork::new());
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/"]), net, db).await;

        let outcome = w.handle_message(&json!({"type": "SKIP_WAITING"})).await.unwrap();
        assert!(matches!(outcome, MessageOutcome::SkipWaitingSet));
        assert_eq!(w.phase(), Phase::Installing);
    }

    #[tokio::test]
    async fn test_unknown_message_ignored() {
        let net = Arc::new(StubNetwork::new());
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/"]), net, db).await;

        for payload in [json!({"type": "CLAIM"}), json!("SKIP_WAITING"), json!(null)] {
            let outcome = w.handle_message(&payload).await.unwrap();
            assert!(matches!(outcome, MessageOutcome::Ignored));
        }
        assert!(!w.state().skip_waiting);
    }

    #[tokio::test]
    async fn test_resume_after_restart() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        let first = worker(config(&["/"]), net.clone(), db.clone()).await;
        assert_eq!(first.resume().await.unwrap(), Phase::Installing);
        first.install().await.unwrap();
        first.activate().await.unwrap();

        let restarted = worker(config(&["/"]), net.clone(), db.clone()).await;
        assert_eq!(restarted.resume().await.unwrap(), Phase::Activated);

        let next_version = worker(OfflineConfig { version: "v2".into(), ..config(&["/"]) }, net, db).await;
        assert_eq!(next_version.resume().await.unwrap(), Phase::Installing);
    }

    #[tokio::test]
    async fn test_new_version_activation_evicts_old_generation() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();

        let v1 = worker(config(&["/"]), net.clone(), db.clone()).await;
        v1.install().await.unwrap();
        v1.activate().await.unwrap();
        v1.handle_fetch(Request::get(url("/static/style.css"))).await.unwrap();

        let cfg2 = OfflineConfig { version: "v2".into(), ..config(&["/"]) };
        let v2 = worker(cfg2.clone(), net, db).await;
        v2.install().await.unwrap();
        let report = v2.activate().await.unwrap();

        let mut deleted = report.deleted.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["taxi-calculator-offline-precache-v1", "taxi-calculator-offline-runtime-v1"]);
        let keys = v2.keys().await.unwrap();
        assert!(keys.iter().all(|k| cfg2.current_store_names().contains(k)));
    }

    #[tokio::test]
    async fn test_purge_applies_image_bounds() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();
        let cfg = OfflineConfig { image_max_entries: 1, ..config(&["/"]) };
        let runtime = cfg.runtime_store_name();
        let w = worker(cfg, net, db).await;

        for (i, name) in ["a.png", "b.png", "c.png"].iter().enumerate() {
            let request = Request::get(url(&format!("/static/{name}")));
            let entry = CacheEntry {
                stored_at_ms: now_ms() - 1000 + i as i64,
                ..CacheEntry::new(&request, BUCKET_IMAGES, Response::new(200, *name, request.url.as_str()))
            };
            w.db().put_entry(&runtime, &entry).await.unwrap();
        }

        assert_eq!(w.purge(Some(BUCKET_PAGES)).await.unwrap(), 0);
        assert_eq!(w.purge(None).await.unwrap(), 2);
        assert_eq!(w.db().entry_urls(&runtime).await.unwrap(), vec![format!("{ORIGIN}/static/c.png")]);
        assert!(matches!(w.purge(Some("videos")).await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_resume_waiting_worker_still_cleans_up() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();

        let v1 = worker(config(&["/"]), net.clone(), db.clone()).await;
        v1.install().await.unwrap();
        v1.activate().await.unwrap();

        let cfg2 = OfflineConfig { version: "v2".into(), skip_waiting_on_install: false, ..config(&["/"]) };
        let v2 = worker(cfg2.clone(), net.clone(), db.clone()).await;
        v2.install().await.unwrap();

        let restarted = worker(cfg2.clone(), net, db).await;
        assert_eq!(restarted.resume().await.unwrap(), Phase::Installed);
        assert!(restarted.db().has_store("taxi-calculator-offline-precache-v1").await.unwrap());
        let outcome = restarted.handle_fetch(Request::navigate(url("/"))).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough(PassReason::NotActive)));

        let report = restarted.activate().await.unwrap();
        assert_eq!(report.deleted.len(), 2);
        let mut keys = restarted.keys().await.unwrap();
        keys.sort();
        let mut expected = cfg2.current_store_names().to_vec();
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_resume_waiting_worker_with_skip_waiting_activates() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        let db = CacheDb::open_in_memory().await.unwrap();

        let v1 = worker(config(&["/"]), net.clone(), db.clone()).await;
        v1.install().await.unwrap();
        v1.activate().await.unwrap();

        let waiting = OfflineConfig { version: "v2".into(), skip_waiting_on_install: false, ..config(&["/"]) };
        worker(waiting, net.clone(), db.clone()).await.install().await.unwrap();

        let eager = OfflineConfig { version: "v2".into(), ..config(&["/"]) };
        let restarted = worker(eager, net, db).await;
        assert_eq!(restarted.resume().await.unwrap(), Phase::Activated);
        assert!(!restarted.db().has_store("taxi-calculator-offline-precache-v1").await.unwrap());
        assert!(!restarted.db().has_store("taxi-calculator-offline-runtime-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_install_precaches_once() {
        let net = Arc::new(StubNetwork::new());
        serve_app(&net);
        net.set_delay(std::time::Duration::from_millis(50));
        let db = CacheDb::open_in_memory().await.unwrap();
        let w = worker(config(&["/"]), net.clone(), db).await;

        let (first, second) = tokio::join!(w.install(), w.install());
        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::InvalidState(msg)) if msg.contains("in progress")));
        assert_eq!(net.hits(), 1);
        assert_eq!(w.phase(), Phase::Installed);
    }
}
