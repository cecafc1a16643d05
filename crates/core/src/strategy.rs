//! Caching strategy executors.
//!
//! Each executor takes the request, the route that matched it and the store
//! handles, and produces the response for the page. Background work that
//! must outlive the response (revalidation) is handed back as a join handle
//! so the host can keep the event alive until it finishes.

use std::sync::Arc;

use tokio::task::JoinHandle;
use url::Url;

use crate::Error;
use crate::cache::{CacheDb, CacheEntry, now_ms};
use crate::network::Network;
use crate::request::{Request, Response};
use crate::routing::{Expiration, Route, Strategy};

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Cache,
    Network,
    OfflineFallback,
}

/// A response produced by a strategy.
#[derive(Debug)]
pub struct Served {
    pub response: Response,
    pub source: Source,
    /// Bucket of the route that answered.
    pub bucket: &'static str,
    /// Background cache refresh still running, if any.
    pub revalidation: Option<JoinHandle<()>>,
}

/// Stores and collaborators shared by every strategy.
#[derive(Clone)]
pub struct StrategyContext {
    pub db: CacheDb,
    pub network: Arc<dyn Network>,
    pub precache_store: String,
    pub runtime_store: String,
    /// Page served to navigations when the network is unreachable.
    pub offline_fallback: Url,
}

impl StrategyContext {
    /// Run the strategy of `route` for `request`.
    pub async fn execute(&self, route: &Route, request: &Request) -> Result<Served, Error> {
        match route.strategy {
            Strategy::CacheFirst => self.cache_first(route, request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(route, request).await,
            Strategy::CacheFirstExpiring(exp) => self.cache_first_expiring(route, exp, request).await,
        }
    }

    async fn cache_first(&self, route: &Route, request: &Request) -> Result<Served, Error> {
        if let Some(hit) = self
            .db
            .match_request(&[self.precache_store.as_str(), self.runtime_store.as_str()], request)
            .await?
        {
            tracing::debug!(url = %request.url, bucket = route.bucket, "cache hit");
            return Ok(served(hit.response, Source::Cache, route));
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                self.store_if_cacheable(route, request, &response).await;
                Ok(served(response, Source::Network, route))
            }
            Err(err) if err.is_network_failure() && request.is_navigation() => {
                let fallback = Request::get(self.offline_fallback.clone());
                match self
                    .db
                    .match_request(&[self.precache_store.as_str(), self.runtime_store.as_str()], &fallback)
                    .await?
                {
                    Some(page) => {
                        tracing::debug!(url = %request.url, fallback = %fallback.url, "offline, serving fallback page");
                        Ok(served(page.response, Source::OfflineFallback, route))
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn stale_while_revalidate(&self, route: &Route, request: &Request) -> Result<Served, Error> {
        let cached = self
            .db
            .match_request(&[self.runtime_store.as_str(), self.precache_store.as_str()], request)
            .await?;

        match cached {
            Some(hit) => {
                tracing::debug!(url = %request.url, bucket = route.bucket, "serving stale, revalidating");
                let handle = self.spawn_revalidation(route.clone(), request.clone());
                Ok(Served { revalidation: Some(handle), ..served(hit.response, Source::Cache, route) })
            }
            None => {
                let response = self.network.fetch(request).await?;
                self.store_if_cacheable(route, request, &response).await;
                Ok(served(response, Source::Network, route))
            }
        }
    }

    async fn cache_first_expiring(&self, route: &Route, exp: Expiration, request: &Request) -> Result<Served, Error> {
        if let Some(hit) = self.db.match_request(&[self.precache_store.as_str()], request).await? {
            return Ok(served(hit.response, Source::Cache, route));
        }

        if let Some(hit) = self.db.match_request(&[self.runtime_store.as_str()], request).await? {
            if hit.age_ms(now_ms()) <= exp.max_age_ms() {
                tracing::debug!(url = %request.url, bucket = route.bucket, "cache hit");
                return Ok(served(hit.response, Source::Cache, route));
            }
            tracing::debug!(url = %request.url, bucket = route.bucket, "cached entry expired");
            self.db.delete_entry(&self.runtime_store, &hit.key).await?;
        }

        let response = self.network.fetch(request).await?;
        if self.store_if_cacheable(route, request, &response).await
            && let Err(e) = enforce_expiration(&self.db, &self.runtime_store, route.bucket, exp).await
        {
            tracing::warn!(bucket = route.bucket, error = %e, "expiration pass failed");
        }
        Ok(served(response, Source::Network, route))
    }

    /// Copy `response` into the runtime store when the route allows it.
    ///
    /// Returns whether anything was written. A failed write is logged; the
    /// page still gets the response.
    async fn store_if_cacheable(&self, route: &Route, request: &Request, response: &Response) -> bool {
        match store_if_cacheable(&self.db, &self.runtime_store, route, request, response).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(url = %request.url, error = %e, "failed to store response");
                false
            }
        }
    }

    fn spawn_revalidation(&self, route: Route, request: Request) -> JoinHandle<()> {
        let db = self.db.clone();
        let network = Arc::clone(&self.network);
        let store = self.runtime_store.clone();

        tokio::spawn(async move {
            let result = match network.fetch(&request).await {
                Ok(response) => store_if_cacheable(&db, &store, &route, &request, &response).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => tracing::debug!(url = %request.url, "revalidated"),
                Ok(false) => tracing::debug!(url = %request.url, "revalidation response not cacheable"),
                Err(e) => tracing::warn!(url = %request.url, error = %e, "revalidation failed"),
            }
        })
    }
}

fn served(response: Response, source: Source, route: &Route) -> Served {
    Served { response, source, bucket: route.bucket, revalidation: None }
}

async fn store_if_cacheable(
    db: &CacheDb, store: &str, route: &Route, request: &Request, response: &Response,
) -> Result<bool, Error> {
    if !request.is_get() || !route.is_cacheable(response.status) {
        tracing::debug!(
            url = %request.url,
            method = %request.method,
            status = response.status,
            "response not cached"
        );
        return Ok(false);
    }
    db.put_entry(store, &CacheEntry::new(request, route.bucket, response.clone()))
        .await?;
    Ok(true)
}

/// Trim a bucket to its age and size bounds, oldest first.
///
/// Returns the number of evicted entries.
pub async fn enforce_expiration(db: &CacheDb, store: &str, bucket: &str, exp: Expiration) -> Result<u64, Error> {
    let cutoff = now_ms().saturating_sub(exp.max_age_ms());
    let expired = db.evict_older_than(store, bucket, cutoff).await?;
    let overflow = db.evict_oldest(store, bucket, exp.max_entries).await?;
    if expired + overflow > 0 {
        tracing::debug!(bucket, expired, overflow, "evicted cache entries");
    }
    Ok(expired + overflow)
}
