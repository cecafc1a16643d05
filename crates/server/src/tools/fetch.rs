//! sw_fetch tool implementation.
//!
//! Runs one request through the worker's fetch handler. Requests the worker
//! does not intercept are performed natively, as the browser would.

use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use taxi_offline_core::{Destination, FetchOutcome, Network, OfflineWorker, PassReason, Request, Response, Source};
use tokio::task::{JoinHandle, JoinSet};

use super::json_result;
use crate::error::HostError;

/// Parameters for the sw_fetch tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FetchParams {
    /// Absolute URL requested by the page.
    pub url: String,

    /// HTTP method (default: GET).
    #[serde(default = "default_method")]
    pub method: String,

    /// Request destination: document, style, script, image, font or empty.
    #[serde(default)]
    pub destination: Destination,

    /// Optional request body, e.g. the JSON sent to /oblicz.
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".into()
}

/// How the response was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Cache,
    Network,
    OfflineFallback,
    /// Not intercepted; fetched natively.
    Passthrough,
}

impl From<Source> for Origin {
    fn from(source: Source) -> Self {
        match source {
            Source::Cache => Origin::Cache,
            Source::Network => Origin::Network,
            Source::OfflineFallback => Origin::OfflineFallback,
        }
    }
}

/// How `FetchOutput::body` is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Utf8,
    /// Standard base64, used for bodies that are not valid UTF-8.
    Base64,
}

/// Output from the sw_fetch tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FetchOutput {
    pub url: String,
    pub status: u16,
    pub origin: Origin,
    /// Bucket of the route that answered (absent for passthrough).
    pub bucket: Option<String>,
    /// Why the worker left the request alone (passthrough only).
    pub passthrough_reason: Option<String>,
    /// A background cache refresh was started.
    pub revalidating: bool,
    pub headers: Vec<(String, String)>,
    pub encoding: BodyEncoding,
    pub body: String,
}

impl FetchOutput {
    fn new(response: Response, origin: Origin) -> Self {
        let (encoding, body) = match std::str::from_utf8(&response.body) {
            Ok(text) => (BodyEncoding::Utf8, text.to_string()),
            Err(_) => (BodyEncoding::Base64, STANDARD.encode(&response.body)),
        };
        Self {
            url: response.url,
            status: response.status,
            origin,
            bucket: None,
            passthrough_reason: None,
            revalidating: false,
            headers: response.headers,
            encoding,
            body,
        }
    }
}

/// Background cache refreshes started by sw_fetch.
///
/// The tool answers as soon as the stale copy is served; the refresh keeps
/// running here until it finishes or the host drains the set on shutdown.
#[derive(Clone, Default)]
pub struct Revalidations {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Revalidations {
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "revalidation task aborted");
            }
        });
    }

    /// Wait for every refresh still running. Returns how many were awaited.
    pub async fn drain(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let mut awaited = 0;
        while tasks.join_next().await.is_some() {
            awaited += 1;
        }
        awaited
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Implementation of the sw_fetch tool.
pub async fn fetch_impl(
    worker: &OfflineWorker, native: &dyn Network, revalidations: &Revalidations, params: FetchParams,
) -> Result<CallToolResult, McpError> {
    if params.body.is_some() && matches!(params.method.trim().to_ascii_uppercase().as_str(), "GET" | "HEAD") {
        return Err(HostError::InvalidInput(format!("{} request cannot have a body", params.method)).into());
    }
    let request = Request::parse(&params.method, &params.url, params.destination, params.body.map(Bytes::from))?;

    let output = match worker.handle_fetch(request.clone()).await? {
        FetchOutcome::Served(served) => {
            let revalidating = match served.revalidation {
                Some(handle) => {
                    revalidations.track(handle);
                    true
                }
                None => false,
            };
            FetchOutput {
                bucket: Some(served.bucket.to_string()),
                revalidating,
                ..FetchOutput::new(served.response, served.source.into())
            }
        }
        FetchOutcome::Passthrough(reason) => {
            let response = native.fetch(&request).await?;
            let reason = match reason {
                PassReason::NotActive => "not_active",
                PassReason::CrossOrigin => "cross_origin",
            };
            FetchOutput { passthrough_reason: Some(reason.to_string()), ..FetchOutput::new(response, Origin::Passthrough) }
        }
    };

    json_result(&output)
}
