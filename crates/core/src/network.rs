//! The worker's only way out to the network.

use async_trait::async_trait;

use crate::Error;
use crate::request::{Request, Response};

/// Performs real network requests on behalf of the worker.
///
/// Implementations return every HTTP response, whatever its status, as
/// `Ok`; only transport failures (no connectivity, timeouts, oversized
/// bodies) are errors. Caching decisions are made by the caller.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, Error>;
}
