//! cache_purge tool implementation.
//!
//! Applies the age and entry-count bounds of the expiring routes to the
//! runtime store.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use taxi_offline_core::OfflineWorker;

use crate::tools::json_result;

/// Parameters for the cache_purge tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeParams {
    /// Only trim this bucket (e.g. "images"); all expiring buckets when absent.
    pub bucket: Option<String>,
}

/// Output from the cache_purge tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeOutput {
    /// Number of entries deleted.
    pub deleted: u64,
}

/// Implementation of the cache_purge tool.
pub async fn purge_impl(worker: &OfflineWorker, params: CachePurgeParams) -> Result<CallToolResult, McpError> {
    let deleted = worker.purge(params.bucket.as_deref()).await?;
    json_result(&CachePurgeOutput { deleted })
}
