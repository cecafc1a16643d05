//! cache_keys tool implementation.
//!
//! Lists store names, or the entry URLs of one store.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use taxi_offline_core::{Error, OfflineWorker};

use crate::tools::json_result;

/// Parameters for the cache_keys tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CacheKeysParams {
    /// List the entries of this store instead of the store names.
    pub store: Option<String>,
}

/// Output from the cache_keys tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheKeysOutput {
    pub store: Option<String>,
    pub keys: Vec<String>,
}

/// Implementation of the cache_keys tool.
pub async fn keys_impl(worker: &OfflineWorker, params: CacheKeysParams) -> Result<CallToolResult, McpError> {
    let keys = match &params.store {
        None => worker.keys().await?,
        Some(store) => {
            if !worker.db().has_store(store).await? {
                return Err(Error::CacheMiss(format!("no store named {store}")).into());
            }
            worker.db().entry_urls(store).await?
        }
    };

    json_result(&CacheKeysOutput { store: params.store, keys })
}
