//! sw_message tool implementation.
//!
//! Posts a control message (e.g. `{"type": "SKIP_WAITING"}`) to the worker.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use taxi_offline_core::OfflineWorker;

use super::json_result;

/// Parameters for the sw_message tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageParams {
    /// The message payload exactly as the page would post it.
    pub data: serde_json::Value,
}

/// Implementation of the sw_message tool.
pub async fn message_impl(worker: &OfflineWorker, params: MessageParams) -> Result<CallToolResult, McpError> {
    let outcome = worker.handle_message(&params.data).await?;
    json_result(&outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{TableNetwork, decode, worker};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use taxi_offline_core::Phase;

    #[tokio::test]
    async fn test_skip_waiting_message() {
        let worker = worker(Arc::new(TableNetwork::with_app())).await;
        worker.install().await.unwrap();

        let params = MessageParams { data: json!({"type": "SKIP_WAITING"}) };
        let output: Value = decode(&message_impl(&worker, params).await.unwrap());
        assert_eq!(output["outcome"], "activated");
        assert_eq!(worker.phase(), Phase::Activated);
    }

    #[tokio::test]
    async fn test_unknown_message() {
        let worker = worker(Arc::new(TableNetwork::with_app())).await;

        let params = MessageParams { data: json!({"type": "REFRESH"}) };
        let output: Value = decode(&message_impl(&worker, params).await.unwrap());
        assert_eq!(output["outcome"], "ignored");
    }
}
