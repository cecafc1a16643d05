//! sw_install / sw_activate tool implementations.
//!
//! Dispatch the install and activate lifecycle events to the worker.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::Serialize;
use taxi_offline_core::{ActivateReport, InstallReport, OfflineWorker, Phase};

use super::json_result;

/// Output from the sw_install tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct InstallOutput {
    #[serde(flatten)]
    pub report: InstallReport,
    /// Set when skip-waiting made the worker activate straight away.
    pub activation: Option<ActivateReport>,
    pub phase: Phase,
}

/// Implementation of the sw_install tool.
///
/// A worker that asked to skip waiting is activated in the same call.
pub async fn install_impl(worker: &OfflineWorker) -> Result<CallToolResult, McpError> {
    let report = worker.install().await?;

    let activation = if report.skip_waiting { Some(worker.activate().await?) } else { None };

    json_result(&InstallOutput { report, activation, phase: worker.phase() })
}

/// Implementation of the sw_activate tool.
pub async fn activate_impl(worker: &OfflineWorker) -> Result<CallToolResult, McpError> {
    let report = worker.activate().await?;
    json_result(&report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{TableNetwork, decode, worker};
    use serde_json::Value;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_install_activates_when_skipping_waiting() {
        let worker = worker(Arc::new(TableNetwork::with_app())).await;

        let result = install_impl(&worker).await.unwrap();
        let output: Value = decode(&result);
        assert_eq!(output["phase"], "activated");
        assert_eq!(output["precached"].as_array().unwrap().len(), 2);
        assert_eq!(output["activation"]["clients_claimed"], true);
    }

    #[tokio::test]
    async fn test_install_failure_is_tool_error() {
        let net = TableNetwork::default();
        net.serve("/", 200, "<html></html>");
        let worker = worker(Arc::new(net)).await;

        let err = install_impl(&worker).await.unwrap_err();
        assert_eq!(err.code.0, -32001);
        assert_eq!(worker.phase(), Phase::Redundant);
    }

    #[tokio::test]
    async fn test_activate_before_install_is_tool_error() {
        let worker = worker(Arc::new(TableNetwork::with_app())).await;
        let err = activate_impl(&worker).await.unwrap_err();
        assert_eq!(err.code.0, -32000);
    }
}
