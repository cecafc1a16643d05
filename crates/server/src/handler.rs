//! MCP server handler implementation.
//!
//! This module defines the event host: each tool dispatches one worker event
//! or cache maintenance call.
use std::sync::Arc;

use crate::tools::cache::{CacheKeysParams, CachePurgeParams, keys_impl, purge_impl};
use crate::tools::fetch::{FetchParams, Revalidations, fetch_impl};
use crate::tools::lifecycle::{activate_impl, install_impl};
use crate::tools::message::{MessageParams, message_impl};

use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};
use taxi_offline_core::{Network, OfflineWorker};

/// The MCP server handler hosting one offline worker.
#[derive(Clone)]
pub struct OfflineWorkerServer {
    worker: Arc<OfflineWorker>,
    /// Used for requests the worker does not intercept.
    native: Arc<dyn Network>,
    revalidations: Revalidations,
    tool_router: ToolRouter<Self>,
}

/// Tool router implementation using the #[tool_router] macro.
///
/// This macro generates the routing logic that maps tool names to handler methods.
#[tool_router]
impl OfflineWorkerServer {
    /// Create a new server handler.
    pub fn new(worker: Arc<OfflineWorker>, native: Arc<dyn Network>) -> Self {
        Self { worker, native, revalidations: Revalidations::default(), tool_router: Self::tool_router() }
    }

    /// Wait for background cache refreshes started by sw_fetch.
    pub async fn drain_revalidations(&self) -> usize {
        self.revalidations.drain().await
    }

    /// Install event: precache the manifest for the configured version.
    #[tool(description = "Install the worker: fetch and store every precache manifest URL (all or nothing). \
                          Activates immediately when skip-waiting is configured.")]
    async fn sw_install(&self) -> Result<CallToolResult, McpError> {
        install_impl(&self.worker).await
    }

    /// Activate event: delete outdated stores and claim pages.
    #[tool(description = "Activate the installed worker: delete cache stores of other versions and claim open pages.")]
    async fn sw_activate(&self) -> Result<CallToolResult, McpError> {
        activate_impl(&self.worker).await
    }

    /// Fetch event.
    #[tool(description = "Intercept a page request and answer it from cache or network according to the route table.")]
    async fn sw_fetch(&self, params: Parameters<FetchParams>) -> Result<CallToolResult, McpError> {
        fetch_impl(&self.worker, self.native.as_ref(), &self.revalidations, params.0).await
    }

    /// Message event.
    #[tool(description = "Post a control message to the worker, e.g. {\"type\": \"SKIP_WAITING\"}.")]
    async fn sw_message(&self, params: Parameters<MessageParams>) -> Result<CallToolResult, McpError> {
        message_impl(&self.worker, params.0).await
    }

    /// List stores or store entries.
    #[tool(description = "List cache store names, or the entry URLs of one store.")]
    async fn cache_keys(&self, params: Parameters<CacheKeysParams>) -> Result<CallToolResult, McpError> {
        keys_impl(&self.worker, params.0).await
    }

    /// Apply expiration bounds.
    #[tool(description = "Evict runtime cache entries beyond the age and count bounds of the expiring routes.")]
    async fn cache_purge(&self, params: Parameters<CachePurgeParams>) -> Result<CallToolResult, McpError> {
        purge_impl(&self.worker, params.0).await
    }
}

impl ServerHandler for OfflineWorkerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "offline-worker".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
