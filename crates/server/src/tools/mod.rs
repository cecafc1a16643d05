//! MCP tool implementations.
//!
//! Each tool dispatches one worker event (or a cache maintenance call) and
//! returns its outcome as pretty-printed JSON.

pub mod cache;
pub mod fetch;
pub mod lifecycle;
pub mod message;

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

use crate::error::HostError;

/// Serialize a tool output as a single text content block.
pub fn json_result<T: Serialize>(output: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(output).map_err(|e| HostError::Output(e.to_string()))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}
