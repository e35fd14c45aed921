//! Upstream side of the gateway: the MCP server the host talks to.
//!
//! The server's catalog of tools and resources is the union of its
//! [`UpstreamSurface`]s. The registry surface is always present; the admin
//! surface is optional and attaches without changing anything else.

pub mod admin;
pub mod server;

pub use admin::AdminSurface;
pub use server::GatewayServer;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::GatewayRegistry;
use crate::mcp_client::types::{CallToolParams, CallToolResult, JsonRpcError, Resource, Tool};

/// A set of tools and resources exposed to the upstream peer.
///
/// `call_tool` and `read_resource` return `None` when the name or URI does
/// not belong to this surface, so the server can ask the next one.
#[async_trait]
pub trait UpstreamSurface: Send + Sync {
    /// Short label for logs.
    fn label(&self) -> &'static str;

    async fn tools(&self) -> Vec<Tool>;

    async fn resources(&self) -> Vec<Resource>;

    async fn call_tool(&self, params: &CallToolParams) -> Option<Result<Value, JsonRpcError>>;

    async fn read_resource(&self, uri: &str) -> Option<Result<Value, JsonRpcError>>;
}

/// Encode a gateway-produced tool result.
pub(crate) fn tool_result(result: CallToolResult) -> Result<Value, JsonRpcError> {
    serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

// ─── Registry Surface ────────────────────────────────────────────────────────

/// The aggregated tools and resources of every connected downstream client.
pub struct RegistrySurface {
    registry: Arc<GatewayRegistry>,
}

impl RegistrySurface {
    pub fn new(registry: Arc<GatewayRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl UpstreamSurface for RegistrySurface {
    fn label(&self) -> &'static str {
        "registry"
    }

    async fn tools(&self) -> Vec<Tool> {
        self.registry.aggregate_tools().await
    }

    async fn resources(&self) -> Vec<Resource> {
        self.registry.aggregate_resources().await
    }

    async fn call_tool(&self, params: &CallToolParams) -> Option<Result<Value, JsonRpcError>> {
        match self
            .registry
            .call_tool(&params.name, params.arguments.clone())
            .await
        {
            Ok(result) => Some(Ok(result)),
            Err(McpError::NotFound { .. }) => None,
            // The downstream's own JSON-RPC error goes back as-is.
            Err(McpError::Server {
                code,
                message,
                data,
            }) => Some(Err(JsonRpcError {
                code,
                message,
                data,
            })),
            Err(e) => {
                tracing::warn!(tool = %params.name, error = %e, "forwarded tool call failed");
                Some(tool_result(CallToolResult::error(e.to_string())))
            }
        }
    }

    async fn read_resource(&self, uri: &str) -> Option<Result<Value, JsonRpcError>> {
        match self.registry.read_resource(uri).await {
            Ok(contents) => Some(Ok(contents)),
            Err(McpError::NotFound { .. }) => None,
            Err(McpError::Server {
                code,
                message,
                data,
            }) => Some(Err(JsonRpcError {
                code,
                message,
                data,
            })),
            Err(e) => {
                tracing::warn!(uri, error = %e, "forwarded resource read failed");
                Some(Err(JsonRpcError::internal_error(e.to_string())))
            }
        }
    }
}
