//! Upstream MCP server over line-delimited JSON-RPC.
//!
//! Each request is handled on its own task, so a slow downstream call never
//! holds up the rest of the session. Responses and notifications funnel
//! through a single writer task. A panicking handler answers its own request
//! with an internal error and leaves the session running.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use crate::catalog::Catalog;
use crate::mcp_client::registry::{GatewayRegistry, RegistryEvent};
use crate::mcp_client::types::{
    methods, CallToolParams, Implementation, Incoming, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcResponse, ReadResourceParams, Resource, Tool, PROTOCOL_VERSION,
};

use super::admin::AdminSurface;
use super::{RegistrySurface, UpstreamSurface};

/// Protocol revisions the server will echo back if the host offers them.
const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Outbound traffic to the upstream peer.
enum Outbound {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

// ─── GatewayServer ───────────────────────────────────────────────────────────

pub struct GatewayServer {
    registry: Arc<GatewayRegistry>,
    surfaces: Vec<Arc<dyn UpstreamSurface>>,
}

impl GatewayServer {
    /// A server exposing the registry's aggregated tools and resources.
    pub fn new(registry: Arc<GatewayRegistry>) -> Self {
        let base: Arc<dyn UpstreamSurface> = Arc::new(RegistrySurface::new(Arc::clone(&registry)));
        Self {
            registry,
            surfaces: vec![base],
        }
    }

    /// Attach another surface. Earlier surfaces win name clashes.
    pub fn with_surface(mut self, surface: impl UpstreamSurface + 'static) -> Self {
        tracing::info!(surface = surface.label(), "upstream surface attached");
        self.surfaces.push(Arc::new(surface));
        self
    }

    /// Attach the catalog admin tools.
    pub fn with_admin_tools(self, catalog: Arc<Catalog>) -> Self {
        let admin = AdminSurface::new(catalog, Arc::clone(&self.registry));
        self.with_surface(admin)
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// Handle one raw line from the peer. Returns the response to send, if any.
    pub async fn handle_message(&self, raw: &str) -> Option<JsonRpcResponse> {
        let message: JsonRpcMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable message from upstream");
                return Some(JsonRpcResponse::failure(Value::Null, JsonRpcError::parse_error(e)));
            }
        };
        let fallback_id = message.id.clone().unwrap_or(Value::Null);

        match message.classify() {
            Some(Incoming::Request { id, method, params }) => {
                let handled = AssertUnwindSafe(self.dispatch(&method, params))
                    .catch_unwind()
                    .await;
                Some(match handled {
                    Ok(Ok(result)) => JsonRpcResponse::success(id, result),
                    Ok(Err(error)) => JsonRpcResponse::failure(id, error),
                    Err(_) => {
                        tracing::error!(method = %method, "request handler panicked");
                        JsonRpcResponse::failure(
                            id,
                            JsonRpcError::internal_error(format!("handler for '{method}' panicked")),
                        )
                    }
                })
            }
            Some(Incoming::Notification(notification)) => {
                tracing::debug!(method = %notification.method, "upstream notification");
                None
            }
            Some(Incoming::Response(_)) => {
                tracing::debug!("ignoring response from upstream");
                None
            }
            None => Some(JsonRpcResponse::failure(
                fallback_id,
                JsonRpcError::invalid_request("not a JSON-RPC request or notification"),
            )),
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => Ok(self.initialize(params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.tools().await })),
            "tools/call" => self.call_tool(parse_params(params)?).await,
            "resources/list" => Ok(json!({ "resources": self.resources().await })),
            "resources/read" => {
                let ReadResourceParams { uri } = parse_params(params)?;
                self.read_resource(&uri).await
            }
            "resources/templates/list" => Ok(json!({ "resourceTemplates": [] })),
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    fn initialize(&self, params: Option<&Value>) -> Value {
        let offered = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let version = match offered {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v,
            _ => PROTOCOL_VERSION,
        };
        if let Some(client) = params.and_then(|p| p.get("clientInfo")) {
            tracing::info!(client = %client, protocol = version, "upstream peer initialized");
        }
        json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "listChanged": true }
            },
            "serverInfo": Implementation::gateway()
        })
    }

    /// Tools of every surface, first surface wins on a name clash.
    pub async fn tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = Vec::new();
        for surface in &self.surfaces {
            for tool in surface.tools().await {
                if tools.iter().any(|t| t.name == tool.name) {
                    tracing::warn!(tool = %tool.name, surface = surface.label(), "shadowed tool skipped");
                    continue;
                }
                tools.push(tool);
            }
        }
        tools
    }

    /// Resources of every surface, first surface wins on a URI clash.
    pub async fn resources(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> = Vec::new();
        for surface in &self.surfaces {
            for resource in surface.resources().await {
                if resources.iter().any(|r| r.uri == resource.uri) {
                    continue;
                }
                resources.push(resource);
            }
        }
        resources
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<Value, JsonRpcError> {
        for surface in &self.surfaces {
            if let Some(result) = surface.call_tool(&params).await {
                return result;
            }
        }
        Err(JsonRpcError::invalid_params(format!("unknown tool '{}'", params.name)))
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, JsonRpcError> {
        for surface in &self.surfaces {
            if let Some(result) = surface.read_resource(uri).await {
                return result;
            }
        }
        Err(JsonRpcError::invalid_params(format!("unknown resource '{uri}'")))
    }

    // ─── Serving ─────────────────────────────────────────────────────────

    /// Serve the host over this process's stdin/stdout.
    pub async fn serve_stdio(self: Arc<Self>) -> std::io::Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }

    /// Serve one session until `reader` reaches EOF, then stop every
    /// downstream client.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_outbound(writer, out_rx));
        let forwarder = tokio::spawn(forward_events(self.registry.subscribe(), out_tx.clone()));

        let mut handlers = JoinSet::new();
        let mut lines = reader.lines();
        let read_result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if line.trim().is_empty() {
                continue;
            }
            let server = Arc::clone(&self);
            let out = out_tx.clone();
            handlers.spawn(async move {
                if let Some(response) = server.handle_message(&line).await {
                    let _ = out.send(Outbound::Response(response));
                }
            });
            // Reap finished handlers so the set does not grow without bound.
            while handlers.try_join_next().is_some() {}
        };

        tracing::info!("upstream closed, shutting down");
        while handlers.join_next().await.is_some() {}
        forwarder.abort();
        self.registry.shutdown().await;

        drop(out_tx);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "upstream writer failed"),
            Err(e) => tracing::warn!(error = %e, "upstream writer task failed"),
        }
        read_result
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("missing params"))?;
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

async fn write_outbound<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let encoded = match &message {
            Outbound::Response(response) => serde_json::to_string(response),
            Outbound::Notification(notification) => serde_json::to_string(notification),
        };
        let mut line = match encoded {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outbound message");
                continue;
            }
        };
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Turn registry change events into upstream `list_changed` notifications.
async fn forward_events(
    mut events: broadcast::Receiver<RegistryEvent>,
    out: mpsc::UnboundedSender<Outbound>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "registry events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let method = match event {
            RegistryEvent::ToolsChanged => methods::TOOLS_LIST_CHANGED,
            RegistryEvent::ResourcesChanged => methods::RESOURCES_LIST_CHANGED,
        };
        if out
            .send(Outbound::Notification(JsonRpcNotification::new(method, None)))
            .is_err()
        {
            return;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::mcp_client::testing::MockTransport;
    use async_trait::async_trait;

    fn server() -> GatewayServer {
        GatewayServer::new(Arc::new(GatewayRegistry::new()))
    }

    async fn request(server: &GatewayServer, method: &str, params: Value) -> JsonRpcResponse {
        let raw = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}).to_string();
        server.handle_message(&raw).await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_reports_gateway_identity() {
        let response = request(
            &server(),
            "initialize",
            json!({"protocolVersion": "2024-11-05", "capabilities": {}, "clientInfo": {"name": "host", "version": "1"}}),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "MCP-Gate");
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert!(result["capabilities"]["tools"].is_object());

        let response = request(&server(), "initialize", json!({"protocolVersion": "1999-01-01"})).await;
        assert_eq!(response.result.unwrap()["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_core_works_without_admin_surface() {
        let registry = Arc::new(GatewayRegistry::new());
        registry
            .install_transport("alpha", MockTransport::server("alpha", &["search"]).boxed())
            .await
            .unwrap();
        let plain = GatewayServer::new(Arc::clone(&registry));

        let tools = request(&plain, "tools/list", json!({})).await.result.unwrap();
        let names: Vec<_> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["alpha.search"]);

        let called = request(&plain, "tools/call", json!({"name": "alpha.search", "arguments": {}})).await;
        assert_eq!(called.result.unwrap()["content"][0]["text"], "called search");

        let unknown = request(&plain, "tools/call", json!({"name": INSTALL, "arguments": {}})).await;
        assert_eq!(unknown.error.unwrap().code, -32602);
    }

    const INSTALL: &str = "mcp-gate-install-tool";

    #[tokio::test]
    async fn test_admin_surface_is_additive() {
        let registry = Arc::new(GatewayRegistry::new());
        registry
            .install_transport("alpha", MockTransport::server("alpha", &["search"]).boxed())
            .await
            .unwrap();
        let catalog = Arc::new(Catalog::from_entries(vec![]).unwrap());
        let with_admin = GatewayServer::new(Arc::clone(&registry)).with_admin_tools(catalog);

        let tools = with_admin.tools().await;
        assert_eq!(tools[0].name, "alpha.search");
        assert!(tools.iter().any(|t| t.name == INSTALL));
        assert_eq!(tools.len(), 5);

        let resources = with_admin.resources().await;
        assert!(resources.iter().any(|r| r.uri == "mcpgate://version"));
        assert!(resources.iter().any(|r| r.uri == "mem://alpha/readme"));

        let missing = request(&with_admin, "tools/call", json!({"name": INSTALL, "arguments": {"toolname": "missing"}})).await;
        let result = missing.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "tool 'missing' not found");
    }

    #[tokio::test]
    async fn test_resources_read_routes_by_uri() {
        let catalog = Arc::new(Catalog::from_entries(vec![CatalogEntry::http("remote", "http://localhost:3001/mcp")]).unwrap());
        let srv = server().with_admin_tools(catalog);
        let body = request(&srv, "resources/read", json!({"uri": "mcpgate://version"})).await;
        assert!(body.result.unwrap()["contents"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("version "));

        let missing = request(&srv, "resources/read", json!({"uri": "mem://nope"})).await;
        assert_eq!(missing.error.unwrap().code, -32602);

        let bad = request(&srv, "resources/read", json!({})).await;
        assert_eq!(bad.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let srv = server();
        let unknown = request(&srv, "prompts/get", json!({})).await;
        assert_eq!(unknown.error.unwrap().code, -32601);

        let garbage = srv.handle_message("{not json").await.unwrap();
        assert_eq!(garbage.error.unwrap().code, -32700);

        let invalid = srv.handle_message(r#"{"jsonrpc":"2.0","id":4}"#).await.unwrap();
        assert_eq!(invalid.error.unwrap().code, -32600);
        assert_eq!(invalid.id, json!(4));

        assert!(srv
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
        let pong = request(&srv, "ping", json!({})).await;
        assert_eq!(pong.result.unwrap(), json!({}));
    }

    struct Exploding;

    #[async_trait]
    impl UpstreamSurface for Exploding {
        fn label(&self) -> &'static str {
            "exploding"
        }
        async fn tools(&self) -> Vec<Tool> {
            vec![Tool::new("boom", "panics", json!({"type": "object"}))]
        }
        async fn resources(&self) -> Vec<Resource> {
            Vec::new()
        }
        async fn call_tool(&self, _params: &CallToolParams) -> Option<Result<Value, JsonRpcError>> {
            panic!("boom");
        }
        async fn read_resource(&self, _uri: &str) -> Option<Result<Value, JsonRpcError>> {
            None
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_yields_internal_error() {
        let srv = server().with_surface(Exploding);
        let response = request(&srv, "tools/call", json!({"name": "boom"})).await;
        assert_eq!(response.error.unwrap().code, -32603);

        // The server keeps answering.
        let pong = request(&srv, "ping", json!({})).await;
        assert!(pong.error.is_none());
    }

    #[tokio::test]
    async fn test_serve_session_and_shutdown_on_eof() {
        let registry = Arc::new(GatewayRegistry::new());
        let outcome = registry
            .install_transport("alpha", MockTransport::server("alpha", &["search"]).boxed())
            .await
            .unwrap();
        let srv = Arc::new(GatewayServer::new(Arc::clone(&registry)));

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n"
        );
        let (mut client_end, server_end) = tokio::io::duplex(64 * 1024);
        let reader = BufReader::new(input.as_bytes());
        srv.serve(reader, server_end).await.unwrap();

        let mut output = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client_end, &mut output)
            .await
            .unwrap();
        let responses: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .filter(|v: &Value| v.get("id").is_some())
            .collect();
        assert_eq!(responses.len(), 2);
        let list = responses.iter().find(|v| v["id"] == 2).unwrap();
        assert_eq!(list["result"]["tools"][0]["name"], "alpha.search");

        assert!(registry.is_empty().await);
        assert_eq!(outcome.client.status(), crate::mcp_client::ClientStatus::Stopped);
    }
}
