//! Admin surface: catalog browsing and tool installation from the host.
//!
//! Every failure is reported as a textual tool result with `isError` set,
//! never as a protocol fault, so a bad request cannot end the session.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::catalog::Catalog;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::GatewayRegistry;
use crate::mcp_client::types::{
    CallToolParams, CallToolResult, JsonRpcError, Resource, TextResourceContents, Tool,
    GATEWAY_VERSION,
};

use super::{tool_result, UpstreamSurface};

pub const LIST_AVAILABLE_TOOL: &str = "mcp-gate-list-available";
pub const INSTALL_TOOL: &str = "mcp-gate-install-tool";
pub const LIST_INSTALLED_TOOL: &str = "mcp-gate-list-installed";
pub const REMOVE_TOOL: &str = "mcp-gate-remove-tool";

pub const VERSION_URI: &str = "mcpgate://version";
const VERSION_RESOURCE_NAME: &str = "mcp-gate-version";

/// Required argument of the install and remove tools.
const TOOLNAME_ARG: &str = "toolname";

pub struct AdminSurface {
    catalog: Arc<Catalog>,
    registry: Arc<GatewayRegistry>,
}

impl AdminSurface {
    pub fn new(catalog: Arc<Catalog>, registry: Arc<GatewayRegistry>) -> Self {
        Self { catalog, registry }
    }

    fn list_available(&self) -> CallToolResult {
        let mut text = String::from("List of mcp-server-tools that can be installed and can be used.\n\n");
        for entry in self.catalog.entries() {
            let _ = writeln!(text, "{}", entry.summary());
        }
        CallToolResult::text(text)
    }

    async fn install(&self, params: &CallToolParams) -> CallToolResult {
        let name = match params.require_string(TOOLNAME_ARG) {
            Ok(name) => name,
            Err(reason) => return CallToolResult::error(reason),
        };
        let Some(entry) = self.catalog.get(name) else {
            let err = McpError::NotFound {
                name: name.to_string(),
            };
            tracing::info!(tool = %name, "install requested for unknown tool");
            return CallToolResult::error(err.to_string());
        };

        match self.registry.install(entry).await {
            Ok(outcome) => match outcome.connect_error {
                None => CallToolResult::text(format!(
                    "the mcp-server-tool {name} is installed and can be used."
                )),
                Some(e) => CallToolResult::error(format!(
                    "the mcp-server-tool {name} was installed but failed to start: {e}"
                )),
            },
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    async fn list_installed(&self) -> CallToolResult {
        let clients = self.registry.list().await;
        if clients.is_empty() {
            return CallToolResult::text("no mcp-server-tools are installed.");
        }
        let mut text = String::from("Installed mcp-server-tools:\n\n");
        for client in clients {
            let _ = write!(text, "{}: {}", client.name, client.status);
            if let Some(server) = &client.server {
                let _ = write!(text, " ({} {})", server.name, server.version);
            }
            let _ = writeln!(
                text,
                ", {} tools, {} resources",
                client.tools, client.resources
            );
        }
        CallToolResult::text(text)
    }

    async fn remove(&self, params: &CallToolParams) -> CallToolResult {
        let name = match params.require_string(TOOLNAME_ARG) {
            Ok(name) => name,
            Err(reason) => return CallToolResult::error(reason),
        };
        match self.registry.remove(name).await {
            Ok(()) => CallToolResult::text(format!("the mcp-server-tool {name} was removed.")),
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    fn version_resource() -> Resource {
        Resource {
            uri: VERSION_URI.into(),
            name: VERSION_RESOURCE_NAME.into(),
            description: Some("The version of the installed mcp-gate.".into()),
            mime_type: Some("text/plain".into()),
            extra: Map::new(),
        }
    }
}

fn toolname_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            TOOLNAME_ARG: {"type": "string", "description": description}
        },
        "required": [TOOLNAME_ARG]
    })
}

#[async_trait]
impl UpstreamSurface for AdminSurface {
    fn label(&self) -> &'static str {
        "admin"
    }

    async fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                LIST_AVAILABLE_TOOL,
                "returns a list of available tools that can be installed in mcp-gate",
                json!({"type": "object", "properties": {}}),
            ),
            Tool::new(
                INSTALL_TOOL,
                "install an available tool into mcp-gate",
                toolname_schema("The name of the tool to install in mcp-gate"),
            ),
            Tool::new(
                LIST_INSTALLED_TOOL,
                "returns the tools installed in mcp-gate and their status",
                json!({"type": "object", "properties": {}}),
            ),
            Tool::new(
                REMOVE_TOOL,
                "stop and remove an installed tool from mcp-gate",
                toolname_schema("The name of the installed tool to remove"),
            ),
        ]
    }

    async fn resources(&self) -> Vec<Resource> {
        vec![Self::version_resource()]
    }

    async fn call_tool(&self, params: &CallToolParams) -> Option<Result<Value, JsonRpcError>> {
        let result = match params.name.as_str() {
            LIST_AVAILABLE_TOOL => self.list_available(),
            INSTALL_TOOL => self.install(params).await,
            LIST_INSTALLED_TOOL => self.list_installed().await,
            REMOVE_TOOL => self.remove(params).await,
            _ => return None,
        };
        Some(tool_result(result))
    }

    async fn read_resource(&self, uri: &str) -> Option<Result<Value, JsonRpcError>> {
        if uri != VERSION_URI {
            return None;
        }
        let contents = TextResourceContents {
            uri: VERSION_URI.into(),
            mime_type: "text/plain".into(),
            text: format!("version {GATEWAY_VERSION}"),
        };
        Some(Ok(json!({ "contents": [contents] })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::mcp_client::testing::MockTransport;
    use crate::mcp_client::ClientStatus;

    fn admin(entries: Vec<CatalogEntry>) -> (AdminSurface, Arc<GatewayRegistry>) {
        let catalog = Arc::new(Catalog::from_entries(entries).unwrap());
        let registry = Arc::new(GatewayRegistry::new());
        (AdminSurface::new(catalog, Arc::clone(&registry)), registry)
    }

    fn call(name: &str, arguments: Value) -> CallToolParams {
        CallToolParams {
            name: name.into(),
            arguments: Some(arguments),
        }
    }

    async fn run(surface: &AdminSurface, params: CallToolParams) -> CallToolResult {
        let value = surface.call_tool(&params).await.unwrap().unwrap();
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_list_available_formats_entries() {
        let (surface, _) = admin(vec![
            CatalogEntry::ipc("echo", "echo-server", vec!["--stdio".into()])
                .with_description("Echoes input"),
            CatalogEntry::http("remote", "http://localhost:3001/mcp"),
        ]);
        let result = run(&surface, call(LIST_AVAILABLE_TOOL, json!({}))).await;
        assert!(!result.is_error);
        let text = result.text_content();
        assert!(text.contains("Tool: echo"));
        assert!(text.contains("Echoes input"));
        assert!(text.contains("--stdio"));
        assert!(text.contains("Tool: remote"));
    }

    #[tokio::test]
    async fn test_install_missing_name_is_textual_error() {
        let (surface, registry) = admin(vec![]);
        let result = run(&surface, call(INSTALL_TOOL, json!({"toolname": "missing"}))).await;
        assert!(result.is_error);
        assert_eq!(result.text_content(), "tool 'missing' not found");
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_install_requires_toolname() {
        let (surface, _) = admin(vec![]);
        let result = run(&surface, call(INSTALL_TOOL, json!({}))).await;
        assert!(result.is_error);
        assert!(result.text_content().contains("toolname"));

        let result = run(&surface, call(INSTALL_TOOL, json!({"toolname": 7}))).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_install_unsupported_transport_is_textual_error() {
        let (surface, registry) = admin(vec![CatalogEntry::unsupported("remote", "grpc")]);
        let result = run(&surface, call(INSTALL_TOOL, json!({"toolname": "remote"}))).await;
        assert!(result.is_error);
        assert!(result.text_content().contains("grpc"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_install_failed_start_reports_and_stays_listed() {
        let (surface, registry) = admin(vec![CatalogEntry::ipc(
            "ghost",
            "/nonexistent/mcp-gate-test-binary",
            vec![],
        )]);
        let result = run(&surface, call(INSTALL_TOOL, json!({"toolname": "ghost"}))).await;
        assert!(result.is_error);
        assert!(result.text_content().contains("failed to start"));
        assert_eq!(registry.get("ghost").await.unwrap().status(), ClientStatus::Failed);

        let listed = run(&surface, call(LIST_INSTALLED_TOOL, json!({}))).await;
        assert!(listed.text_content().contains("ghost: failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_reports_success() {
        use crate::mcp_client::testing::ECHO_SERVER_SCRIPT;

        let (surface, registry) = admin(vec![CatalogEntry::ipc(
            "echo",
            "sh",
            vec!["-c".to_string(), ECHO_SERVER_SCRIPT.to_string()],
        )]);
        let result = run(&surface, call(INSTALL_TOOL, json!({"toolname": "echo"}))).await;
        assert!(!result.is_error, "{}", result.text_content());
        assert_eq!(
            result.text_content(),
            "the mcp-server-tool echo is installed and can be used."
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_installed_and_remove() {
        let (surface, registry) = admin(vec![]);
        let empty = run(&surface, call(LIST_INSTALLED_TOOL, json!({}))).await;
        assert_eq!(empty.text_content(), "no mcp-server-tools are installed.");

        registry
            .install_transport("alpha", MockTransport::server("alpha", &["search"]).boxed())
            .await
            .unwrap();
        let listed = run(&surface, call(LIST_INSTALLED_TOOL, json!({}))).await;
        assert!(listed.text_content().contains("alpha: connected (alpha 0.1.0), 1 tools"));

        let removed = run(&surface, call(REMOVE_TOOL, json!({"toolname": "alpha"}))).await;
        assert!(!removed.is_error);
        assert!(registry.is_empty().await);

        let again = run(&surface, call(REMOVE_TOOL, json!({"toolname": "alpha"}))).await;
        assert!(again.is_error);
        assert_eq!(again.text_content(), "tool 'alpha' not found");
    }

    #[tokio::test]
    async fn test_version_resource() {
        let (surface, _) = admin(vec![]);
        let resources = surface.resources().await;
        assert_eq!(resources[0].uri, VERSION_URI);
        assert_eq!(resources[0].name, "mcp-gate-version");

        let body = surface.read_resource(VERSION_URI).await.unwrap().unwrap();
        assert_eq!(body["contents"][0]["text"], format!("version {GATEWAY_VERSION}"));
        assert_eq!(body["contents"][0]["mimeType"], "text/plain");
        assert!(surface.read_resource("mcpgate://other").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_claimed() {
        let (surface, _) = admin(vec![]);
        assert!(surface.call_tool(&call("alpha.search", json!({}))).await.is_none());
    }
}
