//! Test doubles shared by the client, registry and upstream tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::errors::McpError;
use super::transport::{NotificationSink, Transport};
use super::types::{JsonRpcError, JsonRpcNotification, JsonRpcResponse};

type Responder = dyn Fn(&str, Option<&Value>) -> Result<Value, JsonRpcError> + Send + Sync;

/// Observable side of a [`MockTransport`], kept by the test after the
/// transport is boxed and handed to a client.
#[derive(Clone, Default)]
pub struct MockProbe {
    requests: Arc<Mutex<Vec<String>>>,
    notifications_sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    sink: Arc<Mutex<Option<NotificationSink>>>,
}

impl MockProbe {
    /// Methods of every request the transport received, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn sent_notifications(&self) -> Vec<String> {
        self.notifications_sent.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Push a server-initiated notification as if it arrived on the wire.
    pub fn push_notification(&self, method: &str) {
        let sink = self.sink.lock().unwrap();
        sink.as_ref()
            .expect("transport not started")
            .send(JsonRpcNotification::new(method, None))
            .unwrap();
    }
}

/// Scripted in-memory transport.
pub struct MockTransport {
    responder: Arc<Responder>,
    probe: MockProbe,
    fail_start: bool,
    fail_close: bool,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, Option<&Value>) -> Result<Value, JsonRpcError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            probe: MockProbe::default(),
            fail_start: false,
            fail_close: false,
            delay: None,
        }
    }

    /// A server advertising tools and resources, reporting one tool per name
    /// and a single resource.
    pub fn server(server_name: &str, tools: &[&str]) -> Self {
        let server_name = server_name.to_string();
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| json!({"name": t, "description": format!("{t} tool"), "inputSchema": {"type": "object"}}))
            .collect();
        Self::new(move |method, params| match method {
            "initialize" => Ok(initialize_result(&server_name, true, true)),
            "tools/list" => Ok(json!({ "tools": tools })),
            "resources/list" => Ok(json!({
                "resources": [{"uri": format!("mem://{server_name}/readme"), "name": "readme"}]
            })),
            "tools/call" => {
                let name = params.and_then(|p| p["name"].as_str()).unwrap_or_default();
                Ok(json!({"content": [{"type": "text", "text": format!("called {name}")}]}))
            }
            "resources/read" => {
                let uri = params.and_then(|p| p["uri"].as_str()).unwrap_or_default();
                Ok(json!({"contents": [{"uri": uri, "text": "hello"}]}))
            }
            other => Err(JsonRpcError::method_not_found(other)),
        })
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Delay every request, to exercise deadlines.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    pub fn boxed(self) -> Box<dyn Transport> {
        Box::new(self)
    }
}

/// An `initialize` result with the given capability flags.
pub fn initialize_result(server_name: &str, tools: bool, resources: bool) -> Value {
    let mut capabilities = serde_json::Map::new();
    if tools {
        capabilities.insert("tools".into(), json!({"listChanged": true}));
    }
    if resources {
        capabilities.insert("resources".into(), json!({}));
    }
    json!({
        "protocolVersion": "2025-03-26",
        "capabilities": capabilities,
        "serverInfo": {"name": server_name, "version": "0.1.0"}
    })
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn start(&mut self, notifications: NotificationSink) -> Result<(), McpError> {
        if self.fail_start {
            return Err(McpError::Transport {
                server: "mock".into(),
                reason: "failed to spawn".into(),
            });
        }
        *self.probe.sink.lock().unwrap() = Some(notifications);
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        self.probe.requests.lock().unwrap().push(method.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let id = Value::from(1);
        Ok(match (self.responder)(method, params.as_ref()) {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), McpError> {
        self.probe
            .notifications_sent
            .lock()
            .unwrap()
            .push(method.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        self.probe.sink.lock().unwrap().take();
        if self.fail_close {
            return Err(McpError::Transport {
                server: "mock".into(),
                reason: "close failed".into(),
            });
        }
        Ok(())
    }
}

/// A POSIX shell MCP server that answers `initialize` and reports one tool
/// named `echo`.
#[cfg(unix)]
pub const ECHO_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"echo-server","version":"1.0.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo back the input","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
  esac
done
"#;
