//! Downstream client: one connection to one downstream MCP server.
//!
//! Owns its transport exclusively and tracks a small state machine:
//!
//! ```text
//! Uninitialized ──connect──▶ Connected ──stop──▶ Stopped
//!        │                       │
//!        └──────────┬────────────┘
//!                   ▼
//!                 Failed
//! ```
//!
//! `Stopped` and `Failed` are terminal. The negotiated server info exists
//! exactly while the client is `Connected`. Every suspending operation runs
//! under one deadline that covers waiting for the transport as well as the
//! exchange itself; dropping the operation releases its pending request.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use super::errors::McpError;
use super::transport::{extract_result, Transport};
use super::types::{
    methods, InitializeParams, InitializeResult, JsonRpcNotification, ListResourcesResult,
    ListToolsResult, Resource, Tool, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default deadline for connect, list, call and stop.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on `nextCursor` pages followed in one listing.
const MAX_PAGES: usize = 64;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Lifecycle status of a downstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientStatus {
    Uninitialized,
    Connected,
    Stopped,
    Failed,
}

impl ClientStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientStatus::Stopped | ClientStatus::Failed)
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientStatus::Uninitialized => "uninitialized",
            ClientStatus::Connected => "connected",
            ClientStatus::Stopped => "stopped",
            ClientStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─── Notification Handling ───────────────────────────────────────────────────

/// Receives server-initiated notifications for a connected client.
///
/// Runs on the client's dispatch task, never on the transport read path.
/// Implementations should not block; spawn if work is needed.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, client: &str, notification: JsonRpcNotification);
}

impl<F> NotificationHandler for F
where
    F: Fn(&str, JsonRpcNotification) + Send + Sync,
{
    fn handle(&self, client: &str, notification: JsonRpcNotification) {
        self(client, notification)
    }
}

/// Default handler: log the method name.
pub struct LogNotifications;

impl NotificationHandler for LogNotifications {
    fn handle(&self, client: &str, notification: JsonRpcNotification) {
        tracing::info!(
            server = %client,
            method = %notification.method,
            "downstream notification"
        );
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Snapshot {
    status: ClientStatus,
    server_info: Option<InitializeResult>,
    tools: Vec<Tool>,
    resources: Vec<Resource>,
}

impl Snapshot {
    fn new() -> Self {
        Self {
            status: ClientStatus::Uninitialized,
            server_info: None,
            tools: Vec::new(),
            resources: Vec::new(),
        }
    }
}

// ─── DownstreamClient ────────────────────────────────────────────────────────

/// A connection to one downstream MCP server.
pub struct DownstreamClient {
    name: String,
    timeout: Duration,
    /// Held for the duration of every suspending operation, which orders
    /// operations on one client.
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    snapshot: RwLock<Snapshot>,
    handler: Arc<dyn NotificationHandler>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl DownstreamClient {
    pub fn new(name: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            name: name.to_string(),
            timeout: DEFAULT_TIMEOUT,
            transport: tokio::sync::Mutex::new(transport),
            snapshot: RwLock::new(Snapshot::new()),
            handler: Arc::new(LogNotifications),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_notification_handler(mut self, handler: impl NotificationHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn status(&self) -> ClientStatus {
        self.read_snapshot().status
    }

    /// Negotiated server info. `Some` exactly while connected.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.read_snapshot().server_info.clone()
    }

    /// Tools from the most recent successful listing.
    pub fn cached_tools(&self) -> Vec<Tool> {
        self.read_snapshot().tools.clone()
    }

    /// Resources from the most recent successful listing.
    pub fn cached_resources(&self) -> Vec<Resource> {
        self.read_snapshot().resources.clone()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start the transport and perform the initialize handshake.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.connect_within(self.timeout).await
    }

    /// [`connect`](Self::connect) with an explicit deadline covering both
    /// transport start and handshake.
    pub async fn connect_within(&self, deadline: Duration) -> Result<(), McpError> {
        let expires = expiry(deadline);
        let mut transport = self.lock_transport("initialize", expires, deadline).await?;
        let status = self.status();
        if status != ClientStatus::Uninitialized {
            return Err(self.invalid_state("connect", status));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handshake = async {
            transport.start(tx).await?;

            let params = serde_json::to_value(InitializeParams::gateway()).map_err(|e| {
                McpError::Protocol {
                    server: self.name.clone(),
                    reason: format!("failed to encode initialize params: {e}"),
                }
            })?;
            let response = transport.request("initialize", Some(params)).await?;
            let result = extract_result(response)?;
            let info: InitializeResult =
                serde_json::from_value(result).map_err(|e| McpError::Protocol {
                    server: self.name.clone(),
                    reason: format!("invalid initialize response: {e}"),
                })?;

            transport.notify(methods::INITIALIZED, None).await?;
            Ok::<_, McpError>(info)
        };

        let outcome = match timeout_at(expires, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timeout_error("initialize", deadline)),
        };

        match outcome {
            Ok(info) => {
                if info.protocol_version != PROTOCOL_VERSION {
                    tracing::info!(
                        server = %self.name,
                        offered = PROTOCOL_VERSION,
                        negotiated = %info.protocol_version,
                        "server negotiated a different protocol version"
                    );
                }
                tracing::info!(
                    server = %self.name,
                    transport = transport.kind(),
                    server_name = %info.server_info.name,
                    server_version = %info.server_info.version,
                    "downstream client connected"
                );
                self.spawn_dispatcher(rx);
                let mut snapshot = self.write_snapshot();
                snapshot.status = ClientStatus::Connected;
                snapshot.server_info = Some(info);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "downstream connect failed");
                self.transition(ClientStatus::Failed);
                if let Err(close_err) = transport.close().await {
                    tracing::debug!(
                        server = %self.name,
                        error = %close_err,
                        "transport close after failed connect"
                    );
                }
                Err(e)
            }
        }
    }

    /// Close the transport. Allowed only while connected.
    pub async fn stop(&self) -> Result<(), McpError> {
        self.stop_within(self.timeout).await
    }

    /// A deadline that expires while another operation still holds the
    /// transport returns `Timeout` and leaves the client connected.
    pub async fn stop_within(&self, deadline: Duration) -> Result<(), McpError> {
        let expires = expiry(deadline);
        let mut transport = self.lock_transport("close", expires, deadline).await?;
        if self.status() != ClientStatus::Connected {
            return Err(McpError::NotInitialized {
                name: self.name.clone(),
            });
        }

        self.abort_dispatcher();
        let outcome = match timeout_at(expires, transport.close()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timeout_error("close", deadline)),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(server = %self.name, "downstream client stopped");
                self.transition(ClientStatus::Stopped);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "downstream close failed");
                self.transition(ClientStatus::Failed);
                Err(e)
            }
        }
    }

    // ─── Listing ─────────────────────────────────────────────────────────

    /// List the server's tools, following pagination, and cache the result.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.list_tools_within(self.timeout).await
    }

    pub async fn list_tools_within(&self, deadline: Duration) -> Result<Vec<Tool>, McpError> {
        let expires = expiry(deadline);
        if self.connected_info().is_none() {
            return Err(self.not_connected());
        }
        let transport = self.lock_transport("tools/list", expires, deadline).await?;
        let Some(info) = self.connected_info() else {
            return Err(self.not_connected());
        };
        if !info.capabilities.supports_tools() {
            return Ok(Vec::new());
        }

        let tools = self
            .paginate::<ListToolsResult>(&**transport, "tools/list", expires, deadline)
            .await?;
        self.write_snapshot().tools = tools.clone();
        Ok(tools)
    }

    /// List the server's resources, following pagination, and cache the result.
    pub async fn list_resources(&self) -> Result<Vec<Resource>, McpError> {
        self.list_resources_within(self.timeout).await
    }

    pub async fn list_resources_within(
        &self,
        deadline: Duration,
    ) -> Result<Vec<Resource>, McpError> {
        let expires = expiry(deadline);
        if self.connected_info().is_none() {
            return Err(self.not_connected());
        }
        let transport = self.lock_transport("resources/list", expires, deadline).await?;
        let Some(info) = self.connected_info() else {
            return Err(self.not_connected());
        };
        if !info.capabilities.supports_resources() {
            return Ok(Vec::new());
        }

        let resources = self
            .paginate::<ListResourcesResult>(&**transport, "resources/list", expires, deadline)
            .await?;
        self.write_snapshot().resources = resources.clone();
        Ok(resources)
    }

    /// Re-list tools and resources. Both are attempted; the first error wins.
    pub async fn refresh(&self) -> Result<(), McpError> {
        let tools = self.list_tools().await;
        let resources = self.list_resources().await;
        tools.and(resources).map(|_| ())
    }

    async fn paginate<P: Page>(
        &self,
        transport: &dyn Transport,
        method: &str,
        expires: Instant,
        deadline: Duration,
    ) -> Result<Vec<P::Item>, McpError> {
        let fetch = async {
            let mut items = Vec::new();
            let mut cursor: Option<String> = None;
            for _ in 0..MAX_PAGES {
                let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
                let response = transport.request(method, params).await?;
                let page: P = serde_json::from_value(extract_result(response)?).map_err(|e| {
                    McpError::Protocol {
                        server: self.name.clone(),
                        reason: format!("invalid {method} response: {e}"),
                    }
                })?;
                let (mut batch, next) = page.into_parts();
                items.append(&mut batch);
                match next {
                    Some(next) if !next.is_empty() => cursor = Some(next),
                    _ => return Ok(items),
                }
            }
            tracing::warn!(
                server = %self.name,
                method,
                pages = MAX_PAGES,
                "pagination limit reached, listing truncated"
            );
            Ok::<_, McpError>(items)
        };

        let outcome = match timeout_at(expires, fetch).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timeout_error(method, deadline)),
        };
        if let Err(e) = &outcome {
            tracing::warn!(server = %self.name, method, error = %e, "listing failed");
        }
        outcome
    }

    // ─── Forwarding ──────────────────────────────────────────────────────

    /// Forward a `tools/call` and return the raw result payload.
    pub async fn call_tool(&self, tool: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        let mut params = json!({ "name": tool });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.forward("tools/call", params).await
    }

    /// Forward a `resources/read` and return the raw result payload.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.forward("resources/read", json!({ "uri": uri })).await
    }

    async fn forward(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let deadline = self.timeout;
        let expires = expiry(deadline);
        if self.connected_info().is_none() {
            return Err(self.not_connected());
        }
        let transport = self.lock_transport(method, expires, deadline).await?;
        if self.connected_info().is_none() {
            return Err(self.not_connected());
        }
        match timeout_at(expires, transport.request(method, Some(params))).await {
            Ok(response) => extract_result(response?),
            Err(_) => Err(self.timeout_error(method, deadline)),
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    /// Wait for the transport, giving up at `expires`.
    async fn lock_transport(
        &self,
        operation: &str,
        expires: Instant,
        deadline: Duration,
    ) -> Result<MutexGuard<'_, Box<dyn Transport>>, McpError> {
        timeout_at(expires, self.transport.lock()).await.map_err(|_| {
            tracing::warn!(server = %self.name, operation, "transport busy past deadline");
            self.timeout_error(operation, deadline)
        })
    }

    fn read_snapshot(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshot(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected_info(&self) -> Option<InitializeResult> {
        let snapshot = self.read_snapshot();
        match snapshot.status {
            ClientStatus::Connected => snapshot.server_info.clone(),
            _ => None,
        }
    }

    /// Move to a terminal status, dropping server info and caches.
    fn transition(&self, next: ClientStatus) {
        let mut snapshot = self.write_snapshot();
        if snapshot.status.is_terminal() {
            tracing::debug!(
                server = %self.name,
                from = %snapshot.status,
                to = %next,
                "ignoring transition out of terminal status"
            );
            return;
        }
        snapshot.status = next;
        snapshot.server_info = None;
        snapshot.tools.clear();
        snapshot.resources.clear();
    }

    fn spawn_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<JsonRpcNotification>) {
        let handler = Arc::clone(&self.handler);
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                handler.handle(&name, notification);
            }
        });
        let previous = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn abort_dispatcher(&self) {
        if let Some(task) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn not_connected(&self) -> McpError {
        McpError::NotConnected {
            name: self.name.clone(),
        }
    }

    fn invalid_state(&self, operation: &str, status: ClientStatus) -> McpError {
        McpError::InvalidState {
            name: self.name.clone(),
            operation: operation.to_string(),
            status: status.to_string(),
        }
    }

    fn timeout_error(&self, operation: &str, deadline: Duration) -> McpError {
        McpError::Timeout {
            server: self.name.clone(),
            operation: operation.to_string(),
            timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Drop for DownstreamClient {
    fn drop(&mut self) {
        self.abort_dispatcher();
    }
}

impl fmt::Debug for DownstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamClient")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// The instant `deadline` from now, saturating far in the future.
fn expiry(deadline: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(deadline)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

// ─── Pagination ──────────────────────────────────────────────────────────────

/// One page of a cursor-paginated listing.
trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for ListToolsResult {
    type Item = Tool;
    fn into_parts(self) -> (Vec<Tool>, Option<String>) {
        (self.tools, self.next_cursor)
    }
}

impl Page for ListResourcesResult {
    type Item = Resource;
    fn into_parts(self) -> (Vec<Resource>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::{initialize_result, MockTransport};
    use crate::mcp_client::types::JsonRpcError;

    fn client(transport: MockTransport) -> DownstreamClient {
        DownstreamClient::new("mock", transport.boxed())
    }

    #[tokio::test]
    async fn test_connect_stores_server_info() {
        let mock = MockTransport::server("alpha", &["search"]);
        let probe = mock.probe();
        let c = client(mock);

        assert_eq!(c.status(), ClientStatus::Uninitialized);
        assert!(c.server_info().is_none());

        c.connect().await.unwrap();
        assert_eq!(c.status(), ClientStatus::Connected);
        assert_eq!(c.server_info().unwrap().server_info.name, "alpha");
        assert_eq!(probe.requests(), vec!["initialize"]);
        assert_eq!(probe.sent_notifications(), vec![methods::INITIALIZED]);
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid_state() {
        let c = client(MockTransport::server("alpha", &[]));
        c.connect().await.unwrap();
        let err = c.connect().await.unwrap_err();
        assert!(matches!(err, McpError::InvalidState { .. }));
        assert_eq!(c.status(), ClientStatus::Connected);
    }

    #[tokio::test]
    async fn test_start_failure_marks_failed() {
        let c = client(MockTransport::server("alpha", &[]).failing_start());
        let err = c.connect().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(c.status(), ClientStatus::Failed);
        assert!(c.server_info().is_none());
    }

    #[tokio::test]
    async fn test_rejected_handshake_marks_failed() {
        let mock = MockTransport::new(|_, _| Err(JsonRpcError::invalid_request("go away")));
        let probe = mock.probe();
        let c = client(mock);
        let err = c.connect().await.unwrap_err();
        assert!(matches!(err, McpError::Server { .. }));
        assert_eq!(c.status(), ClientStatus::Failed);
        assert_eq!(probe.close_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_protocol_error() {
        let c = client(MockTransport::new(|_, _| Ok(json!({"unexpected": true}))));
        let err = c.connect().await.unwrap_err();
        assert!(matches!(err, McpError::Protocol { .. }));
        assert_eq!(c.status(), ClientStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_marks_failed() {
        let c = client(MockTransport::server("slow", &[]).with_delay(Duration::from_secs(60)));
        let err = c.connect_within(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(c.status(), ClientStatus::Failed);
    }

    #[tokio::test]
    async fn test_list_on_uninitialized_never_touches_transport() {
        let mock = MockTransport::server("alpha", &["search"]);
        let probe = mock.probe();
        let c = client(mock);

        let err = c.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
        let err = c.list_resources().await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
        assert_eq!(probe.request_count(), 0);
    }

    #[tokio::test]
    async fn test_list_on_stopped_never_touches_transport() {
        let mock = MockTransport::server("alpha", &["search"]);
        let probe = mock.probe();
        let c = client(mock);
        c.connect().await.unwrap();
        c.stop().await.unwrap();

        let before = probe.request_count();
        assert!(matches!(
            c.list_tools().await.unwrap_err(),
            McpError::NotConnected { .. }
        ));
        assert_eq!(probe.request_count(), before);
    }

    #[tokio::test]
    async fn test_list_tools_caches_result() {
        let c = client(MockTransport::server("alpha", &["search", "fetch"]));
        c.connect().await.unwrap();
        let tools = c.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["search", "fetch"]);
        assert_eq!(c.cached_tools(), tools);

        let resources = c.list_resources().await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(c.cached_resources().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_capability_lists_empty_without_request() {
        let mock = MockTransport::new(|method, _| match method {
            "initialize" => Ok(initialize_result("bare", false, false)),
            other => Err(JsonRpcError::method_not_found(other)),
        });
        let probe = mock.probe();
        let c = client(mock);
        c.connect().await.unwrap();

        assert!(c.list_tools().await.unwrap().is_empty());
        assert!(c.list_resources().await.unwrap().is_empty());
        assert_eq!(probe.requests(), vec!["initialize"]);
    }

    #[tokio::test]
    async fn test_list_error_keeps_status() {
        let mock = MockTransport::new(|method, _| match method {
            "initialize" => Ok(initialize_result("flaky", true, false)),
            _ => Err(JsonRpcError::internal_error("boom")),
        });
        let c = client(mock);
        c.connect().await.unwrap();
        let err = c.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::Server { .. }));
        assert_eq!(c.status(), ClientStatus::Connected);
    }

    #[tokio::test]
    async fn test_list_follows_cursor() {
        let mock = MockTransport::new(|method, params| match method {
            "initialize" => Ok(initialize_result("paged", true, false)),
            "tools/list" => match params.and_then(|p| p["cursor"].as_str()) {
                None => Ok(json!({"tools": [{"name": "a"}], "nextCursor": "p2"})),
                Some("p2") => Ok(json!({"tools": [{"name": "b"}]})),
                Some(other) => Err(JsonRpcError::invalid_params(other.to_string())),
            },
            other => Err(JsonRpcError::method_not_found(other)),
        });
        let c = client(mock);
        c.connect().await.unwrap();
        let names: Vec<_> = c
            .list_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_timeout_keeps_status() {
        let c = client(MockTransport::server("slow", &["x"]).with_delay(Duration::from_millis(50)));
        c.connect_within(Duration::from_secs(5)).await.unwrap();
        let err = c.list_tools_within(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(c.status(), ClientStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_includes_wait_for_busy_transport() {
        let mock = MockTransport::server("busy", &["slow"]).with_delay(Duration::from_secs(20));
        let probe = mock.probe();
        let c = Arc::new(client(mock));
        c.connect().await.unwrap();

        let busy = Arc::clone(&c);
        let call = tokio::spawn(async move { busy.call_tool("slow", None).await });
        while probe.request_count() < 2 {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        let err = c.list_tools_within(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() <= Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        let err = c.stop_within(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(c.status(), ClientStatus::Connected);
        assert_eq!(probe.close_count(), 0);

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["content"][0]["text"], "called slow");
        c.stop().await.unwrap();
        assert_eq!(c.status(), ClientStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_on_never_connected_is_not_initialized() {
        let mock = MockTransport::server("alpha", &[]);
        let probe = mock.probe();
        let c = client(mock);
        let err = c.stop().await.unwrap_err();
        assert!(matches!(err, McpError::NotInitialized { .. }));
        assert_eq!(probe.close_count(), 0);
        assert_eq!(c.status(), ClientStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_stop_twice_fails_cleanly() {
        let mock = MockTransport::server("alpha", &[]);
        let probe = mock.probe();
        let c = client(mock);
        c.connect().await.unwrap();
        c.list_tools().await.unwrap();

        c.stop().await.unwrap();
        assert_eq!(c.status(), ClientStatus::Stopped);
        assert!(c.server_info().is_none());
        assert!(c.cached_tools().is_empty());

        let err = c.stop().await.unwrap_err();
        assert!(matches!(err, McpError::NotInitialized { .. }));
        assert_eq!(probe.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_marks_failed() {
        let c = client(MockTransport::server("alpha", &[]).failing_close());
        c.connect().await.unwrap();
        let err = c.stop().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(c.status(), ClientStatus::Failed);
        assert!(c.server_info().is_none());
    }

    #[tokio::test]
    async fn test_notifications_reach_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mock = MockTransport::server("alpha", &[]);
        let probe = mock.probe();
        let c = client(mock).with_notification_handler(
            move |name: &str, n: JsonRpcNotification| {
                let _ = tx.send((name.to_string(), n.method));
            },
        );
        c.connect().await.unwrap();

        probe.push_notification(methods::TOOLS_LIST_CHANGED);
        let (name, method) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "mock");
        assert_eq!(method, methods::TOOLS_LIST_CHANGED);
    }

    #[tokio::test]
    async fn test_call_tool_forwards_name() {
        let c = client(MockTransport::server("alpha", &["search"]));
        assert!(matches!(
            c.call_tool("search", None).await.unwrap_err(),
            McpError::NotConnected { .. }
        ));
        c.connect().await.unwrap();
        let result = c.call_tool("search", Some(json!({"q": "rust"}))).await.unwrap();
        assert_eq!(result["content"][0]["text"], "called search");

        let body = c.read_resource("mem://alpha/readme").await.unwrap();
        assert_eq!(body["contents"][0]["text"], "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_server_over_stdio() {
        use crate::mcp_client::stdio::StdioTransport;
        use crate::mcp_client::testing::ECHO_SERVER_SCRIPT;
        use std::collections::BTreeMap;

        let transport = StdioTransport::new(
            "echo",
            "sh",
            vec!["-c".to_string(), ECHO_SERVER_SCRIPT.to_string()],
            BTreeMap::new(),
        );
        let c = DownstreamClient::new("echo", Box::new(transport));
        c.connect().await.unwrap();
        assert_eq!(c.server_info().unwrap().server_info.name, "echo-server");

        let tools = c.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        c.stop().await.unwrap();
        assert_eq!(c.status(), ClientStatus::Stopped);
    }
}
