//! JSON-RPC over MCP streamable HTTP.
//!
//! Every request is a POST to the server endpoint. The server answers with
//! either a JSON body or an SSE stream (`text/event-stream`) that may carry
//! notifications before the response. A session id handed out by the server
//! (`Mcp-Session-Id`) is echoed on every later call.
//!
//! Push notifications sent outside a request need the optional continuous
//! listening mode: a background GET that keeps an SSE stream open. Without
//! it those notifications are silently unavailable.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, StatusCode, Url};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{
    next_request_id, route_message, NotificationSink, PendingRequests, Transport,
};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Header carrying the server-assigned session id.
const SESSION_HEADER: &str = "Mcp-Session-Id";

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect attempts for the listening stream before giving up.
const MAX_LISTEN_RETRIES: u32 = 3;

/// Base delay between listening reconnects (doubles each time).
const LISTEN_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

// ─── SSE Decoding ────────────────────────────────────────────────────────────

/// Incremental SSE decoder: feed raw bytes, take complete `data` payloads.
///
/// Bytes are buffered until an event is complete, so a UTF-8 sequence or a
/// CRLF pair split across chunks decodes intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Last byte fed was `\r`; a following `\n` belongs to the same break.
    pending_cr: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return the data payload of every completed event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        for &byte in bytes {
            if std::mem::take(&mut self.pending_cr) && byte == b'\n' {
                continue;
            }
            if byte == b'\r' {
                self.buffer.push(b'\n');
                self.pending_cr = true;
            } else {
                self.buffer.push(byte);
            }
        }

        let mut events = Vec::new();
        while let Some(event_end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.buffer.drain(..event_end + 2).collect();
            if let Some(data) = event_data(&String::from_utf8_lossy(&event)) {
                events.push(data);
            }
        }
        events
    }

    /// Flush whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        self.pending_cr = false;
        let rest = std::mem::take(&mut self.buffer);
        event_data(String::from_utf8_lossy(&rest).trim())
    }
}

/// Join the `data:` lines of one event. Comments and other fields are ignored.
fn event_data(event: &str) -> Option<String> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .collect();

    if data.is_empty() {
        None // Keep-alive or comment
    } else {
        Some(data.join("\n"))
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// State shared between request calls and the listening task.
struct Session {
    server_name: String,
    http: HttpClient,
    endpoint: Url,
    session_id: RwLock<Option<String>>,
    pending: PendingRequests,
    notifications: NotificationSink,
    /// Signalled once the first exchange succeeded.
    established: Notify,
}

impl Session {
    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(sid) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().unwrap_or_else(PoisonError::into_inner) =
                Some(sid.to_string());
        }
    }

    /// POST one JSON-RPC message and return the raw HTTP response.
    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response, McpError> {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(sid) = self.session_id() {
            req = req.header(SESSION_HEADER, sid);
        }

        let response = req
            .send()
            .await
            .map_err(|e| self.transport_error(format!("HTTP request failed: {e}")))?;
        self.remember_session(&response);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }

    /// Route one payload; send back any reply to a server-initiated request.
    async fn route(&self, raw: &str) {
        if let Some(reply) =
            route_message(&self.server_name, raw, &self.pending, &self.notifications)
        {
            if let Err(e) = self.post(&reply).await {
                tracing::warn!(server = %self.server_name, error = %e, "failed to reply to server request");
            }
        }
    }
}

// ─── HttpStreamingTransport ──────────────────────────────────────────────────

/// Transport to a downstream server over streamable HTTP.
pub struct HttpStreamingTransport {
    server_name: String,
    url: String,
    continuous_listening: bool,
    session: Option<Arc<Session>>,
    listener: Option<JoinHandle<()>>,
}

impl HttpStreamingTransport {
    /// Describe an HTTP transport. Nothing is sent until the first request.
    pub fn new(server_name: &str, url: &str, continuous_listening: bool) -> Self {
        Self {
            server_name: server_name.to_string(),
            url: url.to_string(),
            continuous_listening,
            session: None,
            listener: None,
        }
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    fn session(&self) -> Result<&Arc<Session>, McpError> {
        self.session
            .as_ref()
            .ok_or_else(|| self.transport_error("transport is not started"))
    }
}

/// Parse and check the endpoint URL.
fn parse_endpoint(url: &str) -> Result<Url, String> {
    let endpoint = Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;
    if matches!(endpoint.scheme(), "http" | "https") {
        Ok(endpoint)
    } else {
        Err(format!("unsupported URL scheme '{}' in '{url}'", endpoint.scheme()))
    }
}

#[async_trait]
impl Transport for HttpStreamingTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn start(&mut self, notifications: NotificationSink) -> Result<(), McpError> {
        if self.session.is_some() {
            return Err(self.transport_error("transport already started"));
        }

        let endpoint = parse_endpoint(&self.url).map_err(|reason| self.transport_error(reason))?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| self.transport_error(format!("failed to build HTTP client: {e}")))?;

        tracing::info!(
            server = %self.server_name,
            url = %endpoint,
            continuous_listening = self.continuous_listening,
            "opening HTTP streaming transport"
        );

        let session = Arc::new(Session {
            server_name: self.server_name.clone(),
            http,
            endpoint,
            session_id: RwLock::new(None),
            pending: PendingRequests::new(),
            notifications,
            established: Notify::new(),
        });

        if self.continuous_listening {
            self.listener = Some(tokio::spawn(listen(Arc::clone(&session))));
        }
        self.session = Some(session);
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let session = self.session()?;
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        // The response may arrive in the POST body or on the listening stream.
        let (_guard, mut rx) = session.pending.register(id);
        let response = session.post(&req).await?;

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let result = if is_sse {
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            'stream: loop {
                match body.next().await {
                    Some(Ok(bytes)) => {
                        for data in decoder.feed(&bytes) {
                            session.route(&data).await;
                            if let Ok(resp) = rx.try_recv() {
                                break 'stream Ok(resp);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        break Err(self.transport_error(format!("stream read error: {e}")));
                    }
                    None => {
                        if let Some(data) = decoder.finish() {
                            session.route(&data).await;
                        }
                        break rx.try_recv().map_err(|_| McpError::Protocol {
                            server: self.server_name.clone(),
                            reason: format!("stream for '{method}' ended without a response"),
                        });
                    }
                }
            }
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| self.transport_error(format!("failed to read response: {e}")))?;
            session.route(text.trim()).await;
            rx.try_recv().map_err(|_| McpError::Protocol {
                server: self.server_name.clone(),
                reason: format!("invalid JSON-RPC response to '{method}'"),
            })
        };

        if result.is_ok() {
            session.established.notify_one();
        }
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let session = self.session()?;
        let notification = JsonRpcNotification::new(method, params);
        session.post(&notification).await.map(|_| ())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        session.pending.fail_all();

        // Terminate the server-side session (best-effort).
        if let Some(sid) = session.session_id() {
            let result = session
                .http
                .delete(session.endpoint.clone())
                .header(SESSION_HEADER, sid)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => {
                    tracing::debug!(server = %self.server_name, "server does not support session termination");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(server = %self.server_name, error = %e, "session termination failed");
                }
            }
        }

        tracing::info!(server = %self.server_name, "HTTP streaming transport closed");
        Ok(())
    }
}

impl Drop for HttpStreamingTransport {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

// ─── Continuous Listening ────────────────────────────────────────────────────

/// Keep a GET stream open to receive server push messages.
///
/// Waits for the first successful exchange (the handshake) so the session id
/// is known, then reconnects with exponential backoff when the stream drops.
async fn listen(session: Arc<Session>) {
    session.established.notified().await;
    let mut attempt = 0;

    loop {
        let mut req = session
            .http
            .get(session.endpoint.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(sid) = session.session_id() {
            req = req.header(SESSION_HEADER, sid);
        }

        match req.send().await {
            Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => {
                tracing::info!(
                    server = %session.server_name,
                    "server offers no listening stream; push notifications unavailable"
                );
                return;
            }
            Ok(resp) if resp.status().is_success() => {
                attempt = 0;
                tracing::debug!(server = %session.server_name, "listening stream open");
                let mut decoder = SseDecoder::new();
                let mut body = resp.bytes_stream();
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for data in decoder.feed(&bytes) {
                                session.route(&data).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(server = %session.server_name, error = %e, "listening stream error");
                            break;
                        }
                    }
                }
            }
            Ok(resp) => {
                tracing::warn!(
                    server = %session.server_name,
                    status = %resp.status(),
                    "listening stream rejected"
                );
            }
            Err(e) => {
                tracing::warn!(server = %session.server_name, error = %e, "listening stream connect failed");
            }
        }

        if attempt >= MAX_LISTEN_RETRIES {
            tracing::warn!(
                server = %session.server_name,
                attempts = attempt,
                "giving up on listening stream"
            );
            return;
        }
        tokio::time::sleep(LISTEN_RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
        attempt += 1;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
