//! Transport adapter contract.
//!
//! A transport owns one bidirectional JSON-RPC channel to a downstream server.
//! Two variants exist: [`StdioTransport`](super::stdio::StdioTransport)
//! (spawned subprocess) and
//! [`HttpStreamingTransport`](super::http::HttpStreamingTransport).
//! Both share the pending-request table and message routing defined here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::catalog::{CatalogEntry, TransportSpec};

use super::errors::McpError;
use super::http::HttpStreamingTransport;
use super::stdio::StdioTransport;
use super::types::{Incoming, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// Where a transport delivers server-initiated notifications.
///
/// Unbounded so the read path never waits on the consumer.
pub type NotificationSink = mpsc::UnboundedSender<JsonRpcNotification>;

/// Capability set shared by every transport variant.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name of the variant (`"ipc"`, `"http"`), for logs.
    fn kind(&self) -> &'static str;

    /// Open the channel. Inbound notifications are forwarded to `notifications`
    /// for as long as the channel stays open.
    async fn start(&mut self, notifications: NotificationSink) -> Result<(), McpError>;

    /// Send a request and wait for the response with the matching id.
    ///
    /// Cancel-safe: dropping the future releases the pending slot.
    async fn request(&self, method: &str, params: Option<Value>)
        -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Release the channel. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), McpError>;
}

/// Build the transport variant a catalog entry asks for.
pub fn transport_for(entry: &CatalogEntry) -> Result<Box<dyn Transport>, McpError> {
    match &entry.transport {
        TransportSpec::Ipc { command, args, env } => Ok(Box::new(StdioTransport::new(
            &entry.name,
            command,
            args.clone(),
            env.clone(),
        ))),
        TransportSpec::Http {
            url,
            continuous_listening,
        } => Ok(Box::new(HttpStreamingTransport::new(
            &entry.name,
            url,
            *continuous_listening,
        ))),
        TransportSpec::Unsupported { kind } => Err(McpError::UnsupportedTransport {
            name: entry.name.clone(),
            transport: kind.clone(),
        }),
    }
}

// ─── Pending Requests ────────────────────────────────────────────────────────

type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// Table of in-flight requests awaiting a response, keyed by request id.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<PendingMap>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a slot for `id`. The slot is freed when the guard drops,
    /// whether or not a response ever arrived.
    pub fn register(&self, id: u64) -> (PendingGuard, oneshot::Receiver<JsonRpcResponse>) {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (
            PendingGuard {
                table: self.clone(),
                id,
            },
            rx,
        )
    }

    /// Hand a response to its waiter. Returns `false` if nobody was waiting.
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response_id(&response.id) else {
            return false;
        };
        match self.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn fail_all(&self) {
        self.lock().clear();
    }

    /// Number of requests currently awaiting a response.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Frees a pending slot on drop.
pub struct PendingGuard {
    table: PendingRequests,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.id);
    }
}

/// Request ids we generate are numbers, but some servers echo them as strings.
fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ─── Message Routing ─────────────────────────────────────────────────────────

/// Route one raw message read from a downstream server.
///
/// Responses go to their pending waiter, notifications to the sink.
/// Server-initiated requests get a reply the caller must send back.
/// Anything that is not JSON-RPC (stray log output) is skipped.
pub fn route_message(
    server: &str,
    raw: &str,
    pending: &PendingRequests,
    notifications: &NotificationSink,
) -> Option<JsonRpcResponse> {
    let message: JsonRpcMessage = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(_) => {
            tracing::debug!(server, line = raw, "skipping non JSON-RPC output");
            return None;
        }
    };

    match message.classify() {
        Some(Incoming::Response(response)) => {
            if !pending.complete(response) {
                tracing::debug!(server, "response for unknown or abandoned request");
            }
            None
        }
        Some(Incoming::Notification(notification)) => {
            // Receiver gone means the client is shutting down.
            let _ = notifications.send(notification);
            None
        }
        Some(Incoming::Request { id, method, .. }) => {
            tracing::debug!(server, method = %method, "server-initiated request");
            Some(if method == "ping" {
                JsonRpcResponse::success(id, serde_json::json!({}))
            } else {
                JsonRpcResponse::failure(id, JsonRpcError::method_not_found(&method))
            })
        }
        None => {
            tracing::debug!(server, line = raw, "skipping unclassifiable message");
            None
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::Server {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
