//! Gateway error types.
//!
//! Every failure the core can produce is one of these variants. Per-client
//! failures are recorded on the client (status `Failed`) and returned to the
//! caller; none of them is fatal to the process.

use thiserror::Error;

/// Errors that can occur while managing downstream MCP clients.
#[derive(Debug, Error)]
pub enum McpError {
    /// Subprocess spawn failure, unreachable or malformed endpoint, broken channel.
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// Malformed or rejected handshake, unparseable payload.
    #[error("protocol error for server '{server}': {reason}")]
    Protocol {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A bounded operation exceeded its deadline.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Catalog entry names a transport kind the gateway cannot build.
    #[error("unsupported transport type '{transport}' for tool '{name}'")]
    UnsupportedTransport {
        name: String,
        transport: String,
    },

    /// Unknown tool name requested for install or removal.
    #[error("tool '{name}' not found")]
    NotFound {
        name: String,
    },

    /// A client with the same name is already registered.
    #[error("tool '{name}' is already installed")]
    AlreadyInstalled {
        name: String,
    },

    /// Query issued against a client that is not connected.
    #[error("client '{name}' is not connected")]
    NotConnected {
        name: String,
    },

    /// Stop issued against a client that never connected.
    #[error("client '{name}' is not initialized")]
    NotInitialized {
        name: String,
    },

    /// Operation not allowed from the client's current status.
    #[error("client '{name}' cannot {operation} while {status}")]
    InvalidState {
        name: String,
        operation: String,
        status: String,
    },

    /// Catalog document could not be parsed or failed validation.
    #[error("catalog error: {reason}")]
    Catalog {
        reason: String,
    },

    /// Configuration file could not be read or parsed.
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl McpError {
    /// Whether this error came from a deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// Whether the underlying channel is broken (the server may have exited).
    pub fn is_transport(&self) -> bool {
        matches!(self, McpError::Transport { .. })
    }
}
