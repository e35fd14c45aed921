//! Downstream side of the gateway: MCP clients and their transports.
//!
//! This module handles:
//! - JSON-RPC 2.0 message types and the MCP handshake payloads
//! - Transports to downstream servers (spawned subprocess, streamable HTTP)
//! - The per-server client state machine (connect, list, stop)
//! - The registry that installs, removes and aggregates clients

pub mod client;
pub mod errors;
pub mod http;
pub mod registry;
pub mod stdio;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{ClientStatus, DownstreamClient, NotificationHandler};
pub use errors::McpError;
pub use registry::{ClientSummary, GatewayRegistry, InstallOutcome, RegistryEvent};
pub use transport::{transport_for, Transport};
