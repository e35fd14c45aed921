//! Gateway registry: the set of installed downstream clients.
//!
//! Keyed by client name. Mutations (install, remove) take the map
//! exclusively; aggregate reads share it. Handshakes and shutdowns run
//! outside the map lock so a slow downstream server never blocks work on
//! the others.
//!
//! Aggregated tool names are namespaced as `<client>.<tool>`. If two entries
//! still end up with the same name, the client installed first wins and the
//! later one is skipped with a warning. Resources keep their URI and follow
//! the same first-wins rule.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::catalog::CatalogEntry;

use super::client::{ClientStatus, DownstreamClient, DEFAULT_TIMEOUT};
use super::errors::McpError;
use super::transport::{transport_for, Transport};
use super::types::{methods, Implementation, JsonRpcNotification, Resource, Tool};

/// Separator between client name and tool name in aggregated tool names.
pub const NAMESPACE_SEPARATOR: char = '.';

/// Capacity of the change-event channel. Slow subscribers skip events.
const EVENT_CAPACITY: usize = 64;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Change in the aggregated view, for upstream `list_changed` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    ToolsChanged,
    ResourcesChanged,
}

/// Result of an install that got as far as creating a client.
///
/// The client is registered whether or not it connected; a failed
/// handshake is reported in `connect_error` and the client stays visible
/// with status `Failed`.
#[derive(Debug)]
pub struct InstallOutcome {
    pub client: Arc<DownstreamClient>,
    pub connect_error: Option<McpError>,
}

impl InstallOutcome {
    pub fn is_connected(&self) -> bool {
        self.connect_error.is_none()
    }
}

/// Point-in-time view of one installed client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSummary {
    pub name: String,
    pub status: ClientStatus,
    pub server: Option<Implementation>,
    pub tools: usize,
    pub resources: usize,
}

struct Slot {
    /// Install order, used for deterministic aggregation.
    seq: u64,
    client: Arc<DownstreamClient>,
}

// ─── GatewayRegistry ─────────────────────────────────────────────────────────

pub struct GatewayRegistry {
    clients: RwLock<HashMap<String, Slot>>,
    next_seq: AtomicU64,
    request_timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            clients: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            request_timeout: DEFAULT_TIMEOUT,
            events,
        }
    }

    /// Deadline applied to every operation of clients installed afterwards.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Receive change events for the aggregated view.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ─── Install / Remove ────────────────────────────────────────────────

    /// Install a catalog entry: build its transport, register the client and
    /// connect it.
    ///
    /// Fails without touching the registry if the name is taken or the
    /// transport kind is unsupported.
    pub async fn install(&self, entry: &CatalogEntry) -> Result<InstallOutcome, McpError> {
        if self.clients.read().await.contains_key(&entry.name) {
            return Err(McpError::AlreadyInstalled {
                name: entry.name.clone(),
            });
        }
        let transport = transport_for(entry)?;
        tracing::info!(
            tool = %entry.name,
            transport = transport.kind(),
            "installing downstream server"
        );
        self.install_transport(&entry.name, transport).await
    }

    /// Register a client over an already-built transport and connect it.
    pub async fn install_transport(
        &self,
        name: &str,
        transport: Box<dyn Transport>,
    ) -> Result<InstallOutcome, McpError> {
        let client = {
            let mut clients = self.clients.write().await;
            if clients.contains_key(name) {
                return Err(McpError::AlreadyInstalled {
                    name: name.to_string(),
                });
            }
            let client = self.build_client(name, transport);
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            clients.insert(
                name.to_string(),
                Slot {
                    seq,
                    client: Arc::clone(&client),
                },
            );
            client
        };

        let connect_error = match client.connect().await {
            Ok(()) => {
                if let Err(e) = client.refresh().await {
                    tracing::warn!(tool = %name, error = %e, "initial listing failed");
                }
                self.broadcast(RegistryEvent::ToolsChanged);
                self.broadcast(RegistryEvent::ResourcesChanged);
                tracing::info!(
                    tool = %name,
                    tools = client.cached_tools().len(),
                    resources = client.cached_resources().len(),
                    "downstream server installed"
                );
                None
            }
            Err(e) => Some(e),
        };

        Ok(InstallOutcome {
            client,
            connect_error,
        })
    }

    /// Install several entries concurrently. Results are in input order.
    pub async fn install_all(
        &self,
        entries: &[CatalogEntry],
    ) -> Vec<(String, Result<InstallOutcome, McpError>)> {
        let installs = entries.iter().map(|entry| async move {
            (entry.name.clone(), self.install(entry).await)
        });
        join_all(installs).await
    }

    /// Remove a client, stopping it first if it is connected.
    ///
    /// The entry is gone afterwards even if stopping failed; the stop error
    /// is still returned.
    pub async fn remove(&self, name: &str) -> Result<(), McpError> {
        let slot = self
            .clients
            .write()
            .await
            .remove(name)
            .ok_or_else(|| McpError::NotFound {
                name: name.to_string(),
            })?;

        let result = match slot.client.stop().await {
            Err(McpError::NotInitialized { .. }) => Ok(()),
            other => other,
        };
        tracing::info!(tool = %name, "downstream server removed");
        self.broadcast(RegistryEvent::ToolsChanged);
        self.broadcast(RegistryEvent::ResourcesChanged);
        result
    }

    /// Stop and remove every client concurrently.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.clients.write().await.drain().map(|(_, s)| s).collect();
        if slots.is_empty() {
            return;
        }
        tracing::info!(count = slots.len(), "stopping all downstream servers");

        let stops = slots.iter().map(|slot| async move {
            match slot.client.stop().await {
                Ok(()) | Err(McpError::NotInitialized { .. }) => {}
                Err(e) => tracing::warn!(
                    tool = %slot.client.name(),
                    error = %e,
                    "failed to stop downstream server"
                ),
            }
        });
        join_all(stops).await;
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub async fn get(&self, name: &str) -> Option<Arc<DownstreamClient>> {
        self.clients
            .read()
            .await
            .get(name)
            .map(|slot| Arc::clone(&slot.client))
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Every installed client, in install order.
    pub async fn list(&self) -> Vec<ClientSummary> {
        self.ordered(|_| true)
            .await
            .into_iter()
            .map(|client| ClientSummary {
                name: client.name().to_string(),
                status: client.status(),
                server: client.server_info().map(|info| info.server_info),
                tools: client.cached_tools().len(),
                resources: client.cached_resources().len(),
            })
            .collect()
    }

    /// Tools of every connected client, namespaced by client name.
    pub async fn aggregate_tools(&self) -> Vec<Tool> {
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        for client in self.connected().await {
            for mut tool in client.cached_tools() {
                let qualified = qualify(client.name(), &tool.name);
                if !seen.insert(qualified.clone()) {
                    tracing::warn!(
                        tool = %qualified,
                        server = %client.name(),
                        "duplicate tool name, keeping the earlier install"
                    );
                    continue;
                }
                tool.name = qualified;
                tools.push(tool);
            }
        }
        tools
    }

    /// Resources of every connected client. URIs are not rewritten.
    pub async fn aggregate_resources(&self) -> Vec<Resource> {
        let mut seen = HashSet::new();
        let mut resources = Vec::new();
        for client in self.connected().await {
            for resource in client.cached_resources() {
                if !seen.insert(resource.uri.clone()) {
                    tracing::warn!(
                        uri = %resource.uri,
                        server = %client.name(),
                        "duplicate resource uri, keeping the earlier install"
                    );
                    continue;
                }
                resources.push(resource);
            }
        }
        resources
    }

    /// Find the client and downstream tool name behind an aggregated name.
    pub async fn resolve_tool(&self, qualified: &str) -> Option<(Arc<DownstreamClient>, String)> {
        self.connected().await.into_iter().find_map(|client| {
            let tool = qualified
                .strip_prefix(client.name())?
                .strip_prefix(NAMESPACE_SEPARATOR)?
                .to_string();
            client
                .cached_tools()
                .iter()
                .any(|t| t.name == tool)
                .then_some((Arc::clone(&client), tool))
        })
    }

    /// Forward a call on an aggregated tool name.
    pub async fn call_tool(&self, qualified: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        let (client, tool) = self
            .resolve_tool(qualified)
            .await
            .ok_or_else(|| McpError::NotFound {
                name: qualified.to_string(),
            })?;
        tracing::debug!(server = %client.name(), tool = %tool, "forwarding tool call");
        client.call_tool(&tool, arguments).await
    }

    /// Forward a read to the first connected client that lists `uri`.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        let client = self
            .connected()
            .await
            .into_iter()
            .find(|client| client.cached_resources().iter().any(|r| r.uri == uri))
            .ok_or_else(|| McpError::NotFound {
                name: uri.to_string(),
            })?;
        client.read_resource(uri).await
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn build_client(&self, name: &str, transport: Box<dyn Transport>) -> Arc<DownstreamClient> {
        let events = self.events.clone();
        let timeout = self.request_timeout;
        Arc::new_cyclic(|weak: &Weak<DownstreamClient>| {
            let weak = weak.clone();
            DownstreamClient::new(name, transport)
                .with_timeout(timeout)
                .with_notification_handler(move |client: &str, n: JsonRpcNotification| {
                    refresh_on_change(&weak, &events, client, n)
                })
        })
    }

    async fn ordered(&self, keep: impl Fn(&DownstreamClient) -> bool) -> Vec<Arc<DownstreamClient>> {
        let clients = self.clients.read().await;
        let mut slots: Vec<&Slot> = clients.values().filter(|s| keep(s.client.as_ref())).collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| Arc::clone(&s.client)).collect()
    }

    async fn connected(&self) -> Vec<Arc<DownstreamClient>> {
        self.ordered(|c| c.status() == ClientStatus::Connected).await
    }

    fn broadcast(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Aggregated name of a downstream tool.
pub fn qualify(client: &str, tool: &str) -> String {
    format!("{client}{NAMESPACE_SEPARATOR}{tool}")
}

/// Notification handler installed on every registry client: re-list on
/// `list_changed` and tell subscribers once the cache is fresh.
fn refresh_on_change(
    client: &Weak<DownstreamClient>,
    events: &broadcast::Sender<RegistryEvent>,
    name: &str,
    notification: JsonRpcNotification,
) {
    let event = match notification.method.as_str() {
        methods::TOOLS_LIST_CHANGED => RegistryEvent::ToolsChanged,
        methods::RESOURCES_LIST_CHANGED => RegistryEvent::ResourcesChanged,
        other => {
            tracing::info!(server = %name, method = %other, "downstream notification");
            return;
        }
    };
    let Some(client) = client.upgrade() else {
        return;
    };
    let events = events.clone();
    tokio::spawn(async move {
        let refreshed = match event {
            RegistryEvent::ToolsChanged => client.list_tools().await.map(|_| ()),
            RegistryEvent::ResourcesChanged => client.list_resources().await.map(|_| ()),
        };
        match refreshed {
            Ok(()) => {
                let _ = events.send(event);
            }
            Err(e) => tracing::warn!(
                server = %client.name(),
                error = %e,
                "refresh after list_changed failed"
            ),
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────────────────────
