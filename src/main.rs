//! `mcp-gate` binary: serve the gateway to one host over stdio.

use std::sync::Arc;

use anyhow::{Context, Result};

use mcp_gate::catalog::Catalog;
use mcp_gate::config::GatewayConfig;
use mcp_gate::mcp_client::GatewayRegistry;
use mcp_gate::upstream::GatewayServer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::from_env().context("failed to load configuration")?;
    mcp_gate::init_tracing(&config).context("failed to initialize logging")?;

    let catalog = match &config.catalog_path {
        Some(path) => Catalog::load(path),
        None => Catalog::embedded(),
    }
    .context("failed to load tool catalog")?;
    let catalog = Arc::new(catalog);
    tracing::info!(entries = catalog.len(), "catalog ready");

    let registry =
        Arc::new(GatewayRegistry::new().with_request_timeout(config.request_timeout()));

    autoinstall(&config, &catalog, &registry).await;

    let mut server = GatewayServer::new(Arc::clone(&registry));
    if config.with_admin_tools {
        server = server.with_admin_tools(Arc::clone(&catalog));
    }

    tracing::info!(admin_tools = config.with_admin_tools, "serving on stdio");
    Arc::new(server)
        .serve_stdio()
        .await
        .context("upstream session failed")?;

    tracing::info!("MCP-Gate stopped");
    Ok(())
}

/// Install the configured startup tools concurrently. Failures are logged;
/// failed clients stay in the registry for inspection.
async fn autoinstall(config: &GatewayConfig, catalog: &Catalog, registry: &GatewayRegistry) {
    let mut entries = Vec::new();
    for name in &config.autoinstall {
        match catalog.get(name) {
            Some(entry) => entries.push(entry.clone()),
            None => tracing::warn!(tool = %name, "autoinstall entry not in catalog"),
        }
    }
    if entries.is_empty() {
        return;
    }

    for (name, result) in registry.install_all(&entries).await {
        match result {
            Ok(outcome) => {
                if let Some(e) = outcome.connect_error {
                    tracing::warn!(tool = %name, error = %e, "autoinstall failed to connect");
                }
            }
            Err(e) => tracing::warn!(tool = %name, error = %e, "autoinstall rejected"),
        }
    }
}
