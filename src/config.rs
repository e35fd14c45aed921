//! Gateway configuration loading.
//!
//! Reads an optional YAML file, then applies `MCP_GATE_*` environment
//! overrides. Every field has a default, so a missing file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::errors::McpError;

/// Env var naming the config file.
pub const CONFIG_PATH_VAR: &str = "MCP_GATE_CONFIG";

/// Config file used when [`CONFIG_PATH_VAR`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Logging sink selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log to stderr instead of a rotated file.
    pub redirect_to_stderr: bool,
    /// Directory for the log file. Defaults to the platform data dir.
    pub dir: Option<PathBuf>,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub app_name: String,
    pub log: LogConfig,
    /// Attach the catalog admin tools to the upstream surface.
    pub with_admin_tools: bool,
    /// Catalog file replacing the embedded one.
    pub catalog_path: Option<PathBuf>,
    /// Deadline for connect, list, call and stop on every downstream client.
    pub request_timeout_secs: u64,
    /// Catalog names installed at startup.
    pub autoinstall: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            app_name: "mcp-gate".into(),
            log: LogConfig::default(),
            with_admin_tools: false,
            catalog_path: None,
            request_timeout_secs: 30,
            autoinstall: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Load from the default location with process environment overrides.
    pub fn from_env() -> Result<Self, McpError> {
        let path = std::env::var_os(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load(&path)
    }

    /// Load `path` (defaults if it does not exist), then apply process
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse `path` without consulting the environment.
    pub fn from_file(path: &Path) -> Result<Self, McpError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|e| McpError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })
    }

    /// Apply `MCP_GATE_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), McpError> {
        if let Some(name) = lookup("MCP_GATE_APP_NAME") {
            self.app_name = name;
        }
        if let Some(value) = lookup("MCP_GATE_LOG_TO_STDERR") {
            self.log.redirect_to_stderr = parse_bool("MCP_GATE_LOG_TO_STDERR", &value)?;
        }
        if let Some(dir) = lookup("MCP_GATE_LOG_DIR") {
            self.log.dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup("MCP_GATE_WITH_ADMIN_TOOLS") {
            self.with_admin_tools = parse_bool("MCP_GATE_WITH_ADMIN_TOOLS", &value)?;
        }
        if let Some(path) = lookup("MCP_GATE_CATALOG") {
            self.catalog_path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup("MCP_GATE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = value.trim().parse().map_err(|e| McpError::Config {
                reason: format!("MCP_GATE_REQUEST_TIMEOUT_SECS: invalid number '{value}': {e}"),
            })?;
        }
        if self.request_timeout_secs == 0 {
            return Err(McpError::Config {
                reason: "request_timeout_secs must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, McpError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(McpError::Config {
            reason: format!("{key}: expected a boolean, got '{other}'"),
        }),
    }
}
