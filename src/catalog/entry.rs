//! Catalog entry: one installable downstream tool server.
//!
//! The document form is flat (`transport`, `command`, `args`, `url`, ...).
//! It is validated once at parse time into [`CatalogEntry`], whose transport
//! parameters are a tagged variant so an ipc entry can never carry a URL and
//! an http entry can never carry a command.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Transport-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    /// Spawn `command` with `args` and speak over its stdio.
    Ipc {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    /// Connect to a streamable HTTP endpoint.
    Http {
        url: String,
        continuous_listening: bool,
    },
    /// A transport kind this gateway cannot build. Kept so the rest of the
    /// catalog stays loadable; installing it fails.
    Unsupported { kind: String },
}

impl TransportSpec {
    /// The document-level name of the transport kind.
    pub fn kind(&self) -> &str {
        match self {
            TransportSpec::Ipc { .. } => "ipc",
            TransportSpec::Http { .. } => "http",
            TransportSpec::Unsupported { kind } => kind,
        }
    }
}

/// One installable tool server. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEntry", into = "RawEntry")]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub transport: TransportSpec,
    /// Informational only.
    pub dependencies: Vec<String>,
    /// Informational only.
    pub platforms: Vec<String>,
}

impl CatalogEntry {
    /// An entry spawned as a subprocess.
    pub fn ipc(name: &str, command: &str, args: Vec<String>) -> Self {
        Self::with_transport(
            name,
            TransportSpec::Ipc {
                command: command.to_string(),
                args,
                env: BTreeMap::new(),
            },
        )
    }

    /// An entry reached over streamable HTTP.
    pub fn http(name: &str, url: &str) -> Self {
        Self::with_transport(
            name,
            TransportSpec::Http {
                url: url.to_string(),
                continuous_listening: false,
            },
        )
    }

    /// An entry naming a transport kind the gateway does not support.
    pub fn unsupported(name: &str, kind: &str) -> Self {
        Self::with_transport(
            name,
            TransportSpec::Unsupported {
                kind: kind.to_string(),
            },
        )
    }

    fn with_transport(name: &str, transport: TransportSpec) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            transport,
            dependencies: Vec::new(),
            platforms: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn command(&self) -> Option<&str> {
        match &self.transport {
            TransportSpec::Ipc { command, .. } => Some(command),
            _ => None,
        }
    }

    pub fn args(&self) -> &[String] {
        match &self.transport {
            TransportSpec::Ipc { args, .. } => args,
            _ => &[],
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            TransportSpec::Http { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Human-readable multi-line description for the admin listing.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Tool: {}", self.name);
        let _ = writeln!(out, "Description: {}", self.description);
        let _ = writeln!(out, "Transport: {}", self.transport.kind());
        match &self.transport {
            TransportSpec::Ipc { command, args, .. } => {
                let _ = writeln!(out, "Command: {command}");
                let _ = writeln!(out, "Args: {args:?}");
            }
            TransportSpec::Http { url, .. } => {
                let _ = writeln!(out, "URL: {url}");
            }
            TransportSpec::Unsupported { .. } => {}
        }
        let _ = writeln!(out, "Dependencies: {:?}", self.dependencies);
        let _ = writeln!(out, "Platforms: {:?}", self.platforms);
        out
    }
}

// ─── Document Form ───────────────────────────────────────────────────────────

/// Flat document shape of an entry, as it appears in the catalog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawEntry {
    name: String,
    #[serde(default)]
    description: String,
    transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    continuous_listening: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    platforms: Vec<String>,
}

impl TryFrom<RawEntry> for CatalogEntry {
    type Error = String;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err("catalog entry has an empty name".into());
        }

        let transport = match raw.transport.as_str() {
            "ipc" => {
                if raw.url.is_some() || raw.continuous_listening {
                    return Err(format!("ipc entry '{name}' must not set url"));
                }
                let command = raw
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| format!("ipc entry '{name}' requires a command"))?;
                TransportSpec::Ipc {
                    command,
                    args: raw.args,
                    env: raw.env,
                }
            }
            "http" => {
                if raw.command.is_some() || !raw.args.is_empty() || !raw.env.is_empty() {
                    return Err(format!("http entry '{name}' must not set command, args or env"));
                }
                let url = raw
                    .url
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| format!("http entry '{name}' requires a url"))?;
                TransportSpec::Http {
                    url,
                    continuous_listening: raw.continuous_listening,
                }
            }
            other => TransportSpec::Unsupported {
                kind: other.to_string(),
            },
        };

        Ok(CatalogEntry {
            name,
            description: raw.description,
            transport,
            dependencies: raw.dependencies,
            platforms: raw.platforms,
        })
    }
}

impl From<CatalogEntry> for RawEntry {
    fn from(entry: CatalogEntry) -> Self {
        let mut raw = RawEntry {
            name: entry.name,
            description: entry.description,
            transport: entry.transport.kind().to_string(),
            dependencies: entry.dependencies,
            platforms: entry.platforms,
            ..RawEntry::default()
        };
        match entry.transport {
            TransportSpec::Ipc { command, args, env } => {
                raw.command = Some(command);
                raw.args = args;
                raw.env = env;
            }
            TransportSpec::Http {
                url,
                continuous_listening,
            } => {
                raw.url = Some(url);
                raw.continuous_listening = continuous_listening;
            }
            TransportSpec::Unsupported { .. } => {}
        }
        raw
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
