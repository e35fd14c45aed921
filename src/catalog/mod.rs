//! Catalog of installable downstream tool servers.
//!
//! Read-only after load. The default catalog ships embedded in the binary;
//! a YAML file can replace it at startup.

mod entry;

pub use entry::{CatalogEntry, TransportSpec};

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::mcp_client::errors::McpError;

/// The catalog compiled into the binary.
const EMBEDDED_CATALOG: &str = include_str!("tools.yaml");

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    tools: Vec<CatalogEntry>,
}

/// Ordered, name-unique set of catalog entries.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Load the catalog embedded in the binary.
    pub fn embedded() -> Result<Self, McpError> {
        Self::from_yaml_str(EMBEDDED_CATALOG)
    }

    /// Load a catalog from a YAML file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let content = std::fs::read_to_string(path).map_err(|e| McpError::Catalog {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let catalog = Self::from_yaml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            entries = catalog.len(),
            "loaded catalog"
        );
        Ok(catalog)
    }

    /// Parse a catalog document (`tools: [...]`).
    pub fn from_yaml_str(content: &str) -> Result<Self, McpError> {
        let document: CatalogDocument =
            serde_yaml::from_str(content).map_err(|e| McpError::Catalog {
                reason: format!("malformed catalog: {e}"),
            })?;
        Self::from_entries(document.tools)
    }

    /// Build a catalog from entries, rejecting duplicate names.
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self, McpError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(McpError::Catalog {
                    reason: format!("duplicate catalog entry '{}'", entry.name),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Entries in document order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize back to the document form.
    pub fn to_yaml(&self) -> Result<String, McpError> {
        let document = CatalogDocument {
            tools: self.entries.clone(),
        };
        serde_yaml::to_string(&document).map_err(|e| McpError::Catalog {
            reason: e.to_string(),
        })
    }
}
