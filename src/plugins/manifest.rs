//! Plugin manifest files
//!
//! A manifest declares a plugin instance backed by a registered factory:
//!
//! ```toml
//! [plugin]
//! name = "office_mdns"
//! kind = "mdns"
//! dependencies = []
//! priority = 95
//! timeout = "5s"
//!
//! [settings]
//! service_types = ["_ipp._tcp.local."]
//! ```

use super::base::PluginConfig;
use crate::error::{EngineError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Parsed manifest file
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub plugin: ManifestPlugin,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

/// `[plugin]` table
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestPlugin {
    pub name: String,
    /// Registered factory building the instance
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry_count: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl PluginManifest {
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content)?;
        if manifest.plugin.name.trim().is_empty() {
            return Err(EngineError::plugin_load("manifest plugin.name is empty"));
        }
        if manifest.plugin.kind.trim().is_empty() {
            return Err(EngineError::plugin_load(format!(
                "manifest for '{}' has no kind",
                manifest.plugin.name
            )));
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| EngineError::plugin_load(format!("{}: {e}", path.display())))
    }

    /// Overlay this manifest on a base config derived from the factory kind
    pub fn apply_to(&self, mut base: PluginConfig) -> PluginConfig {
        base.plugin_name = self.plugin.name.clone();
        base.enabled = base.enabled && self.plugin.enabled;
        if let Some(priority) = self.plugin.priority {
            base.priority = priority;
        }
        if let Some(timeout) = self.plugin.timeout {
            base.timeout = timeout;
        }
        if let Some(retry_count) = self.plugin.retry_count {
            base.retry_count = retry_count;
        }
        for (key, value) in &self.settings {
            base.settings.insert(key.clone(), value.clone());
        }
        base
    }
}

pub fn is_manifest_path(path: &Path) -> bool {
    path.extension().map(|ext| ext == "toml").unwrap_or(false)
}

/// Parse every `*.toml` in `dir`; unreadable files are logged and skipped
pub fn scan_directory(dir: &Path) -> Vec<(PathBuf, PluginManifest)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(directory = %dir.display(), error = %e, "Plugin directory not readable");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_manifest_path(path))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| match PluginManifest::load(&path) {
            Ok(manifest) => Some((path, manifest)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping invalid plugin manifest");
                None
            }
        })
        .collect()
}
