//! Plugin capability contract
//!
//! A protocol plugin implements [`DiscoveryPlugin`]; a [`PluginFactory`]
//! builds instances from a [`PluginConfig`]. Factories are what gets
//! registered, either compiled in or referenced by a manifest file.

use crate::config::{DiscoveryConfig, ProtocolConfig};
use crate::device::{DiscoveryParams, DiscoveryResult};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Plugin API version implemented by this host
pub const PLUGIN_API_VERSION: &str = "1.0";

/// Static description of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    /// Plugins that must be active before this one initializes
    pub dependencies: Vec<String>,
    pub supported_protocols: Vec<String>,
    /// Minimum host API version, `major.minor`
    pub api_version: String,
    pub tags: Vec<String>,
}

impl PluginMetadata {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            dependencies: Vec::new(),
            supported_protocols: Vec::new(),
            api_version: PLUGIN_API_VERSION.to_string(),
            tags: Vec::new(),
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author<S: Into<String>>(mut self, author: S) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_dependency<S: Into<String>>(mut self, dependency: S) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_protocol<S: Into<String>>(mut self, protocol: S) -> Self {
        self.supported_protocols.push(protocol.into());
        self
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_api_version<S: Into<String>>(mut self, api_version: S) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Same major version and a minor not newer than the host's
    pub fn is_api_compatible(&self) -> bool {
        let parse = |v: &str| -> Option<(u32, u32)> {
            let mut parts = v.trim().split('.');
            let major = parts.next()?.parse().ok()?;
            let minor = parts.next().unwrap_or("0").parse().ok()?;
            Some((major, minor))
        };
        match (parse(&self.api_version), parse(PLUGIN_API_VERSION)) {
            (Some((major, minor)), Some((host_major, host_minor))) => {
                major == host_major && minor <= host_minor
            }
            _ => false,
        }
    }

    /// Load-time capability check
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::plugin_load("plugin name is required"));
        }
        if !self.is_api_compatible() {
            return Err(EngineError::plugin_load(format!(
                "plugin '{}' targets API {} but host implements {}",
                self.name, self.api_version, PLUGIN_API_VERSION
            )));
        }
        if self.supported_protocols.is_empty() {
            return Err(EngineError::plugin_load(format!(
                "plugin '{}' declares no supported protocols",
                self.name
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Registered,
    Initializing,
    Active,
    Failed,
    Unloading,
    Unloaded,
}

/// Runtime configuration for one plugin instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub plugin_name: String,
    pub enabled: bool,
    pub priority: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub settings: HashMap<String, Value>,
}

impl PluginConfig {
    pub fn new<S: Into<String>>(plugin_name: S) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            enabled: true,
            priority: 100,
            timeout: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            settings: HashMap::new(),
        }
    }

    /// Derive a plugin config from the engine's protocol table
    pub fn from_protocol(name: &str, protocol: &ProtocolConfig, config: &DiscoveryConfig) -> Self {
        let allowed = config.plugins.enabled.is_empty()
            || config.plugins.enabled.iter().any(|n| n == name);
        Self {
            plugin_name: name.to_string(),
            enabled: protocol.enabled && allowed,
            priority: protocol.priority,
            timeout: protocol.timeout,
            retry_count: protocol.max_retries.unwrap_or(config.scheduler.max_retries),
            retry_delay: config.scheduler.retry_base_delay,
            settings: protocol.settings.clone(),
        }
    }

    pub fn with_setting<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.plugin_name.trim().is_empty() {
            return Err(EngineError::config("plugin_name is required"));
        }
        if self.timeout.is_zero() {
            return Err(EngineError::config(format!(
                "plugin '{}': timeout must be greater than zero",
                self.plugin_name
            )));
        }
        Ok(())
    }
}

/// The capability every protocol plugin provides.
///
/// Instances are shared between concurrent jobs, so all methods take `&self`.
#[async_trait]
pub trait DiscoveryPlugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    async fn initialize(&self, config: &PluginConfig) -> Result<()>;

    async fn discover(&self, params: &DiscoveryParams) -> Result<DiscoveryResult>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds plugin instances
pub trait PluginFactory: Send + Sync {
    /// Metadata of the plugins this factory builds; `name` is the factory kind
    fn metadata(&self) -> PluginMetadata;

    fn create(&self, config: &PluginConfig) -> Result<Arc<dyn DiscoveryPlugin>>;
}

type Constructor = dyn Fn(&PluginConfig) -> Result<Arc<dyn DiscoveryPlugin>> + Send + Sync;

/// Factory backed by a closure
pub struct FnFactory {
    metadata: PluginMetadata,
    constructor: Box<Constructor>,
}

impl PluginFactory for FnFactory {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn create(&self, config: &PluginConfig) -> Result<Arc<dyn DiscoveryPlugin>> {
        (self.constructor)(config)
    }
}

/// Wrap a constructor closure as a factory
pub fn factory_fn<F>(metadata: PluginMetadata, constructor: F) -> Arc<dyn PluginFactory>
where
    F: Fn(&PluginConfig) -> Result<Arc<dyn DiscoveryPlugin>> + Send + Sync + 'static,
{
    Arc::new(FnFactory {
        metadata,
        constructor: Box::new(constructor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_compatibility() {
        let meta = PluginMetadata::new("mdns", "1.0.0").with_protocol("mdns");
        assert!(meta.is_api_compatible());
        assert!(meta.validate().is_ok());

        assert!(!meta.clone().with_api_version("2.0").is_api_compatible());
        assert!(!meta.clone().with_api_version("1.9").is_api_compatible());
        assert!(!meta.with_api_version("garbage").is_api_compatible());
    }

    #[test]
    fn test_metadata_requires_protocols() {
        let err = PluginMetadata::new("empty", "0.1").validate().unwrap_err();
        assert!(err.to_string().contains("no supported protocols"));
    }

    #[test]
    fn test_plugin_config_from_protocol() {
        let mut config = DiscoveryConfig::new();
        config.plugins.enabled = vec!["ssdp".to_string()];

        let mdns = PluginConfig::from_protocol("mdns", &config.protocol("mdns"), &config);
        assert!(!mdns.enabled);
        assert_eq!(mdns.priority, 90);

        let ssdp = PluginConfig::from_protocol("ssdp", &config.protocol("ssdp"), &config);
        assert!(ssdp.enabled);
        assert_eq!(ssdp.retry_count, config.scheduler.max_retries);
        assert!(ssdp.settings.contains_key("search_targets"));
    }

    #[test]
    fn test_plugin_config_validation() {
        assert!(PluginConfig::new("x").validate().is_ok());
        let mut bad = PluginConfig::new("x");
        bad.timeout = Duration::ZERO;
        assert!(bad.validate().is_err());
        assert!(PluginConfig::new(" ").validate().is_err());
    }
}
