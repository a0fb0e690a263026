//! Common test utilities
//!
//! Scriptable plugins and engine configuration for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use edge_discovery::plugins::{factory_fn, PluginFactory};
use edge_discovery::{
    Device, DiscoveryConfig, DiscoveryParams, DiscoveryPlugin, DiscoveryResult, EngineError, PluginConfig,
    PluginMetadata, Result,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a [`MockPlugin`] does when asked to discover
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Report these devices
    Devices(Vec<Device>),
    /// Refuse to initialize
    FailInit,
    /// Return an error from every discover call
    FailDiscover(String),
    /// Sleep before reporting nothing
    Slow(Duration),
}

pub struct MockPlugin {
    name: String,
    behavior: MockBehavior,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DiscoveryPlugin for MockPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(self.name.clone(), "1.0.0").with_protocol(self.name.clone())
    }

    async fn initialize(&self, _config: &PluginConfig) -> Result<()> {
        match self.behavior {
            MockBehavior::FailInit => Err(EngineError::plugin_load(format!("{} cannot open its socket", self.name))),
            _ => Ok(()),
        }
    }

    async fn discover(&self, _params: &DiscoveryParams) -> Result<DiscoveryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            MockBehavior::Devices(devices) => Ok(DiscoveryResult::success(&self.name, devices.clone(), Duration::ZERO)),
            MockBehavior::FailDiscover(message) => Err(EngineError::network(message.clone())),
            MockBehavior::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(DiscoveryResult::success(&self.name, vec![], Duration::ZERO))
            }
            MockBehavior::FailInit => Ok(DiscoveryResult::success(&self.name, vec![], Duration::ZERO)),
        }
    }
}

/// A factory for a mock plugin plus a counter of its discover calls
pub fn mock_factory(name: &str, behavior: MockBehavior) -> (Arc<dyn PluginFactory>, Arc<AtomicUsize>) {
    mock_factory_with_deps(name, &[], behavior)
}

pub fn mock_factory_with_deps(
    name: &str,
    dependencies: &[&str],
    behavior: MockBehavior,
) -> (Arc<dyn PluginFactory>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut metadata = PluginMetadata::new(name, "1.0.0").with_protocol(name);
    for dependency in dependencies {
        metadata = metadata.with_dependency(*dependency);
    }

    let plugin_name = name.to_string();
    let counter = calls.clone();
    let factory = factory_fn(metadata, move |_| -> Result<Arc<dyn DiscoveryPlugin>> {
        Ok(Arc::new(MockPlugin {
            name: plugin_name.clone(),
            behavior: behavior.clone(),
            calls: counter.clone(),
        }))
    });
    (factory, calls)
}

/// A factory whose first plugin behaves and every later one refuses to initialize
pub fn flaky_mock_factory(name: &str, behavior: MockBehavior) -> (Arc<dyn PluginFactory>, Arc<AtomicUsize>) {
    let builds = Arc::new(AtomicUsize::new(0));
    let metadata = PluginMetadata::new(name, "1.0.0").with_protocol(name);

    let plugin_name = name.to_string();
    let counter = builds.clone();
    let factory = factory_fn(metadata, move |_| -> Result<Arc<dyn DiscoveryPlugin>> {
        let behavior = match counter.fetch_add(1, Ordering::SeqCst) {
            0 => behavior.clone(),
            _ => MockBehavior::FailInit,
        };
        Ok(Arc::new(MockPlugin {
            name: plugin_name.clone(),
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }))
    });
    (factory, builds)
}

pub fn device(ip: &str, protocol: &str) -> Device {
    let ip: IpAddr = ip.parse().expect("valid test address");
    Device::new(ip, protocol)
}

/// Defaults without plugin directories, file watching or retries
pub fn test_config() -> DiscoveryConfig {
    let mut config = DiscoveryConfig::new();
    config.plugins.directories = Vec::new();
    config.plugins.auto_reload = false;
    config.scheduler.max_retries = 0;
    config.scheduler.retry_base_delay = Duration::from_millis(10);
    config.scheduler.job_timeout = Duration::from_secs(5);
    config.network.ip_ranges = vec!["127.0.0.1/32".to_string()];
    config
}
