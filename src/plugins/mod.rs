//! Plugin framework
//!
//! - [`base`]: the capability contract, metadata and per-plugin config
//! - [`manifest`]: `*.toml` plugin manifests
//! - [`registry`]: registered factories and dependency resolution
//! - [`manager`]: lifecycle, isolation and hot reload
//! - [`watcher`]: filesystem change notifications

pub mod base;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod watcher;

pub use base::{
    factory_fn, DiscoveryPlugin, PluginConfig, PluginFactory, PluginMetadata, PluginState,
    PLUGIN_API_VERSION,
};
pub use manager::{LoadReport, PluginManager, PluginManagerStats, PluginStats, PluginStatus};
pub use manifest::PluginManifest;
pub use registry::{PluginRegistry, PluginSource};
pub use watcher::{PluginChange, PluginWatcher};
