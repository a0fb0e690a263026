//! Edge device discovery engine
//!
//! Finds IoT and network devices through several protocols running side by
//! side, keeps a deduplicated registry of what was seen and publishes
//! lifecycle events for anything that wants to react.
//!
//! # Features
//!
//! - Plugin framework with dependency ordering and hot reload
//! - Priority scheduler with retry, backoff and adaptive intervals
//! - Async event bus with filtering and bounded history
//! - Built-in mDNS, SSDP, SNMP and TCP scan protocols
//! - Device registry with identity merging and staleness tracking

// Core modules
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod plugins;
pub mod protocols;
pub mod scheduler;

// Re-export main types for convenience
pub use config::DiscoveryConfig;
pub use device::{Device, DeviceStatus, DeviceType, DiscoveryParams, DiscoveryResult};
pub use engine::{AggregatedResult, DiscoveryEngine, EngineStatistics};
pub use error::{EngineError, Result};
pub use events::{DiscoveryEvent, EventBus, EventFilter, EventKind, EventType};
pub use plugins::{DiscoveryPlugin, PluginConfig, PluginManager, PluginMetadata};
pub use scheduler::{DiscoveryJob, JobPriority, Scheduler};
