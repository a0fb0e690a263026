//! Discovery event definitions

use crate::device::{Device, DiscoveryParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Event priority, serialized as its numeric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl EventPriority {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl Serialize for EventPriority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.value())
    }
}

impl<'de> Deserialize<'de> for EventPriority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Self::from_value(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid event priority {value}")))
    }
}

/// Event type tag without payload, used by filters and history queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "device.discovered")]
    DeviceDiscovered,
    #[serde(rename = "device.lost")]
    DeviceLost,
    #[serde(rename = "device.updated")]
    DeviceUpdated,
    #[serde(rename = "discovery.started")]
    DiscoveryStarted,
    #[serde(rename = "discovery.completed")]
    DiscoveryCompleted,
    #[serde(rename = "discovery.error")]
    DiscoveryError,
    #[serde(rename = "plugin.loaded")]
    PluginLoaded,
    #[serde(rename = "plugin.unloaded")]
    PluginUnloaded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DeviceDiscovered => "device.discovered",
            EventType::DeviceLost => "device.lost",
            EventType::DeviceUpdated => "device.updated",
            EventType::DiscoveryStarted => "discovery.started",
            EventType::DiscoveryCompleted => "discovery.completed",
            EventType::DiscoveryError => "discovery.error",
            EventType::PluginLoaded => "plugin.loaded",
            EventType::PluginUnloaded => "plugin.unloaded",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s {
            "device.discovered" => EventType::DeviceDiscovered,
            "device.lost" => EventType::DeviceLost,
            "device.updated" => EventType::DeviceUpdated,
            "discovery.started" => EventType::DiscoveryStarted,
            "discovery.completed" => EventType::DiscoveryCompleted,
            "discovery.error" => EventType::DiscoveryError,
            "plugin.loaded" => EventType::PluginLoaded,
            "plugin.unloaded" => EventType::PluginUnloaded,
            other => {
                return Err(crate::error::EngineError::invalid_input(format!(
                    "unknown event type '{other}'"
                )))
            }
        };
        Ok(event_type)
    }
}

/// Variant payloads, flattened next to the common fields when serialized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventKind {
    #[serde(rename = "device.discovered")]
    DeviceDiscovered {
        device: Device,
        protocol: String,
        is_new_device: bool,
    },
    #[serde(rename = "device.lost")]
    DeviceLost {
        device_id: String,
        last_seen: DateTime<Utc>,
        reason: String,
    },
    #[serde(rename = "device.updated")]
    DeviceUpdated {
        device: Device,
        changed_fields: Vec<String>,
        previous_values: HashMap<String, Value>,
    },
    #[serde(rename = "discovery.started")]
    DiscoveryStarted {
        protocols: Vec<String>,
        parameters: DiscoveryParams,
    },
    #[serde(rename = "discovery.completed")]
    DiscoveryCompleted {
        protocol: String,
        duration_ms: u64,
        devices_found: usize,
        success: bool,
    },
    #[serde(rename = "discovery.error")]
    DiscoveryError {
        protocol: String,
        error_message: String,
        error_kind: String,
        recoverable: bool,
    },
    #[serde(rename = "plugin.loaded")]
    PluginLoaded {
        plugin_name: String,
        plugin_version: String,
    },
    #[serde(rename = "plugin.unloaded")]
    PluginUnloaded { plugin_name: String, reason: String },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::DeviceDiscovered { .. } => EventType::DeviceDiscovered,
            EventKind::DeviceLost { .. } => EventType::DeviceLost,
            EventKind::DeviceUpdated { .. } => EventType::DeviceUpdated,
            EventKind::DiscoveryStarted { .. } => EventType::DiscoveryStarted,
            EventKind::DiscoveryCompleted { .. } => EventType::DiscoveryCompleted,
            EventKind::DiscoveryError { .. } => EventType::DiscoveryError,
            EventKind::PluginLoaded { .. } => EventType::PluginLoaded,
            EventKind::PluginUnloaded { .. } => EventType::PluginUnloaded,
        }
    }

    fn default_priority(&self) -> EventPriority {
        match self {
            EventKind::DeviceLost { .. } | EventKind::DiscoveryError { .. } => EventPriority::High,
            _ => EventPriority::Normal,
        }
    }
}

/// An immutable lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub priority: EventPriority,
    /// Component that produced the event ("engine", "plugin_manager", "scheduler", ...)
    pub source: String,
    pub metadata: HashMap<String, Value>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DiscoveryEvent {
    pub fn new<S: Into<String>>(kind: EventKind, source: S) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            priority: kind.default_priority(),
            source: source.into(),
            metadata: HashMap::new(),
            kind,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn device_discovered(device: Device, protocol: &str, is_new_device: bool) -> Self {
        Self::new(
            EventKind::DeviceDiscovered {
                device,
                protocol: protocol.to_string(),
                is_new_device,
            },
            "engine",
        )
    }

    pub fn device_lost(device: &Device) -> Self {
        Self::new(
            EventKind::DeviceLost {
                device_id: device.id.clone(),
                last_seen: device.last_seen,
                reason: "timeout".to_string(),
            },
            "engine",
        )
    }

    pub fn discovery_error(protocol: &str, error_message: &str, error_kind: &str, recoverable: bool) -> Self {
        Self::new(
            EventKind::DiscoveryError {
                protocol: protocol.to_string(),
                error_message: error_message.to_string(),
                error_kind: error_kind.to_string(),
                recoverable,
            },
            "scheduler",
        )
    }

    /// Flat key-value form for log shippers and dashboards
    pub fn to_flat_map(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}
