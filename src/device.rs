//! Device records and discovery results shared by plugins, the engine and
//! event payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

/// Coarse device classification
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Unknown,
    IotSensor,
    IotGateway,
    Camera,
    Router,
    Switch,
    AccessPoint,
    Printer,
    MediaServer,
    SmartHome,
    Industrial,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Unknown => "unknown",
            DeviceType::IotSensor => "iot_sensor",
            DeviceType::IotGateway => "iot_gateway",
            DeviceType::Camera => "camera",
            DeviceType::Router => "router",
            DeviceType::Switch => "switch",
            DeviceType::AccessPoint => "access_point",
            DeviceType::Printer => "printer",
            DeviceType::MediaServer => "media_server",
            DeviceType::SmartHome => "smart_home",
            DeviceType::Industrial => "industrial",
        }
    }
}

/// Liveness of a registered device
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Active,
    Stale,
    Lost,
}

/// A device seen on the network by one or more protocols
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    /// Identity key, see [`Device::identity_key`]
    pub id: String,

    /// Display name
    pub name: Option<String>,

    pub device_type: DeviceType,

    /// Primary address
    pub ip_address: IpAddr,

    /// Other addresses the device answered from
    pub addresses: BTreeSet<IpAddr>,

    pub mac_address: Option<String>,
    pub hostname: Option<String>,

    /// Hardware serial or UUID when the protocol exposes one
    pub serial: Option<String>,

    pub ports: BTreeSet<u16>,

    /// Protocols that have seen this device
    pub protocols: BTreeSet<String>,

    /// Advertised services (mDNS service names, UPnP service types, ...)
    pub services: BTreeSet<String>,

    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,

    /// Free-form capability data (TXT records, SNMP system values, ...)
    pub capabilities: BTreeMap<String, String>,

    /// Protocol specific metadata
    pub metadata: BTreeMap<String, String>,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: DeviceStatus,
}

/// Field-level result of merging one sighting into another
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeChanges {
    pub changed_fields: Vec<String>,
    pub previous_values: HashMap<String, Value>,
}

impl MergeChanges {
    pub fn is_empty(&self) -> bool {
        self.changed_fields.is_empty()
    }

    fn record<T: Serialize>(&mut self, field: &str, previous: &T) {
        self.changed_fields.push(field.to_string());
        self.previous_values.insert(
            field.to_string(),
            serde_json::to_value(previous).unwrap_or(Value::Null),
        );
    }
}

impl Device {
    /// Create a device seen right now by `protocol`
    pub fn new(ip_address: IpAddr, protocol: &str) -> Self {
        let now = Utc::now();
        let mut device = Self {
            id: String::new(),
            name: None,
            device_type: DeviceType::Unknown,
            ip_address,
            addresses: BTreeSet::new(),
            mac_address: None,
            hostname: None,
            serial: None,
            ports: BTreeSet::new(),
            protocols: BTreeSet::from([protocol.to_string()]),
            services: BTreeSet::new(),
            manufacturer: None,
            model: None,
            firmware_version: None,
            capabilities: BTreeMap::new(),
            metadata: BTreeMap::new(),
            first_seen: now,
            last_seen: now,
            status: DeviceStatus::Active,
        };
        device.id = device.identity_key();
        device
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_serial<S: Into<String>>(mut self, serial: S) -> Self {
        self.serial = Some(serial.into());
        self.id = self.identity_key();
        self
    }

    pub fn with_mac<S: Into<String>>(mut self, mac: S) -> Self {
        self.mac_address = Some(mac.into());
        self.id = self.identity_key();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.insert(port);
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        if self.first_seen > last_seen {
            self.first_seen = last_seen;
        }
        self
    }

    /// Stable key used to deduplicate sightings across protocols.
    ///
    /// Serial beats MAC beats address; the discovering protocol never takes
    /// part so that mDNS and SSDP sightings of one box collapse into one entry.
    pub fn identity_key(&self) -> String {
        if let Some(serial) = non_empty(&self.serial) {
            return format!("serial:{}", serial.to_lowercase());
        }
        if let Some(mac) = non_empty(&self.mac_address) {
            return format!("mac:{}", normalize_mac(mac));
        }
        format!("ip:{}", self.ip_address)
    }

    /// Every key this sighting could be known under, strongest first
    pub fn alias_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(3);
        if let Some(serial) = non_empty(&self.serial) {
            keys.push(format!("serial:{}", serial.to_lowercase()));
        }
        if let Some(mac) = non_empty(&self.mac_address) {
            keys.push(format!("mac:{}", normalize_mac(mac)));
        }
        keys.push(format!("ip:{}", self.ip_address));
        keys
    }

    /// Merge a newer (or older) sighting of the same device into this one.
    ///
    /// `id` is left alone so a registry entry keeps its key once assigned.
    /// Scalar fields take the most recently observed value; sets and maps are
    /// unioned with the newer side winning key conflicts. `last_seen` ends up
    /// as the later of the two timestamps.
    pub fn merge_from(&mut self, other: &Device) -> MergeChanges {
        let mut changes = MergeChanges::default();
        let newer = other.last_seen >= self.last_seen;

        merge_option(&mut self.name, &other.name, newer, "name", &mut changes);
        merge_option(&mut self.hostname, &other.hostname, newer, "hostname", &mut changes);
        merge_option(&mut self.mac_address, &other.mac_address, newer, "mac_address", &mut changes);
        merge_option(&mut self.serial, &other.serial, newer, "serial", &mut changes);
        merge_option(&mut self.manufacturer, &other.manufacturer, newer, "manufacturer", &mut changes);
        merge_option(&mut self.model, &other.model, newer, "model", &mut changes);
        merge_option(
            &mut self.firmware_version,
            &other.firmware_version,
            newer,
            "firmware_version",
            &mut changes,
        );

        if other.device_type != DeviceType::Unknown
            && other.device_type != self.device_type
            && (self.device_type == DeviceType::Unknown || newer)
        {
            changes.record("device_type", &self.device_type);
            self.device_type = other.device_type;
        }

        if other.ip_address != self.ip_address {
            if newer {
                changes.record("ip_address", &self.ip_address);
                self.addresses.insert(self.ip_address);
                self.ip_address = other.ip_address;
            } else if self.addresses.insert(other.ip_address) {
                changes.record("addresses", &self.addresses);
            }
        }

        union_set(&mut self.addresses, &other.addresses, "addresses", &mut changes);
        self.addresses.remove(&self.ip_address);
        union_set(&mut self.ports, &other.ports, "ports", &mut changes);
        union_set(&mut self.protocols, &other.protocols, "protocols", &mut changes);
        union_set(&mut self.services, &other.services, "services", &mut changes);
        union_map(&mut self.capabilities, &other.capabilities, newer, "capabilities", &mut changes);
        union_map(&mut self.metadata, &other.metadata, newer, "metadata", &mut changes);

        if newer {
            if self.status != DeviceStatus::Active {
                changes.record("status", &self.status);
                self.status = DeviceStatus::Active;
            }
            self.last_seen = other.last_seen;
        }
        if other.first_seen < self.first_seen {
            self.first_seen = other.first_seen;
        }

        changes
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Lowercase, colon separated MAC
pub fn normalize_mac(mac: &str) -> String {
    let hex: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return mac.trim().to_lowercase();
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_lowercase())
        .collect::<Vec<_>>()
        .join(":")
}

fn merge_option(
    current: &mut Option<String>,
    incoming: &Option<String>,
    newer: bool,
    field: &str,
    changes: &mut MergeChanges,
) {
    let Some(value) = non_empty(incoming) else {
        return;
    };
    let replace = match current.as_deref() {
        None => true,
        Some(existing) => newer && existing != value,
    };
    if replace {
        changes.record(field, &*current);
        *current = Some(value.to_string());
    }
}

fn union_set<T: Ord + Clone + Serialize>(
    current: &mut BTreeSet<T>,
    incoming: &BTreeSet<T>,
    field: &str,
    changes: &mut MergeChanges,
) {
    if incoming.is_subset(current) {
        return;
    }
    if !changes.changed_fields.iter().any(|f| f == field) {
        changes.record(field, &*current);
    }
    current.extend(incoming.iter().cloned());
}

fn union_map(
    current: &mut BTreeMap<String, String>,
    incoming: &BTreeMap<String, String>,
    newer: bool,
    field: &str,
    changes: &mut MergeChanges,
) {
    let previous = current.clone();
    for (key, value) in incoming {
        match current.get(key) {
            Some(existing) if existing == value || !newer => {}
            _ => {
                current.insert(key.clone(), value.clone());
            }
        }
    }
    if *current != previous {
        changes.record(field, &previous);
    }
}

/// Free-form parameters passed to `discover()`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DiscoveryParams(HashMap<String, Value>);

impl DiscoveryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// A string list, also accepting a single comma separated string
    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.0.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
            ),
            Value::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Fill keys this set does not define from `defaults`
    pub fn with_defaults(mut self, defaults: &HashMap<String, Value>) -> Self {
        for (key, value) in defaults {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &HashMap<String, Value> {
        &self.0
    }
}

impl From<HashMap<String, Value>> for DiscoveryParams {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

/// Outcome of one protocol run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub protocol: String,
    pub success: bool,
    pub devices: Vec<Device>,
    pub error: Option<String>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub metadata: HashMap<String, Value>,
}

impl DiscoveryResult {
    pub fn success(protocol: &str, devices: Vec<Device>, duration: Duration) -> Self {
        Self {
            protocol: protocol.to_string(),
            success: true,
            devices,
            error: None,
            duration,
            metadata: HashMap::new(),
        }
    }

    pub fn failure<S: Into<String>>(protocol: &str, error: S, duration: Duration) -> Self {
        Self {
            protocol: protocol.to_string(),
            success: false,
            devices: Vec::new(),
            error: Some(error.into()),
            duration,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_identity_key_precedence() {
        let device = Device::new(ip("192.168.1.20"), "mdns");
        assert_eq!(device.id, "ip:192.168.1.20");

        let device = device.with_mac("AA-BB-CC-00-11-22");
        assert_eq!(device.id, "mac:aa:bb:cc:00:11:22");

        let device = device.with_serial("SN-1234");
        assert_eq!(device.id, "serial:sn-1234");
    }

    #[test]
    fn test_merge_keeps_latest_values_and_unions_sets() {
        let t0 = Utc::now() - ChronoDuration::seconds(60);
        let t1 = Utc::now();

        let mut existing = Device::new(ip("10.0.0.5"), "mdns")
            .with_name("old name")
            .with_port(80)
            .with_last_seen(t0);
        existing.capabilities.insert("path".into(), "/".into());

        let mut update = Device::new(ip("10.0.0.5"), "ssdp")
            .with_name("Living Room TV")
            .with_port(1900)
            .with_device_type(DeviceType::MediaServer)
            .with_last_seen(t1);
        update.capabilities.insert("upnp".into(), "1".into());

        let changes = existing.merge_from(&update);

        assert_eq!(existing.name.as_deref(), Some("Living Room TV"));
        assert_eq!(existing.device_type, DeviceType::MediaServer);
        assert_eq!(existing.last_seen, t1);
        assert_eq!(existing.first_seen, t0);
        assert!(existing.ports.contains(&80) && existing.ports.contains(&1900));
        assert_eq!(existing.protocols.len(), 2);
        assert_eq!(existing.capabilities.len(), 2);
        assert!(changes.changed_fields.contains(&"name".to_string()));
        assert_eq!(changes.previous_values["name"], serde_json::json!("old name"));
    }

    #[test]
    fn test_merge_older_sighting_only_fills_gaps() {
        let t0 = Utc::now() - ChronoDuration::seconds(60);
        let t1 = Utc::now();

        let mut existing = Device::new(ip("10.0.0.5"), "mdns")
            .with_name("current")
            .with_last_seen(t1);
        let mut stale = Device::new(ip("10.0.0.5"), "snmp")
            .with_name("outdated")
            .with_last_seen(t0);
        stale.model = Some("X200".into());

        existing.merge_from(&stale);

        assert_eq!(existing.name.as_deref(), Some("current"));
        assert_eq!(existing.model.as_deref(), Some("X200"));
        assert_eq!(existing.last_seen, t1);
        assert_eq!(existing.first_seen, t0);
    }

    #[test]
    fn test_identical_sighting_reports_no_changes() {
        let device = Device::new(ip("10.0.0.7"), "mdns").with_name("sensor");
        let mut copy = device.clone();
        assert!(copy.merge_from(&device).is_empty());
    }

    #[test]
    fn test_params_string_list_forms() {
        let params = DiscoveryParams::new()
            .insert("service_types", serde_json::json!(["_http._tcp.local."]))
            .insert("targets", "a, b,,c");
        assert_eq!(
            params.get_str_list("service_types"),
            Some(vec!["_http._tcp.local.".to_string()])
        );
        assert_eq!(params.get_str_list("targets").unwrap().len(), 3);
        assert!(params.get_str_list("missing").is_none());
    }
}
