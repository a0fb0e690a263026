//! Authoritative in-memory device registry
//!
//! Devices are stored under the identity key they were first registered
//! with. An alias index maps every serial, MAC and address key a device has
//! been seen under back to that key, so a device that later reveals its
//! serial keeps a single entry.

use crate::config::RegistryConfig;
use crate::device::{Device, DeviceStatus, MergeChanges};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// What merging one sighting did to the registry
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    New(Device),
    Updated { device: Device, changes: MergeChanges },
    Unchanged(Device),
}

impl MergeOutcome {
    pub fn device(&self) -> &Device {
        match self {
            MergeOutcome::New(device)
            | MergeOutcome::Updated { device, .. }
            | MergeOutcome::Unchanged(device) => device,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, MergeOutcome::New(_))
    }
}

/// Result of a liveness sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub stale: Vec<String>,
    /// Devices that turned lost in this sweep
    pub lost: Vec<Device>,
    /// Devices dropped after `evict_after`
    pub evicted: Vec<Device>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub stale: usize,
    pub lost: usize,
    pub by_protocol: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    aliases: HashMap<String, String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one sighting, creating the entry if the device is unknown
    pub fn merge(&mut self, incoming: Device) -> MergeOutcome {
        match self.find_match(&incoming) {
            Some(id) => {
                let Some(existing) = self.devices.get_mut(&id) else {
                    return self.insert_new(incoming);
                };
                let changes = existing.merge_from(&incoming);
                let device = existing.clone();
                self.index(&device);
                if changes.is_empty() {
                    MergeOutcome::Unchanged(device)
                } else {
                    MergeOutcome::Updated { device, changes }
                }
            }
            None => self.insert_new(incoming),
        }
    }

    fn insert_new(&mut self, mut device: Device) -> MergeOutcome {
        device.id = device.identity_key();
        device.status = DeviceStatus::Active;
        self.index(&device);
        self.devices.insert(device.id.clone(), device.clone());
        MergeOutcome::New(device)
    }

    /// Strongest alias that points at a device this sighting does not contradict
    fn find_match(&self, incoming: &Device) -> Option<String> {
        incoming
            .alias_keys()
            .iter()
            .filter_map(|key| self.aliases.get(key))
            .find(|id| {
                self.devices
                    .get(*id)
                    .map(|existing| !conflicts(existing, incoming))
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn index(&mut self, device: &Device) {
        for key in device.alias_keys() {
            self.aliases.insert(key, device.id.clone());
        }
        for address in &device.addresses {
            self.aliases
                .entry(format!("ip:{address}"))
                .or_insert_with(|| device.id.clone());
        }
    }

    /// Look a device up by id or by any alias key (`mac:..`, `ip:..`)
    pub fn get(&self, key: &str) -> Option<&Device> {
        self.devices.get(key).or_else(|| {
            self.aliases
                .get(key)
                .and_then(|id| self.devices.get(id))
        })
    }

    /// All devices ordered by id
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn remove(&mut self, id: &str) -> Option<Device> {
        let device = self.devices.remove(id)?;
        self.aliases.retain(|_, target| target != id);
        Some(device)
    }

    /// Age devices: `stale` after `stale_after`, `lost` after `lost_after`,
    /// removed after `evict_after`.
    ///
    /// A device is reported lost once, on the sweep that makes it lost, even
    /// when the same sweep also evicts it.
    pub fn sweep(&mut self, now: DateTime<Utc>, limits: &RegistryConfig) -> SweepReport {
        let stale_after = to_chrono(limits.stale_after);
        let lost_after = to_chrono(limits.lost_after);
        let evict_after = to_chrono(limits.evict_after);
        let mut report = SweepReport::default();
        let mut expired = Vec::new();

        for device in self.devices.values_mut() {
            let age = now - device.last_seen;
            if age >= lost_after {
                if device.status != DeviceStatus::Lost {
                    device.status = DeviceStatus::Lost;
                    report.lost.push(device.clone());
                }
                if age >= evict_after {
                    expired.push(device.id.clone());
                }
            } else if age >= stale_after && device.status == DeviceStatus::Active {
                device.status = DeviceStatus::Stale;
                report.stale.push(device.id.clone());
            }
        }

        report.evicted = expired.iter().filter_map(|id| self.remove(id)).collect();
        report
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.devices.len(),
            ..Default::default()
        };
        for device in self.devices.values() {
            match device.status {
                DeviceStatus::Active => stats.active += 1,
                DeviceStatus::Stale => stats.stale += 1,
                DeviceStatus::Lost => stats.lost += 1,
            }
            for protocol in &device.protocols {
                *stats.by_protocol.entry(protocol.clone()).or_insert(0) += 1;
            }
            *stats
                .by_type
                .entry(device.device_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }
}

/// Two sightings that disagree on serial or MAC are different devices
fn conflicts(existing: &Device, incoming: &Device) -> bool {
    let differs = |a: &Option<String>, b: &Option<String>, normalize: fn(&str) -> String| match (a, b) {
        (Some(a), Some(b)) if !a.trim().is_empty() && !b.trim().is_empty() => normalize(a) != normalize(b),
        _ => false,
    };
    differs(&existing.serial, &incoming.serial, |s| s.trim().to_lowercase())
        || differs(&existing.mac_address, &incoming.mac_address, crate::device::normalize_mac)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_same_identity_merges_with_later_last_seen() {
        let mut registry = DeviceRegistry::new();
        let earlier = Utc::now() - ChronoDuration::minutes(5);
        let later = Utc::now();

        let first = Device::new(ip("10.0.0.5"), "mdns").with_last_seen(later).with_name("hub");
        let second = Device::new(ip("10.0.0.5"), "ssdp").with_last_seen(earlier);

        assert!(registry.merge(first).is_new());
        let outcome = registry.merge(second);
        assert!(!outcome.is_new());

        assert_eq!(registry.len(), 1);
        let device = registry.get("ip:10.0.0.5").unwrap();
        assert_eq!(device.last_seen, later);
        assert_eq!(device.first_seen, earlier);
        assert!(device.protocols.contains("mdns") && device.protocols.contains("ssdp"));
    }

    #[test]
    fn test_learning_serial_later_keeps_one_entry() {
        let mut registry = DeviceRegistry::new();
        registry.merge(Device::new(ip("10.0.0.7"), "network_scan").with_mac("AA-BB-CC-00-11-22"));
        let outcome = registry.merge(
            Device::new(ip("10.0.0.7"), "ssdp")
                .with_mac("aa:bb:cc:00:11:22")
                .with_serial("SN-1"),
        );

        match &outcome {
            MergeOutcome::Updated { changes, .. } => {
                assert!(changes.changed_fields.contains(&"serial".to_string()))
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(outcome.device().id, "mac:aa:bb:cc:00:11:22");
        assert!(registry.get("serial:sn-1").is_some());
    }

    #[test]
    fn test_conflicting_serial_on_same_address_is_new_device() {
        let mut registry = DeviceRegistry::new();
        registry.merge(Device::new(ip("10.0.0.9"), "ssdp").with_serial("A"));
        let outcome = registry.merge(Device::new(ip("10.0.0.9"), "ssdp").with_serial("B"));
        assert!(outcome.is_new());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_resighting_without_changes_is_unchanged() {
        let mut registry = DeviceRegistry::new();
        let device = Device::new(ip("10.0.0.3"), "mdns").with_port(80);
        registry.merge(device.clone());
        let outcome = registry.merge(device.with_last_seen(Utc::now()));
        assert!(matches!(outcome, MergeOutcome::Unchanged(_)));
    }

    #[test]
    fn test_sweep_marks_stale_then_lost_once() {
        let mut registry = DeviceRegistry::new();
        let seen = Utc::now() - ChronoDuration::minutes(20);
        registry.merge(Device::new(ip("10.0.0.1"), "mdns").with_last_seen(seen));
        registry.merge(Device::new(ip("10.0.0.2"), "mdns"));

        let limits = RegistryConfig::default();

        let report = registry.sweep(Utc::now(), &limits);
        assert_eq!(report.stale, vec!["ip:10.0.0.1"]);
        assert!(report.lost.is_empty());

        let later = Utc::now() + ChronoDuration::minutes(15);
        let report = registry.sweep(later, &limits);
        assert_eq!(report.lost.len(), 1);
        assert_eq!(registry.get("ip:10.0.0.1").unwrap().status, DeviceStatus::Lost);
        assert!(registry.sweep(later, &limits).lost.is_empty());

        let stats = registry.stats();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.by_protocol["mdns"], 2);

        let outcome = registry.merge(Device::new(ip("10.0.0.1"), "mdns").with_last_seen(later));
        assert_eq!(outcome.device().status, DeviceStatus::Active);
    }

    #[test]
    fn test_lost_device_is_evicted_with_its_aliases() {
        let mut registry = DeviceRegistry::new();
        let seen = Utc::now() - ChronoDuration::hours(3);
        registry.merge(
            Device::new(ip("10.0.0.4"), "ssdp")
                .with_mac("aa:bb:cc:00:00:04")
                .with_last_seen(seen),
        );
        registry.merge(Device::new(ip("10.0.0.5"), "mdns"));
        assert!(registry.get("ip:10.0.0.4").is_some());

        let limits = RegistryConfig {
            evict_after: Duration::from_secs(7200),
            ..Default::default()
        };
        let report = registry.sweep(Utc::now(), &limits);

        assert_eq!(report.lost.len(), 1);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].id, "mac:aa:bb:cc:00:00:04");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("mac:aa:bb:cc:00:00:04").is_none());
        assert!(registry.get("ip:10.0.0.4").is_none());
        assert!(registry.sweep(Utc::now(), &limits).evicted.is_empty());

        let outcome = registry.merge(Device::new(ip("10.0.0.4"), "ssdp").with_mac("aa:bb:cc:00:00:04"));
        assert!(outcome.is_new());
    }
}
