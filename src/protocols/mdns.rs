//! mDNS / DNS-SD discovery
//!
//! Sends one PTR query for the configured service types to the mDNS group
//! and turns the PTR, SRV, TXT and address records of every answer into
//! devices, one per advertised host.

use super::{collect_datagrams, listen_window, multicast_socket, PLUGIN_VERSION};
use crate::device::{Device, DeviceType, DiscoveryParams, DiscoveryResult};
use crate::error::{EngineError, Result};
use crate::plugins::{DiscoveryPlugin, PluginConfig, PluginMetadata};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;
const TYPE_SRV: u16 = 33;
const CLASS_IN: u16 = 0x0001;
/// "Unicast response requested" bit on the question class
const CLASS_QU: u16 = 0x8000;
const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 16;
const DEFAULT_LISTEN: Duration = Duration::from_secs(3);

pub const DEFAULT_SERVICE_TYPES: &[&str] = &[
    "_services._dns-sd._udp.local",
    "_http._tcp.local",
    "_https._tcp.local",
    "_ipp._tcp.local",
    "_printer._tcp.local",
    "_ssh._tcp.local",
    "_mqtt._tcp.local",
    "_coap._udp.local",
    "_airplay._tcp.local",
    "_hap._tcp.local",
];

/// A resource record the discovery cares about
#[derive(Debug, Clone, PartialEq)]
pub enum DnsRecord {
    Ptr { name: String, target: String },
    Srv { name: String, port: u16, target: String },
    Txt { name: String, entries: BTreeMap<String, String> },
    Address { name: String, address: IpAddr },
}

fn malformed(what: &str) -> EngineError {
    EngineError::protocol(format!("malformed mDNS packet: {what}"))
}

fn encode_name(name: &str, buf: &mut Vec<u8>) {
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        let bytes = &label.as_bytes()[..label.len().min(63)];
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
    }
    buf.push(0);
}

/// One query packet asking for PTR records of every service type
pub fn build_query(service_types: &[String]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + service_types.len() * 32);
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&(service_types.len() as u16).to_be_bytes());
    packet.extend_from_slice(&[0; 6]);
    for service_type in service_types {
        encode_name(service_type, &mut packet);
        packet.extend_from_slice(&TYPE_PTR.to_be_bytes());
        packet.extend_from_slice(&(CLASS_IN | CLASS_QU).to_be_bytes());
    }
    packet
}

fn be16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| malformed("truncated field"))
}

/// Read a possibly compressed name at `pos`; returns it with the offset after it
fn read_name(data: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut labels = Vec::new();
    let mut resume = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(pos).ok_or_else(|| malformed("name runs past end"))? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => {
                pos += 1;
                break;
            }
            0x00 => {
                let label = data
                    .get(pos + 1..pos + 1 + len)
                    .ok_or_else(|| malformed("label runs past end"))?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            0xC0 => {
                let low = *data.get(pos + 1).ok_or_else(|| malformed("truncated pointer"))? as usize;
                resume.get_or_insert(pos + 2);
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(malformed("compression pointer loop"));
                }
                pos = ((len & 0x3F) << 8) | low;
            }
            _ => return Err(malformed("reserved label type")),
        }
    }
    Ok((labels.join("."), resume.unwrap_or(pos)))
}

fn parse_txt(rdata: &[u8]) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    let mut pos = 0;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        pos += 1;
        let Some(chunk) = rdata.get(pos..pos + len) else {
            break;
        };
        pos += len;
        let text = String::from_utf8_lossy(chunk);
        match text.split_once('=') {
            Some((key, value)) => entries.insert(key.to_string(), value.to_string()),
            None if !text.is_empty() => entries.insert(text.to_string(), String::new()),
            None => None,
        };
    }
    entries
}

/// Parse every answer, authority and additional record of a DNS message
pub fn parse_message(data: &[u8]) -> Result<Vec<DnsRecord>> {
    if data.len() < HEADER_LEN {
        return Err(malformed("shorter than header"));
    }
    let questions = be16(data, 4)?;
    let records_total = be16(data, 6)? as usize + be16(data, 8)? as usize + be16(data, 10)? as usize;

    let mut pos = HEADER_LEN;
    for _ in 0..questions {
        let (_, next) = read_name(data, pos)?;
        pos = next + 4;
    }

    let mut records = Vec::new();
    for _ in 0..records_total {
        let (name, next) = read_name(data, pos)?;
        let rtype = be16(data, next)?;
        let rdlen = be16(data, next + 8)? as usize;
        let start = next + 10;
        let end = start + rdlen;
        let rdata = data
            .get(start..end)
            .ok_or_else(|| malformed("record data runs past end"))?;

        match rtype {
            TYPE_PTR => records.push(DnsRecord::Ptr {
                name,
                target: read_name(data, start)?.0,
            }),
            TYPE_SRV if rdlen >= 7 => records.push(DnsRecord::Srv {
                name,
                port: be16(rdata, 4)?,
                target: read_name(data, start + 6)?.0,
            }),
            TYPE_TXT => records.push(DnsRecord::Txt {
                name,
                entries: parse_txt(rdata),
            }),
            TYPE_A if rdlen == 4 => records.push(DnsRecord::Address {
                name,
                address: IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
            }),
            TYPE_AAAA if rdlen == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                records.push(DnsRecord::Address {
                    name,
                    address: IpAddr::V6(Ipv6Addr::from(octets)),
                });
            }
            _ => {}
        }
        pos = end;
    }
    Ok(records)
}

/// "Hub._http._tcp.local" -> ("Hub", "_http._tcp.local")
fn split_instance(instance: &str) -> Option<(&str, &str)> {
    let at = instance.find("._")?;
    Some((&instance[..at], &instance[at + 1..]))
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

#[derive(Debug, Default)]
struct HostGroup {
    hostname: Option<String>,
    addresses: BTreeSet<IpAddr>,
    instances: BTreeSet<String>,
    services: BTreeSet<String>,
    ports: BTreeSet<u16>,
    txt: BTreeMap<String, String>,
}

/// Group the records of one response into devices, one per advertised host.
///
/// Records that never name a host are attributed to `source`.
pub fn devices_from_records(records: &[DnsRecord], source: IpAddr) -> Vec<Device> {
    let mut hosts: BTreeMap<String, (String, BTreeSet<IpAddr>)> = BTreeMap::new();
    let mut txt: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for record in records {
        match record {
            DnsRecord::Address { name, address } => {
                hosts
                    .entry(key(name))
                    .or_insert_with(|| (name.clone(), BTreeSet::new()))
                    .1
                    .insert(*address);
            }
            DnsRecord::Txt { name, entries } => {
                txt.entry(key(name)).or_default().extend(entries.clone());
            }
            _ => {}
        }
    }

    let mut groups: BTreeMap<String, HostGroup> = BTreeMap::new();
    let source_key = format!("addr:{source}");
    let mut with_srv = BTreeSet::new();

    for record in records {
        if let DnsRecord::Srv { name, port, target } = record {
            with_srv.insert(key(name));
            let host_key = key(target);
            let group = groups.entry(host_key.clone()).or_default();
            group.hostname = Some(target.trim_end_matches('.').to_string());
            match hosts.get(&host_key) {
                Some((_, addresses)) => group.addresses.extend(addresses),
                None => {
                    group.addresses.insert(source);
                }
            }
            attach_instance(group, name, &txt);
            if *port > 0 {
                group.ports.insert(*port);
            }
        }
    }

    for record in records {
        if let DnsRecord::Ptr { target, .. } = record {
            if with_srv.contains(&key(target)) || split_instance(target).is_none() {
                continue;
            }
            let group = groups.entry(source_key.clone()).or_default();
            group.addresses.insert(source);
            attach_instance(group, target, &txt);
        }
    }

    for (host_key, (hostname, addresses)) in &hosts {
        if !groups.contains_key(host_key) {
            groups.insert(
                host_key.clone(),
                HostGroup {
                    hostname: Some(hostname.trim_end_matches('.').to_string()),
                    addresses: addresses.clone(),
                    ..Default::default()
                },
            );
        }
    }

    groups.into_values().filter_map(build_device).collect()
}

fn attach_instance(group: &mut HostGroup, instance: &str, txt: &BTreeMap<String, BTreeMap<String, String>>) {
    let instance = instance.trim_end_matches('.');
    if let Some((_, service_type)) = split_instance(instance) {
        group.services.insert(service_type.to_string());
    }
    group.instances.insert(instance.to_string());
    if let Some(entries) = txt.get(&key(instance)) {
        group.txt.extend(entries.clone());
    }
}

fn build_device(group: HostGroup) -> Option<Device> {
    let primary = group
        .addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| group.addresses.iter().next())
        .copied()?;

    let mut device = Device::new(primary, "mdns").with_device_type(classify(&group.services, &group.txt));
    device.addresses = group.addresses.iter().copied().filter(|a| *a != primary).collect();
    device.hostname = group.hostname.clone();
    device.ports = group.ports.clone();
    device.services = group.services.clone();

    let txt = &group.txt;
    let first = |keys: &[&str]| keys.iter().find_map(|k| txt.get(*k).filter(|v| !v.is_empty()).cloned());
    device.model = first(&["model", "md"]);
    device.manufacturer = first(&["manufacturer", "vendor"]);
    device.firmware_version = first(&["version", "fw"]);
    device.name = first(&["name", "friendly_name"]).or_else(|| {
        group
            .instances
            .iter()
            .find_map(|i| split_instance(i).map(|(label, _)| label.to_string()))
    });
    device.capabilities = group.txt.clone();
    if !group.instances.is_empty() {
        device.metadata.insert(
            "mdns_instances".to_string(),
            group.instances.iter().cloned().collect::<Vec<_>>().join(","),
        );
    }
    Some(device)
}

/// Device type from advertised services and TXT values
pub fn classify(services: &BTreeSet<String>, txt: &BTreeMap<String, String>) -> DeviceType {
    let has = |needles: &[&str]| {
        services
            .iter()
            .any(|s| needles.iter().any(|n| s.to_lowercase().contains(n)))
    };
    let txt_mentions = |needles: &[&str]| {
        txt.values()
            .any(|v| needles.iter().any(|n| v.to_lowercase().contains(n)))
    };

    if has(&["_ipp", "_printer", "_pdl-datastream"]) {
        DeviceType::Printer
    } else if has(&["_hap", "_homekit"]) {
        DeviceType::SmartHome
    } else if has(&["_airplay", "_googlecast", "_raop"]) {
        DeviceType::MediaServer
    } else if has(&["_mqtt", "_coap"]) {
        DeviceType::IotSensor
    } else if has(&["_http", "_https"]) {
        if txt_mentions(&["camera"]) {
            DeviceType::Camera
        } else if txt_mentions(&["media", "dlna"]) {
            DeviceType::MediaServer
        } else {
            DeviceType::IotGateway
        }
    } else if has(&["_ssh", "_telnet"]) {
        DeviceType::IotGateway
    } else {
        DeviceType::Unknown
    }
}

/// Multicast DNS service discovery
pub struct MdnsPlugin {
    config: RwLock<Option<PluginConfig>>,
}

impl MdnsPlugin {
    pub fn new() -> Self {
        Self {
            config: RwLock::new(None),
        }
    }

    pub fn plugin_metadata() -> PluginMetadata {
        PluginMetadata::new("mdns", PLUGIN_VERSION)
            .with_description("Multicast DNS / DNS-SD service discovery")
            .with_protocol("mdns")
            .with_tag("multicast")
    }
}

impl Default for MdnsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryPlugin for MdnsPlugin {
    fn metadata(&self) -> PluginMetadata {
        Self::plugin_metadata()
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<()> {
        *self.config.write().await = Some(config.clone());
        Ok(())
    }

    async fn discover(&self, params: &DiscoveryParams) -> Result<DiscoveryResult> {
        let started = Instant::now();
        let config = self.config.read().await.clone();
        let service_types = params
            .get_str_list("service_types")
            .filter(|types| !types.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_TYPES.iter().map(|s| s.to_string()).collect());
        let window = listen_window(params, DEFAULT_LISTEN, config.as_ref());

        let socket = multicast_socket(255)?;
        socket
            .send_to(&build_query(&service_types), (MDNS_GROUP, MDNS_PORT))
            .await
            .map_err(|e| EngineError::network(format!("mDNS query failed: {e}")))?;
        debug!(service_types = service_types.len(), window_ms = window.as_millis() as u64, "mDNS query sent");

        let responses = collect_datagrams(&socket, window).await;
        let mut devices: BTreeMap<String, Device> = BTreeMap::new();
        for (data, from) in &responses {
            match parse_message(data) {
                Ok(records) => {
                    for device in devices_from_records(&records, from.ip()) {
                        match devices.get_mut(&device.identity_key()) {
                            Some(existing) => {
                                existing.merge_from(&device);
                            }
                            None => {
                                devices.insert(device.identity_key(), device);
                            }
                        }
                    }
                }
                Err(e) => debug!(source = %from, error = %e, "Skipping malformed mDNS response"),
            }
        }

        info!(responses = responses.len(), devices = devices.len(), "mDNS discovery finished");
        Ok(
            DiscoveryResult::success("mdns", devices.into_values().collect(), started.elapsed())
                .with_metadata("responses", responses.len())
                .with_metadata("service_types", service_types),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(buf: &mut Vec<u8>, name: &str, rtype: u16, rdata: &[u8]) {
        encode_name(name, buf);
        buf.extend_from_slice(&rtype.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes());
        buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(rdata);
    }

    fn header(answers: u16) -> Vec<u8> {
        let mut buf = vec![0, 0, 0x84, 0x00, 0, 0];
        buf.extend_from_slice(&answers.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf
    }

    fn name_bytes(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_name(name, &mut buf);
        buf
    }

    fn hub_response() -> Vec<u8> {
        let mut packet = header(4);
        record(&mut packet, "_http._tcp.local", TYPE_PTR, &name_bytes("Hub._http._tcp.local"));

        let mut srv = vec![0, 0, 0, 0, 0x1F, 0x90];
        srv.extend(name_bytes("hub.local"));
        record(&mut packet, "Hub._http._tcp.local", TYPE_SRV, &srv);

        let mut txt = Vec::new();
        for entry in ["model=HX1", "vendor=Acme", "fw=2.1", "flag"] {
            txt.push(entry.len() as u8);
            txt.extend_from_slice(entry.as_bytes());
        }
        record(&mut packet, "Hub._http._tcp.local", TYPE_TXT, &txt);
        record(&mut packet, "hub.local", TYPE_A, &[192, 168, 1, 20]);
        packet
    }

    #[test]
    fn test_query_layout() {
        let query = build_query(&["_http._tcp.local".to_string(), "_ssh._tcp.local.".to_string()]);
        assert_eq!(&query[4..6], &[0, 2]);
        assert_eq!(&query[12..18], b"\x05_http");
        let first_end = HEADER_LEN + name_bytes("_http._tcp.local").len();
        assert_eq!(&query[first_end..first_end + 4], &[0, 12, 0x80, 0x01]);
    }

    #[test]
    fn test_parse_response_into_device() {
        let records = parse_message(&hub_response()).unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.contains(&DnsRecord::Srv {
            name: "Hub._http._tcp.local".into(),
            port: 8080,
            target: "hub.local".into(),
        }));

        let devices = devices_from_records(&records, "192.168.1.99".parse().unwrap());
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.ip_address, "192.168.1.20".parse::<IpAddr>().unwrap());
        assert_eq!(device.hostname.as_deref(), Some("hub.local"));
        assert_eq!(device.name.as_deref(), Some("Hub"));
        assert_eq!(device.model.as_deref(), Some("HX1"));
        assert_eq!(device.manufacturer.as_deref(), Some("Acme"));
        assert_eq!(device.firmware_version.as_deref(), Some("2.1"));
        assert!(device.ports.contains(&8080));
        assert!(device.services.contains("_http._tcp.local"));
        assert_eq!(device.capabilities.get("flag").map(String::as_str), Some(""));
        assert_eq!(device.device_type, DeviceType::IotGateway);
    }

    #[test]
    fn test_compressed_names() {
        let mut packet = header(2);
        let target_offset = packet.len() + name_bytes("cam._http._tcp.local").len() + 10 + 6;
        let mut srv = vec![0, 0, 0, 0, 0, 80];
        srv.extend(name_bytes("cam.local"));
        record(&mut packet, "cam._http._tcp.local", TYPE_SRV, &srv);

        packet.extend_from_slice(&[0xC0 | (target_offset >> 8) as u8, target_offset as u8]);
        packet.extend_from_slice(&TYPE_A.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet.extend_from_slice(&120u32.to_be_bytes());
        packet.extend_from_slice(&4u16.to_be_bytes());
        packet.extend_from_slice(&[10, 0, 0, 8]);

        let records = parse_message(&packet).unwrap();
        assert_eq!(
            records[1],
            DnsRecord::Address {
                name: "cam.local".into(),
                address: "10.0.0.8".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_malformed_packets_are_errors() {
        let packet = hub_response();
        for cut in [5, 20, packet.len() - 3] {
            assert!(parse_message(&packet[..cut]).is_err(), "cut at {cut}");
        }

        let mut looped = header(1);
        looped.extend_from_slice(&[0xC0, 12]);
        assert!(matches!(parse_message(&looped), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_ptr_without_srv_uses_source_address() {
        let mut packet = header(1);
        record(&mut packet, "_ipp._tcp.local", TYPE_PTR, &name_bytes("Office._ipp._tcp.local"));
        let devices = devices_from_records(&parse_message(&packet).unwrap(), "10.9.9.9".parse().unwrap());
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_type, DeviceType::Printer);
        assert_eq!(devices[0].name.as_deref(), Some("Office"));
    }

    #[test]
    fn test_classification() {
        let services = |s: &[&str]| s.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        let txt = |k: &str, v: &str| BTreeMap::from([(k.to_string(), v.to_string())]);

        assert_eq!(classify(&services(&["_http._tcp.local"]), &txt("type", "IP Camera")), DeviceType::Camera);
        assert_eq!(classify(&services(&["_mqtt._tcp.local"]), &BTreeMap::new()), DeviceType::IotSensor);
        assert_eq!(classify(&services(&["_hap._tcp.local"]), &BTreeMap::new()), DeviceType::SmartHome);
        assert_eq!(classify(&services(&["_foo._udp.local"]), &BTreeMap::new()), DeviceType::Unknown);
    }
}
