//! SNMP v1/v2c discovery
//!
//! A minimal BER codec for GetRequest/GetResponse messages, enough to read
//! the MIB-II system group from every host of the configured ranges.

use super::rate_limiter::AdaptiveRateLimiter;
use super::{expand_ranges, PLUGIN_VERSION};
use crate::config::{NetworkConfig, RateLimitConfig};
use crate::device::{Device, DeviceType, DiscoveryParams, DiscoveryResult};
use crate::error::{EngineError, Result};
use crate::plugins::{DiscoveryPlugin, PluginConfig, PluginMetadata};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;

pub const PDU_GET_REQUEST: u8 = 0xA0;
pub const PDU_GET_RESPONSE: u8 = 0xA2;

const DEFAULT_PORT: u16 = 161;
const MAX_HOSTS: usize = 65_536;

/// MIB-II system group, `(name, oid)`
pub const SYSTEM_OIDS: &[(&str, &str)] = &[
    ("sysDescr", "1.3.6.1.2.1.1.1.0"),
    ("sysObjectID", "1.3.6.1.2.1.1.2.0"),
    ("sysUpTime", "1.3.6.1.2.1.1.3.0"),
    ("sysContact", "1.3.6.1.2.1.1.4.0"),
    ("sysName", "1.3.6.1.2.1.1.5.0"),
    ("sysLocation", "1.3.6.1.2.1.1.6.0"),
    ("sysServices", "1.3.6.1.2.1.1.7.0"),
];

/// Enterprise prefixes of sysObjectID
const VENDOR_TYPES: &[(&str, DeviceType)] = &[
    ("1.3.6.1.4.1.14179", DeviceType::AccessPoint),
    ("1.3.6.1.4.1.41112", DeviceType::AccessPoint),
    ("1.3.6.1.4.1.2636", DeviceType::Router),
    ("1.3.6.1.4.1.14988", DeviceType::Router),
    ("1.3.6.1.4.1.1991", DeviceType::Switch),
    ("1.3.6.1.4.1.43", DeviceType::Switch),
    ("1.3.6.1.4.1.11", DeviceType::Switch),
    ("1.3.6.1.4.1.9", DeviceType::Router),
];

const MANUFACTURERS: &[(&str, &str)] = &[
    ("cisco", "Cisco"),
    ("juniper", "Juniper"),
    ("netgear", "Netgear"),
    ("linksys", "Linksys"),
    ("d-link", "D-Link"),
    ("dlink", "D-Link"),
    ("tp-link", "TP-Link"),
    ("tplink", "TP-Link"),
    ("ubiquiti", "Ubiquiti"),
    ("mikrotik", "MikroTik"),
    ("routeros", "MikroTik"),
    ("dell", "Dell"),
    ("hp ", "HP"),
    ("procurve", "HP"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnmpVersion {
    #[serde(rename = "1")]
    V1,
    #[serde(rename = "2c")]
    V2c,
}

impl SnmpVersion {
    fn wire(self) -> i64 {
        match self {
            SnmpVersion::V1 => 0,
            SnmpVersion::V2c => 1,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "1" | "v1" => Ok(SnmpVersion::V1),
            "2" | "2c" | "v2c" => Ok(SnmpVersion::V2c),
            other => Err(EngineError::invalid_input(format!("unsupported SNMP version '{other}'"))),
        }
    }
}

/// A decoded varbind value
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectId(Vec<u32>),
    IpAddress(Ipv4Addr),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
    Other(u8, Vec<u8>),
}

impl SnmpValue {
    /// Printable rendition; binary octet strings come out as colon hex
    pub fn to_display(&self) -> Option<String> {
        match self {
            SnmpValue::Integer(v) => Some(v.to_string()),
            SnmpValue::OctetString(bytes) => {
                let printable = bytes
                    .iter()
                    .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace());
                if printable {
                    Some(String::from_utf8_lossy(bytes).trim().to_string())
                } else {
                    Some(bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":"))
                }
            }
            SnmpValue::ObjectId(oid) => Some(format_oid(oid)),
            SnmpValue::IpAddress(ip) => Some(ip.to_string()),
            SnmpValue::Counter32(v) | SnmpValue::Gauge32(v) | SnmpValue::TimeTicks(v) => Some(v.to_string()),
            SnmpValue::Counter64(v) => Some(v.to_string()),
            _ => None,
        }
    }
}

/// A v1/v2c message
#[derive(Debug, Clone, PartialEq)]
pub struct SnmpMessage {
    pub version: SnmpVersion,
    pub community: String,
    pub pdu_type: u8,
    pub request_id: i32,
    pub error_status: i64,
    pub error_index: i64,
    pub varbinds: Vec<(Vec<u32>, SnmpValue)>,
}

fn malformed(what: &str) -> EngineError {
    EngineError::protocol(format!("malformed SNMP message: {what}"))
}

pub fn parse_oid(text: &str) -> Result<Vec<u32>> {
    let oid = text
        .trim_start_matches('.')
        .split('.')
        .map(|part| part.parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| EngineError::invalid_input(format!("invalid OID '{text}'")))?;
    if oid.len() < 2 || oid[0] > 2 {
        return Err(EngineError::invalid_input(format!("invalid OID '{text}'")));
    }
    Ok(oid)
}

pub fn format_oid(oid: &[u32]) -> String {
    oid.iter().map(u32::to_string).collect::<Vec<_>>().join(".")
}

fn push_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        buf.push(0x80 | (bytes.len() - skip) as u8);
        buf.extend_from_slice(&bytes[skip..]);
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(content.len() + 4);
    buf.push(tag);
    push_length(&mut buf, content.len());
    buf.extend_from_slice(content);
    buf
}

fn integer_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn unsigned_bytes(value: u64) -> Vec<u8> {
    let mut bytes = value.to_be_bytes().to_vec();
    while bytes.len() > 1 && bytes[0] == 0 && bytes[1] & 0x80 == 0 {
        bytes.remove(0);
    }
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    bytes
}

fn oid_bytes(oid: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(oid.len() + 2);
    let (first, second) = (oid.first().copied().unwrap_or(0), oid.get(1).copied().unwrap_or(0));
    let mut components = vec![first * 40 + second];
    components.extend(oid.iter().skip(2));
    for component in components {
        let mut chunk = vec![(component & 0x7F) as u8];
        let mut rest = component >> 7;
        while rest > 0 {
            chunk.push(0x80 | (rest & 0x7F) as u8);
            rest >>= 7;
        }
        chunk.reverse();
        buf.extend(chunk);
    }
    buf
}

fn encode_value(value: &SnmpValue) -> Vec<u8> {
    match value {
        SnmpValue::Integer(v) => tlv(TAG_INTEGER, &integer_bytes(*v)),
        SnmpValue::OctetString(bytes) => tlv(TAG_OCTET_STRING, bytes),
        SnmpValue::Null => tlv(TAG_NULL, &[]),
        SnmpValue::ObjectId(oid) => tlv(TAG_OID, &oid_bytes(oid)),
        SnmpValue::IpAddress(ip) => tlv(TAG_IP_ADDRESS, &ip.octets()),
        SnmpValue::Counter32(v) => tlv(TAG_COUNTER32, &unsigned_bytes(u64::from(*v))),
        SnmpValue::Gauge32(v) => tlv(TAG_GAUGE32, &unsigned_bytes(u64::from(*v))),
        SnmpValue::TimeTicks(v) => tlv(TAG_TIMETICKS, &unsigned_bytes(u64::from(*v))),
        SnmpValue::Counter64(v) => tlv(TAG_COUNTER64, &unsigned_bytes(*v)),
        SnmpValue::NoSuchObject => tlv(TAG_NO_SUCH_OBJECT, &[]),
        SnmpValue::NoSuchInstance => tlv(TAG_NO_SUCH_INSTANCE, &[]),
        SnmpValue::EndOfMibView => tlv(TAG_END_OF_MIB_VIEW, &[]),
        SnmpValue::Other(tag, bytes) => tlv(*tag, bytes),
    }
}

/// Encode a complete message
pub fn encode_message(message: &SnmpMessage) -> Vec<u8> {
    let varbinds: Vec<u8> = message
        .varbinds
        .iter()
        .flat_map(|(oid, value)| {
            let mut pair = tlv(TAG_OID, &oid_bytes(oid));
            pair.extend(encode_value(value));
            tlv(TAG_SEQUENCE, &pair)
        })
        .collect();

    let mut pdu = tlv(TAG_INTEGER, &integer_bytes(i64::from(message.request_id)));
    pdu.extend(tlv(TAG_INTEGER, &integer_bytes(message.error_status)));
    pdu.extend(tlv(TAG_INTEGER, &integer_bytes(message.error_index)));
    pdu.extend(tlv(TAG_SEQUENCE, &varbinds));

    let mut body = tlv(TAG_INTEGER, &integer_bytes(message.version.wire()));
    body.extend(tlv(TAG_OCTET_STRING, message.community.as_bytes()));
    body.extend(tlv(message.pdu_type, &pdu));
    tlv(TAG_SEQUENCE, &body)
}

/// GetRequest for `oids`
pub fn build_get_request(version: SnmpVersion, community: &str, request_id: i32, oids: &[Vec<u32>]) -> Vec<u8> {
    encode_message(&SnmpMessage {
        version,
        community: community.to_string(),
        pdu_type: PDU_GET_REQUEST,
        request_id,
        error_status: 0,
        error_index: 0,
        varbinds: oids.iter().map(|oid| (oid.clone(), SnmpValue::Null)).collect(),
    })
}

struct Ber<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Ber<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or_else(|| malformed("unexpected end"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn next(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.byte()?;
        let first = self.byte()?;
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 || count > 4 {
                return Err(malformed("unsupported length form"));
            }
            let mut len = 0usize;
            for _ in 0..count {
                len = (len << 8) | self.byte()? as usize;
            }
            len
        };
        let content = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| malformed("value runs past end"))?;
        self.pos += len;
        Ok((tag, content))
    }

    fn expect(&mut self, tag: u8) -> Result<&'a [u8]> {
        let (found, content) = self.next()?;
        if found != tag {
            return Err(malformed(&format!("expected tag {tag:#04x}, found {found:#04x}")));
        }
        Ok(content)
    }

    fn integer(&mut self) -> Result<i64> {
        decode_integer(self.expect(TAG_INTEGER)?)
    }
}

fn decode_integer(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(malformed("bad integer length"));
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut value: i64 = if negative { -1 } else { 0 };
    for byte in bytes {
        value = (value << 8) | i64::from(*byte);
    }
    Ok(value)
}

fn decode_unsigned(bytes: &[u8]) -> Result<u64> {
    let bytes = match bytes {
        [0, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(malformed("bad unsigned length"));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_oid(bytes: &[u8]) -> Result<Vec<u32>> {
    let (&first, rest) = bytes.split_first().ok_or_else(|| malformed("empty OID"))?;
    let mut oid = if first >= 80 {
        vec![2, u32::from(first) - 80]
    } else {
        vec![u32::from(first) / 40, u32::from(first) % 40]
    };
    let mut component: u32 = 0;
    for byte in rest {
        component = component
            .checked_shl(7)
            .filter(|_| component < (1 << 25))
            .ok_or_else(|| malformed("OID component overflow"))?
            | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            oid.push(component);
            component = 0;
        }
    }
    Ok(oid)
}

fn decode_value(tag: u8, content: &[u8]) -> Result<SnmpValue> {
    let narrow = |v: u64| u32::try_from(v).map_err(|_| malformed("32-bit value out of range"));
    Ok(match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_integer(content)?),
        TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
        TAG_NULL => SnmpValue::Null,
        TAG_OID => SnmpValue::ObjectId(decode_oid(content)?),
        TAG_IP_ADDRESS if content.len() == 4 => {
            SnmpValue::IpAddress(Ipv4Addr::new(content[0], content[1], content[2], content[3]))
        }
        TAG_COUNTER32 => SnmpValue::Counter32(narrow(decode_unsigned(content)?)?),
        TAG_GAUGE32 => SnmpValue::Gauge32(narrow(decode_unsigned(content)?)?),
        TAG_TIMETICKS => SnmpValue::TimeTicks(narrow(decode_unsigned(content)?)?),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned(content)?),
        TAG_NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
        other => SnmpValue::Other(other, content.to_vec()),
    })
}

/// Decode a v1/v2c message of any PDU type
pub fn parse_message(data: &[u8]) -> Result<SnmpMessage> {
    let mut outer = Ber::new(data);
    let mut message = Ber::new(outer.expect(TAG_SEQUENCE)?);

    let version = match message.integer()? {
        0 => SnmpVersion::V1,
        1 => SnmpVersion::V2c,
        other => return Err(malformed(&format!("unsupported version {other}"))),
    };
    let community = String::from_utf8_lossy(message.expect(TAG_OCTET_STRING)?).into_owned();
    let (pdu_type, pdu) = message.next()?;
    if pdu_type & 0xE0 != 0xA0 {
        return Err(malformed("not a PDU"));
    }

    let mut pdu = Ber::new(pdu);
    let request_id = i32::try_from(pdu.integer()?).map_err(|_| malformed("request id out of range"))?;
    let error_status = pdu.integer()?;
    let error_index = pdu.integer()?;

    let mut list = Ber::new(pdu.expect(TAG_SEQUENCE)?);
    let mut varbinds = Vec::new();
    while !list.is_empty() {
        let mut pair = Ber::new(list.expect(TAG_SEQUENCE)?);
        let oid = decode_oid(pair.expect(TAG_OID)?)?;
        let (tag, content) = pair.next()?;
        varbinds.push((oid, decode_value(tag, content)?));
    }

    Ok(SnmpMessage {
        version,
        community,
        pdu_type,
        request_id,
        error_status,
        error_index,
        varbinds,
    })
}

/// MIB-II system group values of one agent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemInfo {
    pub descr: Option<String>,
    pub object_id: Option<String>,
    pub uptime_ticks: Option<u32>,
    pub contact: Option<String>,
    pub name: Option<String>,
    pub location: Option<String>,
    pub services: Option<i64>,
}

impl SystemInfo {
    pub fn from_varbinds(varbinds: &[(Vec<u32>, SnmpValue)]) -> Self {
        let mut info = SystemInfo::default();
        for (oid, value) in varbinds {
            let Some((name, _)) = SYSTEM_OIDS.iter().find(|(_, o)| *o == format_oid(oid)) else {
                continue;
            };
            let text = value.to_display().filter(|v| !v.is_empty());
            match *name {
                "sysDescr" => info.descr = text,
                "sysObjectID" => info.object_id = text,
                "sysUpTime" => {
                    if let SnmpValue::TimeTicks(ticks) = value {
                        info.uptime_ticks = Some(*ticks);
                    }
                }
                "sysContact" => info.contact = text,
                "sysName" => info.name = text,
                "sysLocation" => info.location = text,
                "sysServices" => {
                    if let SnmpValue::Integer(v) = value {
                        info.services = Some(*v);
                    }
                }
                _ => {}
            }
        }
        info
    }

    pub fn is_empty(&self) -> bool {
        self.descr.is_none() && self.object_id.is_none() && self.name.is_none()
    }
}

/// Device type from the enterprise prefix of sysObjectID
pub fn classify_object_id(object_id: &str) -> DeviceType {
    VENDOR_TYPES
        .iter()
        .find(|(prefix, _)| object_id == *prefix || object_id.starts_with(&format!("{prefix}.")))
        .map(|(_, device_type)| *device_type)
        .unwrap_or(DeviceType::Unknown)
}

/// Manufacturer and a model guess from sysDescr
pub fn parse_system_description(descr: &str) -> (Option<String>, Option<String>) {
    let lower = format!("{} ", descr.to_lowercase());
    let Some((needle, manufacturer)) = MANUFACTURERS.iter().find(|(needle, _)| lower.contains(needle)) else {
        return (None, None);
    };
    let needle = needle.trim();
    let words: Vec<&str> = descr.split_whitespace().collect();
    let model = words
        .iter()
        .position(|w| w.to_lowercase().contains(needle))
        .and_then(|i| words.get(i + 1))
        .map(|w| w.trim_matches(|c: char| c == ',' || c == ';'))
        .filter(|w| w.len() > 2 && !w.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_uppercase);
    (Some(manufacturer.to_string()), model)
}

pub fn device_from_system(ip: IpAddr, info: &SystemInfo) -> Device {
    let mut device = Device::new(ip, "snmp");
    device.name = info.name.clone();
    device.hostname = info.name.clone();
    if let Some(descr) = &info.descr {
        let (manufacturer, model) = parse_system_description(descr);
        device.manufacturer = manufacturer;
        device.model = model;
        device.metadata.insert("system_description".into(), descr.clone());
    }
    if let Some(object_id) = &info.object_id {
        device.device_type = classify_object_id(object_id);
        device.metadata.insert("system_object_id".into(), object_id.clone());
    }
    if let Some(contact) = &info.contact {
        device.metadata.insert("contact".into(), contact.clone());
    }
    if let Some(location) = &info.location {
        device.metadata.insert("location".into(), location.clone());
    }
    if let Some(ticks) = info.uptime_ticks {
        device.metadata.insert("uptime_seconds".into(), (ticks / 100).to_string());
    }
    if let Some(services) = info.services {
        device.capabilities.insert("sys_services".into(), services.to_string());
    }
    device
}

/// Per-run query settings
#[derive(Debug, Clone)]
pub struct SnmpQuery {
    pub version: SnmpVersion,
    pub community: String,
    pub port: u16,
    pub timeout: Duration,
}

/// Ask one agent for the system group; `None` when it does not answer
pub async fn query_system(ip: IpAddr, query: &SnmpQuery, request_id: i32) -> Result<Option<SystemInfo>> {
    let oids = SYSTEM_OIDS
        .iter()
        .map(|(_, oid)| parse_oid(oid))
        .collect::<Result<Vec<_>>>()?;
    let bind: SocketAddr = if ip.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    let request = build_get_request(query.version, &query.community, request_id, &oids);
    socket.send_to(&request, (ip, query.port)).await?;

    let deadline = tokio::time::Instant::now() + query.timeout;
    let mut buffer = vec![0u8; 65_535];
    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
            Ok(received) => received?,
            Err(_) => return Ok(None),
        };
        if from.ip() != ip {
            continue;
        }
        let response = match parse_message(&buffer[..len]) {
            Ok(response) => response,
            Err(e) => {
                debug!(host = %ip, error = %e, "Skipping malformed SNMP response");
                continue;
            }
        };
        if response.pdu_type != PDU_GET_RESPONSE || response.request_id != request_id {
            continue;
        }
        if response.error_status != 0 {
            debug!(host = %ip, error_status = response.error_status, "SNMP agent returned an error");
            return Ok(None);
        }
        let info = SystemInfo::from_varbinds(&response.varbinds);
        return Ok((!info.is_empty()).then_some(info));
    }
}

enum HostPoll {
    Answered(Device),
    Silent,
    Skipped,
}

/// Polls the system group of every host in the configured ranges
pub struct SnmpPlugin {
    network: NetworkConfig,
    limiter: Arc<AdaptiveRateLimiter>,
    request_ids: AtomicI32,
}

impl SnmpPlugin {
    pub fn new(network: NetworkConfig, rate_limit: RateLimitConfig) -> Self {
        Self {
            network,
            limiter: Arc::new(AdaptiveRateLimiter::new(rate_limit)),
            request_ids: AtomicI32::new(rand::random::<u16>() as i32),
        }
    }

    pub fn rate_limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn plugin_metadata() -> PluginMetadata {
        PluginMetadata::new("snmp", PLUGIN_VERSION)
            .with_description("SNMP v1/v2c system group polling")
            .with_protocol("snmp")
            .with_tag("unicast")
    }

    fn next_request_id(&self) -> i32 {
        self.request_ids.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF
    }

    fn query_from(&self, params: &DiscoveryParams) -> Result<SnmpQuery> {
        Ok(SnmpQuery {
            version: SnmpVersion::parse(params.get_str("version").unwrap_or("2c"))?,
            community: params.get_str("community").unwrap_or("public").to_string(),
            port: params
                .get_u64("port")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(DEFAULT_PORT),
            timeout: params
                .get_u64("host_timeout_ms")
                .map(Duration::from_millis)
                .unwrap_or(self.network.connect_timeout),
        })
    }
}

#[async_trait]
impl DiscoveryPlugin for SnmpPlugin {
    fn metadata(&self) -> PluginMetadata {
        Self::plugin_metadata()
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<()> {
        if let Some(version) = config.settings.get("version").and_then(|v| v.as_str()) {
            SnmpVersion::parse(version)?;
        }
        Ok(())
    }

    async fn discover(&self, params: &DiscoveryParams) -> Result<DiscoveryResult> {
        let started = Instant::now();
        let query = Arc::new(self.query_from(params)?);
        let ranges = params
            .get_str_list("ip_ranges")
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.network.ip_ranges.clone());
        let hosts = expand_ranges(&ranges, MAX_HOSTS)?;
        if hosts.is_empty() {
            return Ok(DiscoveryResult::failure("snmp", "no valid IP addresses to scan", started.elapsed()));
        }

        let concurrency = params
            .get_u64("max_concurrent")
            .map(|n| n as usize)
            .unwrap_or(self.network.max_concurrent_connections)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        info!(hosts = hosts.len(), version = ?query.version, concurrency, "Starting SNMP sweep");

        let wait = self.limiter.acquire_timeout();
        let probes = hosts.iter().map(|&ip| {
            let semaphore = semaphore.clone();
            let query = query.clone();
            let limiter = self.limiter.clone();
            let request_id = self.next_request_id();
            async move {
                let host = ip.to_string();
                if let Err(e) = limiter.acquire(&host, Some(wait)).await {
                    debug!(host = %ip, error = %e, "SNMP query skipped");
                    return HostPoll::Skipped;
                }
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return HostPoll::Skipped;
                };
                let sent = Instant::now();
                match query_system(ip, &query, request_id).await {
                    Ok(Some(info)) => {
                        limiter.record_success(&host, sent.elapsed()).await;
                        HostPoll::Answered(device_from_system(ip, &info))
                    }
                    Ok(None) => {
                        limiter.record_failure(&host, "timeout").await;
                        HostPoll::Silent
                    }
                    Err(e) => {
                        limiter.record_failure(&host, "query_failed").await;
                        debug!(host = %ip, error = %e, "SNMP query failed");
                        HostPoll::Silent
                    }
                }
            }
        });
        let polls = join_all(probes).await;
        let skipped = polls.iter().filter(|poll| matches!(poll, HostPoll::Skipped)).count();
        let devices: Vec<Device> = polls
            .into_iter()
            .filter_map(|poll| match poll {
                HostPoll::Answered(device) => Some(device),
                _ => None,
            })
            .collect();
        if skipped > 0 {
            warn!(skipped, "Rate limit left SNMP queries unsent");
        }

        info!(hosts = hosts.len(), devices = devices.len(), "SNMP sweep finished");
        Ok(DiscoveryResult::success("snmp", devices, started.elapsed())
            .with_metadata("hosts_scanned", hosts.len())
            .with_metadata("hosts_skipped", skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(text: &str) -> Vec<u32> {
        parse_oid(text).unwrap()
    }

    fn agent_response(request: &SnmpMessage) -> SnmpMessage {
        SnmpMessage {
            pdu_type: PDU_GET_RESPONSE,
            varbinds: vec![
                (oid("1.3.6.1.2.1.1.1.0"), SnmpValue::OctetString(b"Cisco IOS C2960X, Version 15.2".to_vec())),
                (oid("1.3.6.1.2.1.1.2.0"), SnmpValue::ObjectId(oid("1.3.6.1.4.1.9.1.1208"))),
                (oid("1.3.6.1.2.1.1.3.0"), SnmpValue::TimeTicks(360_000)),
                (oid("1.3.6.1.2.1.1.5.0"), SnmpValue::OctetString(b"core-sw1".to_vec())),
                (oid("1.3.6.1.2.1.1.6.0"), SnmpValue::NoSuchInstance),
                (oid("1.3.6.1.2.1.1.7.0"), SnmpValue::Integer(6)),
            ],
            ..request.clone()
        }
    }

    #[test]
    fn test_get_request_bytes() {
        let request = build_get_request(SnmpVersion::V2c, "public", 1, &[oid("1.3.6.1.2.1.1.1.0")]);
        let expected: Vec<u8> = vec![
            0x30, 0x26, 0x02, 0x01, 0x01, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xA0, 0x19, 0x02,
            0x01, 0x01, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0E, 0x30, 0x0C, 0x06, 0x08, 0x2B, 0x06,
            0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05, 0x00,
        ];
        assert_eq!(request, expected);
    }

    #[test]
    fn test_integer_and_oid_edges() {
        assert_eq!(integer_bytes(0), vec![0x00]);
        assert_eq!(integer_bytes(128), vec![0x00, 0x80]);
        assert_eq!(integer_bytes(-1), vec![0xFF]);
        assert_eq!(decode_integer(&[0xFF, 0x7F]).unwrap(), -129);
        assert_eq!(oid_bytes(&oid("1.3.6.1.4.1.14179")), vec![0x2B, 0x06, 0x01, 0x04, 0x01, 0xEE, 0x63]);
        assert_eq!(decode_oid(&[0x2B, 0x06, 0x01, 0x04, 0x01, 0xEE, 0x63]).unwrap(), oid("1.3.6.1.4.1.14179"));
        assert!(parse_oid("1.x.3").is_err());
    }

    #[test]
    fn test_response_decoding_into_device() {
        let request = parse_message(&build_get_request(SnmpVersion::V1, "private", 42, &[])).unwrap();
        assert_eq!(request.pdu_type, PDU_GET_REQUEST);
        assert_eq!(request.community, "private");

        let bytes = encode_message(&agent_response(&request));
        let response = parse_message(&bytes).unwrap();
        assert_eq!(response.request_id, 42);
        assert_eq!(response.varbinds.len(), 6);

        let info = SystemInfo::from_varbinds(&response.varbinds);
        assert_eq!(info.name.as_deref(), Some("core-sw1"));
        assert_eq!(info.object_id.as_deref(), Some("1.3.6.1.4.1.9.1.1208"));
        assert_eq!(info.location, None);

        let device = device_from_system("10.0.0.2".parse().unwrap(), &info);
        assert_eq!(device.device_type, DeviceType::Router);
        assert_eq!(device.manufacturer.as_deref(), Some("Cisco"));
        assert_eq!(device.model.as_deref(), Some("IOS"));
        assert_eq!(device.metadata.get("uptime_seconds").map(String::as_str), Some("3600"));
    }

    #[test]
    fn test_truncated_messages_are_errors() {
        let bytes = build_get_request(SnmpVersion::V2c, "public", 7, &[oid("1.3.6.1.2.1.1.5.0")]);
        for cut in [0, 1, 2, 10, bytes.len() - 1] {
            assert!(parse_message(&bytes[..cut]).is_err(), "cut at {cut}");
        }
        assert!(matches!(parse_message(&[0x04, 0x00]), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_vendor_classification() {
        assert_eq!(classify_object_id("1.3.6.1.4.1.14179.1.1"), DeviceType::AccessPoint);
        assert_eq!(classify_object_id("1.3.6.1.4.1.11.2.3"), DeviceType::Switch);
        assert_eq!(classify_object_id("1.3.6.1.4.1.119.1"), DeviceType::Unknown);
        assert_eq!(parse_system_description("Linux raspberrypi 6.1"), (None, None));
    }

    #[tokio::test]
    async fn test_discover_against_local_agent() {
        let agent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = agent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 2048];
            while let Ok((len, from)) = agent.recv_from(&mut buffer).await {
                if let Ok(request) = parse_message(&buffer[..len]) {
                    let reply = encode_message(&agent_response(&request));
                    let _ = agent.send_to(&reply, from).await;
                }
            }
        });

        let plugin = SnmpPlugin::new(NetworkConfig::default(), RateLimitConfig::default());
        let params = DiscoveryParams::new()
            .insert("ip_ranges", vec!["127.0.0.1/32"])
            .insert("port", port)
            .insert("host_timeout_ms", 1000);
        let result = plugin.discover(&params).await.unwrap();

        assert!(result.success);
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].name.as_deref(), Some("core-sw1"));
        assert_eq!(result.devices[0].protocols.iter().next().map(String::as_str), Some("snmp"));
    }

    #[tokio::test]
    async fn test_silent_hosts_yield_no_devices() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let plugin = SnmpPlugin::new(NetworkConfig::default(), RateLimitConfig::default());
        let params = DiscoveryParams::new()
            .insert("ip_ranges", "127.0.0.1/32")
            .insert("port", port)
            .insert("host_timeout_ms", 100);
        let result = plugin.discover(&params).await.unwrap();
        assert!(result.success);
        assert!(result.devices.is_empty());
        drop(silent);
    }

    #[tokio::test]
    async fn test_global_rate_limit_bounds_queries_per_sweep() {
        let agent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = agent.local_addr().unwrap().port();
        let received = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = received.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 2048];
            while agent.recv_from(&mut buffer).await.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let limits = RateLimitConfig {
            global_limit: 1.0,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let plugin = SnmpPlugin::new(NetworkConfig::default(), limits);
        let params = DiscoveryParams::new()
            .insert("ip_ranges", "127.0.0.1/32")
            .insert("port", port)
            .insert("host_timeout_ms", 50);

        for _ in 0..4 {
            plugin.discover(&params).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(received.load(Ordering::SeqCst), 2);
        let stats = plugin.rate_limiter().get_statistics().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.success_rate, 0.0);
    }
}
