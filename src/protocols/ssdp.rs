//! SSDP / UPnP discovery
//!
//! M-SEARCH requests go to the SSDP multicast group; every unique LOCATION
//! in the answers is fetched over HTTP and its device description merged
//! into the device record.

use super::{collect_datagrams, listen_window, multicast_socket, PLUGIN_VERSION};
use crate::device::{Device, DeviceType, DiscoveryParams, DiscoveryResult};
use crate::error::{EngineError, Result};
use crate::plugins::{DiscoveryPlugin, PluginConfig, PluginMetadata};
use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::{Host, Url};

pub const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

const DEFAULT_MX: u64 = 3;
const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_DESCRIPTION_BYTES: usize = 256 * 1024;

pub const DEFAULT_SEARCH_TARGETS: &[&str] = &["upnp:rootdevice", "ssdp:all"];

static XML_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:[\w-]+:)?(\w+)>\s*([^<]*?)\s*</").expect("element pattern is valid")
});

/// `M-SEARCH` request for one search target
pub fn build_msearch(search_target: &str, mx: u64) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_GROUP}:{SSDP_PORT}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         ST: {search_target}\r\n\
         MX: {mx}\r\n\
         \r\n"
    )
}

/// A search response; header names are stored upper-cased
#[derive(Debug, Clone, PartialEq)]
pub struct SsdpResponse {
    pub headers: HashMap<String, String>,
}

impl SsdpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("LOCATION")
    }
}

/// Parse a search response; anything but `HTTP/1.1 200` is ignored
pub fn parse_response(text: &str) -> Option<SsdpResponse> {
    let mut lines = text.lines();
    let status = lines.next()?.trim();
    if !status.starts_with("HTTP/1.1 200") {
        return None;
    }
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_uppercase(), value.trim().to_string()))
        .collect();
    Some(SsdpResponse { headers })
}

/// Fields of a UPnP device description document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpnpDescription {
    pub device_type: Option<String>,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_url: Option<String>,
    pub model_name: Option<String>,
    pub model_number: Option<String>,
    pub model_description: Option<String>,
    pub serial_number: Option<String>,
    pub udn: Option<String>,
    pub presentation_url: Option<String>,
    pub service_types: Vec<String>,
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Extract the root device's fields; `None` if the document has no device
pub fn parse_description(xml: &str) -> Option<UpnpDescription> {
    let device_start = xml.find("<device>").or_else(|| xml.find(":device>"))?;
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut service_types = Vec::new();

    for capture in XML_ELEMENT.captures_iter(&xml[device_start..]) {
        let (name, value) = (&capture[1], unescape(&capture[2]));
        if value.is_empty() {
            continue;
        }
        if name == "serviceType" {
            if !service_types.contains(&value) {
                service_types.push(value);
            }
        } else {
            fields.entry(name.to_string()).or_insert(value);
        }
    }

    let mut take = |name: &str| fields.remove(name);
    Some(UpnpDescription {
        device_type: take("deviceType"),
        friendly_name: take("friendlyName"),
        manufacturer: take("manufacturer"),
        manufacturer_url: take("manufacturerURL"),
        model_name: take("modelName"),
        model_number: take("modelNumber"),
        model_description: take("modelDescription"),
        serial_number: take("serialNumber"),
        udn: take("UDN"),
        presentation_url: take("presentationURL"),
        service_types,
    })
}

/// Device type from the UPnP device type, service types and SERVER header
pub fn classify(device_type: &str, services: &[String], server: &str) -> DeviceType {
    let device_type = device_type.to_lowercase();
    let services = services.join(" ").to_lowercase();
    let server = server.to_lowercase();
    let any = |haystack: &str, needles: &[&str]| needles.iter().any(|n| haystack.contains(n));

    if any(&device_type, &["mediaserver", "mediarenderer"]) || any(&services, &["mediaserver", "mediarenderer"]) {
        DeviceType::MediaServer
    } else if any(&device_type, &["internetgatewaydevice", "wandevice"]) {
        DeviceType::Router
    } else if device_type.contains("printer") || services.contains("print") {
        DeviceType::Printer
    } else if device_type.contains("camera") || services.contains("camera") || server.contains("camera") {
        DeviceType::Camera
    } else if any(&device_type, &["accesspoint", "wireless", "wlan"]) {
        DeviceType::AccessPoint
    } else if any(&device_type, &["light", "thermostat", "binarylight", "dimmablelight", "hvac"]) {
        DeviceType::SmartHome
    } else if any(&device_type, &["sensor"]) {
        DeviceType::IotSensor
    } else if device_type.contains("switch") {
        DeviceType::Switch
    } else {
        DeviceType::Unknown
    }
}

/// Build a device from a response and, when fetched, its description
pub fn device_from_response(
    response: &SsdpResponse,
    source: IpAddr,
    description: Option<&UpnpDescription>,
) -> Device {
    let mut device = Device::new(source, "ssdp");
    let server = response.header("SERVER").unwrap_or_default();

    if let Some(location) = response.location() {
        device.metadata.insert("location".into(), location.to_string());
        if let Ok(url) = Url::parse(location) {
            if let Some(port) = url.port_or_known_default() {
                device.ports.insert(port);
            }
            if let Some(Host::Domain(host)) = url.host() {
                device.hostname = Some(host.to_string());
            }
        }
    }
    for (header, key) in [("SERVER", "server"), ("USN", "usn"), ("ST", "st"), ("CACHE-CONTROL", "cache_control")] {
        if let Some(value) = response.header(header) {
            device.metadata.insert(key.into(), value.to_string());
        }
    }

    let Some(description) = description else {
        device.device_type = classify("", &[], server);
        return device;
    };

    device.name = description.friendly_name.clone();
    device.manufacturer = description.manufacturer.clone();
    device.model = description.model_name.clone();
    device.firmware_version = description.model_number.clone();
    device.serial = description.serial_number.clone().or_else(|| {
        description
            .udn
            .as_deref()
            .map(|udn| udn.trim_start_matches("uuid:").to_string())
            .filter(|udn| !udn.is_empty())
    });
    device.services = description.service_types.iter().cloned().collect();
    device.device_type = classify(
        description.device_type.as_deref().unwrap_or_default(),
        &description.service_types,
        server,
    );

    let capabilities: BTreeMap<String, String> = [
        ("upnp_device_type", &description.device_type),
        ("model_description", &description.model_description),
        ("udn", &description.udn),
        ("presentation_url", &description.presentation_url),
        ("manufacturer_url", &description.manufacturer_url),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.clone().map(|v| (key.to_string(), v)))
    .collect();
    device.capabilities.extend(capabilities);
    device
}

/// SSDP search plus UPnP description fetch
pub struct SsdpPlugin {
    client: reqwest::Client,
    config: RwLock<Option<PluginConfig>>,
}

impl SsdpPlugin {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DESCRIPTION_TIMEOUT)
            .user_agent(concat!("edge-discovery/", env!("CARGO_PKG_VERSION"), " UPnP/1.1"))
            .build()?;
        Ok(Self {
            client,
            config: RwLock::new(None),
        })
    }

    pub fn plugin_metadata() -> PluginMetadata {
        PluginMetadata::new("ssdp", PLUGIN_VERSION)
            .with_description("SSDP search with UPnP device descriptions")
            .with_protocol("ssdp")
            .with_protocol("upnp")
            .with_tag("multicast")
    }

    /// Fetch and parse a device description; failures only log
    pub async fn fetch_description(&self, location: &str) -> Option<UpnpDescription> {
        let response = match self.client.get(location).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(location, status = %response.status(), "Description request rejected");
                return None;
            }
            Err(e) => {
                debug!(location, error = %e, "Description request failed");
                return None;
            }
        };
        let body = match response.text().await {
            Ok(body) if body.len() <= MAX_DESCRIPTION_BYTES => body,
            Ok(body) => {
                debug!(location, bytes = body.len(), "Description too large");
                return None;
            }
            Err(e) => {
                debug!(location, error = %e, "Description body unreadable");
                return None;
            }
        };
        let description = parse_description(&body);
        if description.is_none() {
            debug!(location, "Description has no device element");
        }
        description
    }
}

#[async_trait]
impl DiscoveryPlugin for SsdpPlugin {
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
        let targets = params
            .get_str_list("search_targets")
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_SEARCH_TARGETS.iter().map(|s| s.to_string()).collect());
        let mx = params.get_u64("mx").unwrap_or(DEFAULT_MX).clamp(1, 5);
        let fetch = params
            .get("fetch_descriptions")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let window = listen_window(params, Duration::from_secs(mx + 1), config.as_ref());

        let socket = multicast_socket(4)?;
        for target in &targets {
            socket
                .send_to(build_msearch(target, mx).as_bytes(), (SSDP_GROUP, SSDP_PORT))
                .await
                .map_err(|e| EngineError::network(format!("M-SEARCH failed: {e}")))?;
        }

        let datagrams = collect_datagrams(&socket, window).await;
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for (data, from) in &datagrams {
            let Some(response) = parse_response(&String::from_utf8_lossy(data)) else {
                debug!(source = %from, "Ignoring non-200 SSDP datagram");
                continue;
            };
            let key = response
                .location()
                .or_else(|| response.header("USN"))
                .map(str::to_string)
                .unwrap_or_else(|| from.ip().to_string());
            if seen.insert(key) {
                unique.push((response, from.ip()));
            }
        }

        let descriptions = join_all(unique.iter().map(|(response, _)| async move {
            match (fetch, response.location()) {
                (true, Some(location)) => self.fetch_description(location).await,
                _ => None,
            }
        }))
        .await;

        let mut devices: BTreeMap<String, Device> = BTreeMap::new();
        for ((response, source), description) in unique.iter().zip(descriptions.iter()) {
            let device = device_from_response(response, *source, description.as_ref());
            match devices.get_mut(&device.identity_key()) {
                Some(existing) => {
                    existing.merge_from(&device);
                }
                None => {
                    devices.insert(device.identity_key(), device);
                }
            }
        }

        info!(
            targets = targets.len(),
            responses = datagrams.len(),
            devices = devices.len(),
            "SSDP discovery finished"
        );
        Ok(
            DiscoveryResult::success("ssdp", devices.into_values().collect(), started.elapsed())
                .with_metadata("responses", datagrams.len())
                .with_metadata("search_targets", targets),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Kitchen Speaker</friendlyName>
    <manufacturer>Sono &amp; Co</manufacturer>
    <modelName>Play:1</modelName>
    <modelNumber>S1</modelNumber>
    <UDN>uuid:RINCON_000E58A0</UDN>
    <serviceList>
      <service><serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType></service>
      <service><serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType></service>
    </serviceList>
  </device>
</root>"#;

    fn response(location: &str) -> SsdpResponse {
        let text = format!(
            "HTTP/1.1 200 OK\r\nCache-Control: max-age=1800\r\nlocation: {location}\r\n\
             Server: Linux/4.4 UPnP/1.0 Sonos/70.3\r\nST: upnp:rootdevice\r\n\
             USN: uuid:RINCON_000E58A0::upnp:rootdevice\r\n\r\n"
        );
        parse_response(&text).unwrap()
    }

    #[test]
    fn test_msearch_format() {
        let request = build_msearch("ssdp:all", 2);
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(request.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(request.contains("MX: 2\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_response_parsing() {
        let parsed = response("http://192.168.1.30:1400/xml/device_description.xml");
        assert_eq!(parsed.location(), Some("http://192.168.1.30:1400/xml/device_description.xml"));
        assert_eq!(parsed.header("cache-control"), Some("max-age=1800"));

        assert!(parse_response("NOTIFY * HTTP/1.1\r\nHOST: x\r\n\r\n").is_none());
        assert!(parse_response("HTTP/1.1 404 Not Found\r\n\r\n").is_none());
        assert!(parse_response("").is_none());
    }

    #[test]
    fn test_description_parsing() {
        let description = parse_description(DESCRIPTION).unwrap();
        assert_eq!(description.friendly_name.as_deref(), Some("Kitchen Speaker"));
        assert_eq!(description.manufacturer.as_deref(), Some("Sono & Co"));
        assert_eq!(description.udn.as_deref(), Some("uuid:RINCON_000E58A0"));
        assert_eq!(description.service_types.len(), 2);
        assert!(parse_description("<root><specVersion/></root>").is_none());
    }

    #[test]
    fn test_device_from_response_and_description() {
        let parsed = response("http://192.168.1.30:1400/desc.xml");
        let description = parse_description(DESCRIPTION).unwrap();
        let device = device_from_response(&parsed, "192.168.1.30".parse().unwrap(), Some(&description));

        assert_eq!(device.serial.as_deref(), Some("RINCON_000E58A0"));
        assert_eq!(device.identity_key(), "serial:rincon_000e58a0");
        assert_eq!(device.device_type, DeviceType::MediaServer);
        assert!(device.ports.contains(&1400));
        assert_eq!(device.metadata.get("st").map(String::as_str), Some("upnp:rootdevice"));
        assert_eq!(device.name.as_deref(), Some("Kitchen Speaker"));

        let bare = device_from_response(&parsed, "192.168.1.30".parse().unwrap(), None);
        assert_eq!(bare.identity_key(), "ip:192.168.1.30");
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify("urn:schemas-upnp-org:device:InternetGatewayDevice:1", &[], ""),
            DeviceType::Router
        );
        assert_eq!(classify("urn:schemas-upnp-org:device:Printer:1", &[], ""), DeviceType::Printer);
        assert_eq!(classify("urn:foo:device:DimmableLight:1", &[], ""), DeviceType::SmartHome);
        assert_eq!(classify("", &[], "IPCamera/1.0 UPnP/1.0"), DeviceType::Camera);
        assert_eq!(classify("", &[], ""), DeviceType::Unknown);
    }

    #[tokio::test]
    async fn test_fetch_description_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/desc.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DESCRIPTION))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let plugin = SsdpPlugin::new().unwrap();
        let description = plugin
            .fetch_description(&format!("{}/desc.xml", server.uri()))
            .await
            .unwrap();
        assert_eq!(description.model_name.as_deref(), Some("Play:1"));

        assert!(plugin
            .fetch_description(&format!("{}/missing.xml", server.uri()))
            .await
            .is_none());
    }
}
