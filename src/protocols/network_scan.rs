//! TCP connect scanning
//!
//! Hosts of the configured CIDR ranges are probed on a list of common ports.
//! Open ports get a short banner grab, and the device type is guessed from
//! the port set and the identified services.

use super::rate_limiter::AdaptiveRateLimiter;
use super::{expand_ranges, PLUGIN_VERSION};
use crate::config::{NetworkConfig, RateLimitConfig};
use crate::device::{Device, DeviceType, DiscoveryParams, DiscoveryResult};
use crate::error::{EngineError, Result};
use crate::plugins::{DiscoveryPlugin, PluginConfig, PluginMetadata};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const MAX_HOSTS: usize = 4096;
const MAX_BANNER_PORTS: usize = 5;
const BANNER_BYTES: usize = 1024;
const HTTP_PORTS: &[u16] = &[80, 8000, 8008, 8080, 8081, 8888];

/// `(port, service, banner markers)`
const SERVICE_SIGNATURES: &[(u16, &str, &[&str])] = &[
    (21, "ftp", &["ftp", "220"]),
    (22, "ssh", &["ssh"]),
    (23, "telnet", &["telnet", "login:"]),
    (25, "smtp", &["smtp", "220"]),
    (53, "dns", &[]),
    (80, "http", &["http/", "server:"]),
    (139, "netbios", &[]),
    (161, "snmp", &[]),
    (443, "https", &[]),
    (445, "smb", &[]),
    (554, "rtsp", &["rtsp/"]),
    (631, "ipp", &["http/", "cups"]),
    (1883, "mqtt", &[]),
    (5683, "coap", &[]),
    (8080, "http", &["http/", "server:"]),
    (8443, "https", &[]),
    (8883, "mqtts", &[]),
    (9100, "printer", &[]),
];

/// Outcome of probing one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    Open,
    Closed,
    Filtered,
    /// Never probed: no rate limit token in time
    Skipped,
}

/// What scanning one host turned up
struct HostScan {
    device: Option<Device>,
    skipped: usize,
}

/// Service name for `port`, refined by its banner when there is one
pub fn identify_service(port: u16, banner: Option<&str>) -> String {
    let signature = SERVICE_SIGNATURES.iter().find(|(p, _, _)| *p == port);
    let Some(banner) = banner.map(str::to_lowercase) else {
        return signature
            .map(|(_, name, _)| name.to_string())
            .unwrap_or_else(|| format!("tcp-{port}"));
    };

    if let Some((_, name, markers)) = signature {
        if markers.is_empty() || markers.iter().any(|m| banner.contains(m)) {
            return name.to_string();
        }
    }
    if banner.starts_with("ssh-") || banner.contains("openssh") {
        "ssh".to_string()
    } else if banner.contains("rtsp/") {
        "rtsp".to_string()
    } else if banner.contains("http/") {
        "http".to_string()
    } else if banner.contains("ftp") {
        "ftp".to_string()
    } else {
        signature
            .map(|(_, name, _)| name.to_string())
            .unwrap_or_else(|| format!("tcp-{port}"))
    }
}

/// Device type from open ports and identified services
pub fn classify(ports: &BTreeSet<u16>, services: &BTreeSet<String>) -> DeviceType {
    let has = |port: u16| ports.contains(&port);
    let any = |candidates: &[u16]| candidates.iter().any(|p| ports.contains(p));
    let service = |needle: &str| services.iter().any(|s| s.contains(needle));

    if has(80) && has(443) && (has(22) || has(23)) {
        DeviceType::Router
    } else if any(&[515, 631, 9100]) || service("printer") || service("ipp") {
        DeviceType::Printer
    } else if has(554) || service("rtsp") {
        DeviceType::Camera
    } else if any(&[8200, 32400]) {
        DeviceType::MediaServer
    } else if any(&[1883, 8883]) || service("mqtt") {
        DeviceType::IotGateway
    } else if has(161) || (has(22) && has(80)) {
        DeviceType::Switch
    } else if any(&[5683, 5353]) {
        DeviceType::IotSensor
    } else {
        DeviceType::Unknown
    }
}

/// First line of whatever the service says after connecting
async fn grab_banner(addr: SocketAddr, timeout: Duration) -> Option<String> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        if HTTP_PORTS.contains(&addr.port()) {
            stream.write_all(b"HEAD / HTTP/1.0\r\n\r\n").await.ok()?;
        }
        let mut buffer = vec![0u8; BANNER_BYTES];
        let len = stream.read(&mut buffer).await.ok()?;
        let text = String::from_utf8_lossy(&buffer[..len]);
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.chars().filter(|c| !c.is_control()).collect::<String>())
    };
    tokio::time::timeout(timeout, exchange).await.ok().flatten()
}

/// TCP connect scan over CIDR ranges
pub struct NetworkScanPlugin {
    network: NetworkConfig,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl NetworkScanPlugin {
    pub fn new(network: NetworkConfig, rate_limit: RateLimitConfig) -> Self {
        Self {
            network,
            limiter: Arc::new(AdaptiveRateLimiter::new(rate_limit)),
        }
    }

    pub fn plugin_metadata() -> PluginMetadata {
        PluginMetadata::new("network_scan", PLUGIN_VERSION)
            .with_description("TCP connect scan with banner grabbing")
            .with_protocol("tcp")
            .with_tag("active")
    }

    pub fn rate_limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    fn ports_from(&self, params: &DiscoveryParams) -> Vec<u16> {
        let requested: Option<Vec<u16>> = params.get("ports").and_then(|value| match value {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|p| u16::try_from(p).ok())
                    .collect(),
            ),
            Value::String(s) => Some(s.split(',').filter_map(|p| p.trim().parse().ok()).collect()),
            _ => None,
        });
        let mut ports = requested
            .filter(|ports| !ports.is_empty())
            .unwrap_or_else(|| self.network.common_ports.clone());
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    async fn probe(&self, addr: SocketAddr, timeout: Duration, semaphore: &Semaphore) -> PortState {
        let host = addr.ip().to_string();
        if let Err(e) = self
            .limiter
            .acquire(&host, Some(self.limiter.acquire_timeout()))
            .await
        {
            debug!(host = %host, port = addr.port(), error = %e, "Probe skipped");
            return PortState::Skipped;
        }
        let Ok(_permit) = semaphore.acquire().await else {
            return PortState::Skipped;
        };

        let started = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                self.limiter.record_success(&host, started.elapsed()).await;
                PortState::Open
            }
            // A refusal still proves the host answers
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                self.limiter.record_success(&host, started.elapsed()).await;
                PortState::Closed
            }
            Ok(Err(e)) => {
                self.limiter.record_failure(&host, "connection_failed").await;
                debug!(%addr, error = %e, "Connect failed");
                PortState::Filtered
            }
            Err(_) => {
                self.limiter.record_failure(&host, "timeout").await;
                PortState::Filtered
            }
        }
    }

    async fn scan_host(&self, ip: IpAddr, ports: &[u16], timeout: Duration, semaphore: &Semaphore) -> HostScan {
        let states = join_all(
            ports
                .iter()
                .map(|&port| self.probe(SocketAddr::new(ip, port), timeout, semaphore)),
        )
        .await;
        let skipped = states.iter().filter(|state| **state == PortState::Skipped).count();
        let open: Vec<u16> = ports
            .iter()
            .zip(states)
            .filter(|(_, state)| *state == PortState::Open)
            .map(|(port, _)| *port)
            .collect();
        if open.is_empty() {
            return HostScan { device: None, skipped };
        }

        let mut device = Device::new(ip, "network_scan");
        for &port in &open {
            device.ports.insert(port);
        }
        for &port in open.iter().take(MAX_BANNER_PORTS) {
            let banner = grab_banner(SocketAddr::new(ip, port), timeout).await;
            let service = identify_service(port, banner.as_deref());
            device.capabilities.insert(format!("port_{port}"), service.clone());
            if let Some(banner) = banner {
                device.metadata.insert(format!("banner_{port}"), banner);
            }
            device.services.insert(service);
        }
        for &port in open.iter().skip(MAX_BANNER_PORTS) {
            device.services.insert(identify_service(port, None));
        }
        device.device_type = classify(&device.ports, &device.services);
        debug!(host = %ip, open_ports = ?open, device_type = device.device_type.as_str(), "Host responded");
        HostScan {
            device: Some(device),
            skipped,
        }
    }
}

#[async_trait]
impl DiscoveryPlugin for NetworkScanPlugin {
    fn metadata(&self) -> PluginMetadata {
        Self::plugin_metadata()
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<()> {
        if self.network.common_ports.is_empty() && !config.settings.contains_key("ports") {
            return Err(EngineError::config("network scan has no ports to probe"));
        }
        Ok(())
    }

    async fn discover(&self, params: &DiscoveryParams) -> Result<DiscoveryResult> {
        let started = Instant::now();
        let ranges = params
            .get_str_list("ip_ranges")
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.network.ip_ranges.clone());
        let hosts = match expand_ranges(&ranges, MAX_HOSTS) {
            Ok(hosts) => hosts,
            Err(e) => return Ok(DiscoveryResult::failure("network_scan", e.to_string(), started.elapsed())),
        };
        if hosts.is_empty() {
            return Ok(DiscoveryResult::failure(
                "network_scan",
                "no valid networks to scan",
                started.elapsed(),
            ));
        }

        let ports = self.ports_from(params);
        let timeout = params
            .get_u64("connect_timeout_ms")
            .map(Duration::from_millis)
            .unwrap_or(self.network.connect_timeout);
        let semaphore = Semaphore::new(self.network.max_concurrent_connections.max(1));
        info!(hosts = hosts.len(), ports = ports.len(), "Starting network scan");

        let scans = join_all(
            hosts
                .iter()
                .map(|&ip| self.scan_host(ip, &ports, timeout, &semaphore)),
        )
        .await;
        let skipped: usize = scans.iter().map(|scan| scan.skipped).sum();
        let devices: Vec<Device> = scans.into_iter().filter_map(|scan| scan.device).collect();
        if skipped > 0 {
            warn!(skipped, "Rate limit left probes unsent; raise rate_limit.acquire_timeout or burst_size");
        }

        let limiter = self.limiter.get_statistics().await;
        info!(
            hosts = hosts.len(),
            devices = devices.len(),
            success_rate = limiter.success_rate,
            "Network scan finished"
        );
        Ok(DiscoveryResult::success("network_scan", devices, started.elapsed())
            .with_metadata("hosts_scanned", hosts.len())
            .with_metadata("ports_scanned", ports)
            .with_metadata("probes_skipped", skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_limits() -> RateLimitConfig {
        RateLimitConfig {
            per_host_limit: 1000.0,
            global_limit: 1000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_identify_service() {
        assert_eq!(identify_service(22, Some("SSH-2.0-OpenSSH_9.3")), "ssh");
        assert_eq!(identify_service(2222, Some("SSH-2.0-dropbear")), "ssh");
        assert_eq!(identify_service(8080, Some("HTTP/1.0 200 OK")), "http");
        assert_eq!(identify_service(1883, None), "mqtt");
        assert_eq!(identify_service(4000, None), "tcp-4000");
    }

    #[test]
    fn test_classify_from_ports() {
        let services = BTreeSet::new();
        let ports = |list: &[u16]| list.iter().copied().collect::<BTreeSet<u16>>();

        assert_eq!(classify(&ports(&[22, 80, 443]), &services), DeviceType::Router);
        assert_eq!(classify(&ports(&[9100]), &services), DeviceType::Printer);
        assert_eq!(classify(&ports(&[554, 80]), &services), DeviceType::Camera);
        assert_eq!(classify(&ports(&[1883]), &services), DeviceType::IotGateway);
        assert_eq!(classify(&ports(&[161]), &services), DeviceType::Switch);
        assert_eq!(classify(&ports(&[5683]), &services), DeviceType::IotSensor);
        assert_eq!(classify(&ports(&[4000]), &services), DeviceType::Unknown);

        let mqtt = BTreeSet::from(["mqtt".to_string()]);
        assert_eq!(classify(&ports(&[4000]), &mqtt), DeviceType::IotGateway);
    }

    #[tokio::test]
    async fn test_scan_finds_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"SSH-2.0-OpenSSH_9.3\r\n").await;
            }
        });
        let closed = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let plugin = NetworkScanPlugin::new(NetworkConfig::default(), fast_limits());
        let params = DiscoveryParams::new()
            .insert("ip_ranges", "127.0.0.1/32")
            .insert("ports", vec![open, closed])
            .insert("connect_timeout_ms", 1000);
        let result = plugin.discover(&params).await.unwrap();

        assert!(result.success);
        assert_eq!(result.devices.len(), 1);
        let device = &result.devices[0];
        assert_eq!(device.ports, BTreeSet::from([open]));
        assert!(device.services.contains("ssh"));
        assert_eq!(
            device.metadata.get(&format!("banner_{open}")).map(String::as_str),
            Some("SSH-2.0-OpenSSH_9.3")
        );
        assert!(plugin.rate_limiter().get_statistics().await.total_requests >= 2);
    }

    #[tokio::test]
    async fn test_invalid_ranges_fail_the_run() {
        let plugin = NetworkScanPlugin::new(NetworkConfig::default(), fast_limits());
        let params = DiscoveryParams::new().insert("ip_ranges", vec!["not-a-network"]);
        let result = plugin.discover(&params).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no valid networks to scan"));
    }

    async fn listeners(count: usize) -> Vec<u16> {
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ports.push(listener.local_addr().unwrap().port());
            tokio::spawn(async move { while listener.accept().await.is_ok() {} });
        }
        ports
    }

    #[tokio::test]
    async fn test_default_limits_probe_every_default_sized_port_list() {
        let ports = listeners(16).await;
        let plugin = NetworkScanPlugin::new(NetworkConfig::default(), RateLimitConfig::default());
        let params = DiscoveryParams::new()
            .insert("ip_ranges", "127.0.0.1/32")
            .insert("ports", ports)
            .insert("connect_timeout_ms", 200);
        let result = plugin.discover(&params).await.unwrap();

        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].ports.len(), 16);
        assert_eq!(result.metadata.get("probes_skipped").and_then(|v| v.as_u64()), Some(0));
    }

    #[tokio::test]
    async fn test_ports_beyond_the_burst_wait_for_tokens() {
        let ports = listeners(6).await;
        let limits = RateLimitConfig {
            burst_size: 2,
            per_host_limit: 20.0,
            global_limit: 1000.0,
            ..Default::default()
        };
        let plugin = NetworkScanPlugin::new(NetworkConfig::default(), limits);
        let params = DiscoveryParams::new()
            .insert("ip_ranges", "127.0.0.1/32")
            .insert("ports", ports)
            .insert("connect_timeout_ms", 50);
        let result = plugin.discover(&params).await.unwrap();

        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].ports.len(), 6);
        assert_eq!(result.metadata.get("probes_skipped").and_then(|v| v.as_u64()), Some(0));
    }

    #[tokio::test]
    async fn test_token_starved_ports_are_skipped_not_filtered() {
        let ports = listeners(4).await;
        let limits = RateLimitConfig {
            burst_size: 1,
            per_host_limit: 0.1,
            global_limit: 1000.0,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let plugin = NetworkScanPlugin::new(NetworkConfig::default(), limits);
        let params = DiscoveryParams::new()
            .insert("ip_ranges", "127.0.0.1/32")
            .insert("ports", ports)
            .insert("connect_timeout_ms", 200);
        let result = plugin.discover(&params).await.unwrap();

        assert!(result.success);
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].ports.len(), 1);
        assert_eq!(result.metadata.get("probes_skipped").and_then(|v| v.as_u64()), Some(3));
    }
}
