//! Built-in protocol plugins
//!
//! Each protocol is a [`DiscoveryPlugin`](crate::plugins::DiscoveryPlugin)
//! registered through a compiled-in factory. Wire parsing lives in plain
//! functions so it can be tested without a network.

pub mod mdns;
pub mod network_scan;
pub mod rate_limiter;
pub mod snmp;
pub mod ssdp;

pub use mdns::MdnsPlugin;
pub use network_scan::NetworkScanPlugin;
pub use rate_limiter::{AdaptiveRateLimiter, HostStats, RateLimiterStats, TokenBucket};
pub use snmp::SnmpPlugin;
pub use ssdp::SsdpPlugin;

use crate::config::DiscoveryConfig;
use crate::device::DiscoveryParams;
use crate::error::{EngineError, Result};
use crate::plugins::{factory_fn, DiscoveryPlugin, PluginConfig, PluginFactory};
use ipnetwork::IpNetwork;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest datagram the listeners accept
const MAX_DATAGRAM: usize = 9000;

/// Factories for mDNS, SSDP, SNMP and network scan
pub fn builtin_factories(config: &DiscoveryConfig) -> Vec<Arc<dyn PluginFactory>> {
    let network = config.network.clone();
    let rate_limit = config.rate_limit.clone();

    vec![
        factory_fn(MdnsPlugin::plugin_metadata(), |_| -> Result<Arc<dyn DiscoveryPlugin>> {
            Ok(Arc::new(MdnsPlugin::new()))
        }),
        factory_fn(SsdpPlugin::plugin_metadata(), |_| -> Result<Arc<dyn DiscoveryPlugin>> {
            Ok(Arc::new(SsdpPlugin::new()?))
        }),
        {
            let network = network.clone();
            let rate_limit = rate_limit.clone();
            factory_fn(SnmpPlugin::plugin_metadata(), move |_| -> Result<Arc<dyn DiscoveryPlugin>> {
                Ok(Arc::new(SnmpPlugin::new(network.clone(), rate_limit.clone())))
            })
        },
        factory_fn(NetworkScanPlugin::plugin_metadata(), move |_| -> Result<Arc<dyn DiscoveryPlugin>> {
            Ok(Arc::new(NetworkScanPlugin::new(network.clone(), rate_limit.clone())))
        }),
    ]
}

/// How long a listener should collect answers.
///
/// `listen_ms` from the parameters wins; the result always leaves a fifth of
/// the plugin timeout for parsing and follow-up requests.
pub(crate) fn listen_window(params: &DiscoveryParams, default: Duration, config: Option<&PluginConfig>) -> Duration {
    let wanted = params
        .get_u64("listen_ms")
        .map(Duration::from_millis)
        .unwrap_or(default);
    match config {
        Some(config) => wanted.min(config.timeout.mul_f64(0.8)),
        None => wanted,
    }
}

/// Host addresses of CIDR ranges, without network and broadcast addresses.
///
/// Invalid ranges are skipped; more than `limit` hosts is an error.
pub(crate) fn expand_ranges(ranges: &[String], limit: usize) -> Result<Vec<IpAddr>> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    let mut push = |ip: IpAddr| -> Result<()> {
        if seen.insert(ip) {
            hosts.push(ip);
            if hosts.len() > limit {
                return Err(EngineError::invalid_input(format!(
                    "IP ranges expand to more than {limit} hosts"
                )));
            }
        }
        Ok(())
    };

    for range in ranges {
        let network = match range.parse::<IpNetwork>() {
            Ok(network) => network,
            Err(e) => {
                warn!(range = %range, error = %e, "Skipping invalid IP range");
                continue;
            }
        };
        match network {
            IpNetwork::V4(net) => {
                let edges = net.prefix() < 31;
                for ip in net.iter() {
                    if edges && (ip == net.network() || ip == net.broadcast()) {
                        continue;
                    }
                    push(IpAddr::V4(ip))?;
                }
            }
            IpNetwork::V6(net) => {
                for ip in net.iter() {
                    push(IpAddr::V6(ip))?;
                }
            }
        }
    }
    Ok(hosts)
}

/// UDP socket bound to an ephemeral port, ready to send to `group`
pub(crate) fn multicast_socket(ttl: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Collect datagrams until `window` elapses
pub(crate) async fn collect_datagrams(socket: &UdpSocket, window: Duration) -> Vec<(Vec<u8>, SocketAddr)> {
    let deadline = Instant::now() + window;
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    let mut received = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
            Ok(Ok((len, from))) => received.push((buffer[..len].to_vec(), from)),
            Ok(Err(e)) => {
                debug!(error = %e, "Receive failed while collecting responses");
                break;
            }
            Err(_) => break,
        }
    }
    received
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_factory_names() {
        let names: Vec<String> = builtin_factories(&DiscoveryConfig::new())
            .iter()
            .map(|f| f.metadata().name)
            .collect();
        assert_eq!(names, vec!["mdns", "ssdp", "snmp", "network_scan"]);
    }

    #[test]
    fn test_expand_ranges() {
        let ranges = vec!["10.0.0.0/30".to_string(), "bogus".to_string(), "10.0.0.1/32".to_string()];
        let hosts = expand_ranges(&ranges, 16).unwrap();
        let expected: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        assert_eq!(hosts, expected);

        let err = expand_ranges(&["10.0.0.0/16".to_string()], 100).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_listen_window_respects_plugin_timeout() {
        let mut config = PluginConfig::new("mdns");
        config.timeout = Duration::from_secs(1);
        let params = DiscoveryParams::new().insert("listen_ms", 5000);
        assert_eq!(listen_window(&params, Duration::from_secs(3), Some(&config)), Duration::from_millis(800));
        assert_eq!(
            listen_window(&DiscoveryParams::new(), Duration::from_millis(300), Some(&config)),
            Duration::from_millis(300)
        );
    }
}
