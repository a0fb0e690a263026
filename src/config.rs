//! Engine configuration
//!
//! The whole tree deserializes from TOML with humantime durations
//! (`"30s"`, `"5m"`). Every section has defaults so a config file only
//! needs the values it changes.

use crate::error::{EngineError, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration handed to the engine at `initialize()`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Network ranges and probe limits
    pub network: NetworkConfig,

    /// Job scheduling and retry policy
    pub scheduler: SchedulerConfig,

    /// Plugin sources and hot reload
    pub plugins: PluginSettings,

    /// Per-protocol settings keyed by plugin name
    pub protocols: HashMap<String, ProtocolConfig>,

    /// Rate limits for network-touching plugins
    pub rate_limit: RateLimitConfig,

    /// Event bus settings
    pub events: EventsConfig,

    /// Device registry liveness
    pub registry: RegistryConfig,
}

/// Network ranges and probe limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// CIDR ranges to scan
    pub ip_ranges: Vec<String>,

    /// TCP connect / request timeout per probe
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Maximum number of in-flight probes
    pub max_concurrent_connections: usize,

    /// Ports probed by the network scan
    pub common_ports: Vec<u16>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip_ranges: vec!["192.168.1.0/24".to_string()],
            connect_timeout: Duration::from_secs(1),
            max_concurrent_connections: 50,
            common_ports: vec![
                22, 23, 53, 80, 161, 443, 554, 631, 1883, 1900, 5353, 5683, 8080, 8443, 8883, 9100,
            ],
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size
    pub max_concurrent_jobs: usize,

    /// Deadline for a single job attempt
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,

    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Upper bound for any retry delay
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_factor: f64,

    /// Relative jitter applied to retry delays (0.1 = ±10%)
    pub jitter_factor: f64,

    /// Interval for recurring discovery jobs
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,

    /// Adaptive interval tuning
    pub adaptive: AdaptiveConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            job_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
            default_interval: Duration::from_secs(300),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

/// Adaptive interval thresholds for recurring jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Enable interval adaptation
    pub enabled: bool,

    /// Lower clamp
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,

    /// Upper clamp
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,

    /// New devices in one run needed to shorten the interval
    pub shorten_threshold: usize,

    /// Multiplier applied when shortening (< 1.0)
    pub shorten_factor: f64,

    /// Multiplier applied after an empty or failed run (> 1.0)
    pub lengthen_factor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(7200),
            shorten_threshold: 1,
            shorten_factor: 0.5,
            lengthen_factor: 1.5,
        }
    }
}

/// Plugin sources and hot reload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Directories scanned for `*.toml` plugin manifests
    pub directories: Vec<PathBuf>,

    /// Watch directories and reload on change
    pub auto_reload: bool,

    /// Quiet period before a burst of file events is acted on
    #[serde(with = "humantime_serde")]
    pub reload_debounce: Duration,

    /// Only load these plugins (empty = all registered)
    pub enabled: Vec<String>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            directories: vec![PathBuf::from("plugins")],
            auto_reload: true,
            reload_debounce: Duration::from_millis(500),
            enabled: Vec::new(),
        }
    }
}

/// Settings for one protocol plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub enabled: bool,

    /// Higher runs first when jobs compete for workers
    pub priority: u32,

    /// Deadline for one `discover()` call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Overrides `scheduler.max_retries` for this protocol
    pub max_retries: Option<u32>,

    /// Protocol specific options (service types, search targets, ...)
    pub settings: HashMap<String, serde_json::Value>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 50,
            timeout: Duration::from_secs(30),
            max_retries: None,
            settings: HashMap::new(),
        }
    }
}

impl ProtocolConfig {
    fn with(enabled: bool, priority: u32, timeout_secs: u64) -> Self {
        Self {
            enabled,
            priority,
            timeout: Duration::from_secs(timeout_secs),
            ..Default::default()
        }
    }

    fn setting(mut self, key: &str, value: serde_json::Value) -> Self {
        self.settings.insert(key.to_string(), value);
        self
    }
}

/// Defaults for the built-in protocols
pub fn default_protocols() -> HashMap<String, ProtocolConfig> {
    use serde_json::json;

    let mut protocols = HashMap::new();
    protocols.insert(
        "mdns".to_string(),
        ProtocolConfig::with(true, 90, 10).setting(
            "service_types",
            json!(["_http._tcp.local.", "_https._tcp.local.", "_ssh._tcp.local."]),
        ),
    );
    protocols.insert(
        "ssdp".to_string(),
        ProtocolConfig::with(true, 80, 15)
            .setting("search_targets", json!(["upnp:rootdevice", "ssdp:all"]))
            .setting("mx", json!(3)),
    );
    protocols.insert(
        "snmp".to_string(),
        ProtocolConfig::with(false, 70, 10)
            .setting("community", json!("public"))
            .setting("version", json!("2c"))
            .setting("port", json!(161)),
    );
    protocols.insert("network_scan".to_string(), ProtocolConfig::with(true, 60, 30));
    protocols
}

/// Token bucket limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    /// Probes a single host may receive back to back before its rate applies
    pub burst_size: u32,
    /// Requests per second towards a single host
    pub per_host_limit: f64,
    /// Requests per second across all hosts
    pub global_limit: f64,
    /// Longest a probe waits for a token before it is skipped
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_size: 20,
            per_host_limit: 2.0,
            global_limit: 100.0,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events kept for replay
    pub history_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { history_size: 1000 }
    }
}

/// Device liveness thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Not re-seen for this long marks a device stale
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    /// Not re-seen for this long marks a device lost
    #[serde(with = "humantime_serde")]
    pub lost_after: Duration,

    /// How often the staleness sweep runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Lost devices not re-seen for this long are dropped from the registry
    #[serde(with = "humantime_serde")]
    pub evict_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(600),
            lost_after: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
            evict_after: Duration::from_secs(86_400),
        }
    }
}

impl DiscoveryConfig {
    /// Defaults with the built-in protocol table filled in
    pub fn new() -> Self {
        Self {
            protocols: default_protocols(),
            ..Default::default()
        }
    }

    /// Load a TOML file layered with `DISCOVERY__SECTION__KEY` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.as_ref()).format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("DISCOVERY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("network.ip_ranges")
                    .with_list_parse_key("plugins.directories"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        Ok(config.with_default_protocols())
    }

    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config.with_default_protocols())
    }

    /// Defaults overridden by the flat `DISCOVERY_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(ranges) = std::env::var("DISCOVERY_IP_RANGES") {
            config.network.ip_ranges = split_list(&ranges);
        }
        if let Ok(interval) = std::env::var("DISCOVERY_INTERVAL") {
            config.scheduler.default_interval = parse_duration("DISCOVERY_INTERVAL", &interval)?;
        }
        if let Ok(jobs) = std::env::var("DISCOVERY_MAX_CONCURRENT_JOBS") {
            config.scheduler.max_concurrent_jobs = parse_number("DISCOVERY_MAX_CONCURRENT_JOBS", &jobs)?;
        }
        if let Ok(retries) = std::env::var("DISCOVERY_MAX_RETRIES") {
            config.scheduler.max_retries = parse_number("DISCOVERY_MAX_RETRIES", &retries)?;
        }
        if let Ok(timeout) = std::env::var("DISCOVERY_PROTOCOL_TIMEOUT") {
            let timeout = parse_duration("DISCOVERY_PROTOCOL_TIMEOUT", &timeout)?;
            for protocol in config.protocols.values_mut() {
                protocol.timeout = timeout;
            }
        }
        if let Ok(dirs) = std::env::var("DISCOVERY_PLUGIN_DIRS") {
            config.plugins.directories = split_list(&dirs).into_iter().map(PathBuf::from).collect();
        }
        if let Ok(reload) = std::env::var("DISCOVERY_AUTO_RELOAD") {
            config.plugins.auto_reload = matches!(reload.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(size) = std::env::var("DISCOVERY_HISTORY_SIZE") {
            config.events.history_size = parse_number("DISCOVERY_HISTORY_SIZE", &size)?;
        }

        Ok(config)
    }

    /// Insert defaults for built-in protocols the file did not mention
    pub fn with_default_protocols(mut self) -> Self {
        for (name, protocol) in default_protocols() {
            self.protocols.entry(name).or_insert(protocol);
        }
        self
    }

    /// Settings for a protocol, falling back to generic defaults
    pub fn protocol(&self, name: &str) -> ProtocolConfig {
        self.protocols.get(name).cloned().unwrap_or_default()
    }

    /// Check every section and report all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for range in &self.network.ip_ranges {
            if range.parse::<IpNetwork>().is_err() {
                errors.push(format!("network.ip_ranges: '{range}' is not a valid CIDR range"));
            }
        }
        if self.network.connect_timeout.is_zero() {
            errors.push("network.connect_timeout must be greater than zero".to_string());
        }
        if self.network.max_concurrent_connections == 0 {
            errors.push("network.max_concurrent_connections must be greater than zero".to_string());
        }

        let scheduler = &self.scheduler;
        if scheduler.max_concurrent_jobs == 0 {
            errors.push("scheduler.max_concurrent_jobs must be greater than zero".to_string());
        }
        if scheduler.job_timeout.is_zero() {
            errors.push("scheduler.job_timeout must be greater than zero".to_string());
        }
        if scheduler.backoff_factor < 1.0 {
            errors.push("scheduler.backoff_factor must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&scheduler.jitter_factor) {
            errors.push("scheduler.jitter_factor must be between 0.0 and 1.0".to_string());
        }
        if scheduler.retry_base_delay > scheduler.max_retry_delay {
            errors.push("scheduler.retry_base_delay must not exceed max_retry_delay".to_string());
        }

        let adaptive = &scheduler.adaptive;
        if adaptive.min_interval > adaptive.max_interval {
            errors.push("scheduler.adaptive.min_interval must not exceed max_interval".to_string());
        }
        if !(adaptive.shorten_factor > 0.0 && adaptive.shorten_factor <= 1.0) {
            errors.push("scheduler.adaptive.shorten_factor must be in (0.0, 1.0]".to_string());
        }
        if adaptive.lengthen_factor < 1.0 {
            errors.push("scheduler.adaptive.lengthen_factor must be at least 1.0".to_string());
        }

        for (name, protocol) in &self.protocols {
            if protocol.timeout.is_zero() {
                errors.push(format!("protocols.{name}.timeout must be greater than zero"));
            }
        }

        if self.rate_limit.requests_per_second <= 0.0 || self.rate_limit.per_host_limit <= 0.0 {
            errors.push("rate_limit rates must be greater than zero".to_string());
        }
        if self.rate_limit.global_limit <= 0.0 {
            errors.push("rate_limit.global_limit must be greater than zero".to_string());
        }
        if self.rate_limit.acquire_timeout.is_zero() {
            errors.push("rate_limit.acquire_timeout must be greater than zero".to_string());
        }
        if self.events.history_size == 0 {
            errors.push("events.history_size must be greater than zero".to_string());
        }
        if self.registry.stale_after > self.registry.lost_after {
            errors.push("registry.stale_after must not exceed lost_after".to_string());
        }
        if self.registry.lost_after > self.registry.evict_after {
            errors.push("registry.lost_after must not exceed evict_after".to_string());
        }
        if self.registry.sweep_interval.is_zero() {
            errors.push("registry.sweep_interval must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::config(errors.join("; ")))
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::config(format!("{key}: '{value}' is not a valid number")))
}

/// Accepts plain seconds or a humantime string
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| EngineError::config(format!("{key}: '{value}' is not a valid duration: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DiscoveryConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.events.history_size, 1000);
        assert!(!config.protocol("snmp").enabled);
        assert_eq!(config.protocol("mdns").priority, 90);
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let mut config = DiscoveryConfig::new();
        config.network.ip_ranges = vec!["not-a-range".to_string()];
        config.scheduler.max_concurrent_jobs = 0;
        config.scheduler.adaptive.min_interval = Duration::from_secs(600);
        config.scheduler.adaptive.max_interval = Duration::from_secs(60);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("not-a-range"));
        assert!(err.contains("max_concurrent_jobs"));
        assert!(err.contains("min_interval"));
    }

    #[test]
    fn test_validate_rate_limit_and_retention() {
        let mut config = DiscoveryConfig::new();
        config.rate_limit.acquire_timeout = Duration::ZERO;
        config.registry.evict_after = Duration::from_secs(60);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("acquire_timeout"));
        assert!(err.contains("evict_after"));
    }

    #[test]
    fn test_from_toml_str_partial_file() {
        let config = DiscoveryConfig::from_toml_str(
            r#"
            [scheduler]
            max_concurrent_jobs = 2
            retry_base_delay = "250ms"

            [protocols.snmp]
            enabled = true
            timeout = "5s"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_concurrent_jobs, 2);
        assert_eq!(config.scheduler.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.scheduler.max_retries, 3);
        assert!(config.protocol("snmp").enabled);
        assert_eq!(config.protocol("snmp").timeout, Duration::from_secs(5));
        // untouched protocols keep their defaults
        assert_eq!(config.protocol("ssdp").priority, 80);
    }

    #[test]
    #[serial_test::serial]
    fn test_from_file_with_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[events]\nhistory_size = 50\n\n[scheduler]\nmax_retries = 1").unwrap();

        temp_env::with_var("DISCOVERY__SCHEDULER__MAX_RETRIES", Some("7"), || {
            let config = DiscoveryConfig::from_file(file.path()).unwrap();
            assert_eq!(config.events.history_size, 50);
            assert_eq!(config.scheduler.max_retries, 7);
        });
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_flat_variables() {
        temp_env::with_vars(
            [
                ("DISCOVERY_IP_RANGES", Some("10.0.0.0/24, 10.0.1.0/24")),
                ("DISCOVERY_INTERVAL", Some("10m")),
                ("DISCOVERY_MAX_CONCURRENT_JOBS", Some("8")),
            ],
            || {
                let config = DiscoveryConfig::from_env().unwrap();
                assert_eq!(config.network.ip_ranges.len(), 2);
                assert_eq!(config.scheduler.default_interval, Duration::from_secs(600));
                assert_eq!(config.scheduler.max_concurrent_jobs, 8);
            },
        );

        temp_env::with_var("DISCOVERY_MAX_RETRIES", Some("lots"), || {
            assert!(DiscoveryConfig::from_env().is_err());
        });
    }
}
