//! Edge discovery command line
//!
//! Runs one discovery pass and prints the devices, or keeps discovering on
//! the configured intervals and prints lifecycle events until interrupted.

use clap::{Parser, Subcommand};
use edge_discovery::events::handler_fn;
use edge_discovery::logging::{init_logging, LogConfig};
use edge_discovery::{DiscoveryConfig, DiscoveryEngine, DiscoveryParams, EngineError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};

/// Edge device discovery
#[derive(Parser, Debug)]
#[command(name = "edge-discovery")]
#[command(about = "Discover IoT and network devices via mDNS, SSDP, SNMP and TCP scanning")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file (defaults plus DISCOVERY_* variables otherwise)
    #[arg(short, long, global = true, env = "DISCOVERY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every active protocol once and print the devices
    Discover {
        /// Limit the run to these protocols
        #[arg(short, long = "protocol")]
        protocols: Vec<String>,

        /// Override the configured CIDR ranges
        #[arg(long = "range")]
        ranges: Vec<String>,

        /// Print machine readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Discover on the configured intervals and print events until Ctrl-C
    Watch {
        /// Limit to these protocols
        #[arg(short, long = "protocol")]
        protocols: Vec<String>,

        /// Interval between runs, e.g. "5m"
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<DiscoveryConfig> {
    let config = match path {
        Some(path) => DiscoveryConfig::from_file(path)?,
        None => DiscoveryConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn params_for(ranges: &[String]) -> DiscoveryParams {
    if ranges.is_empty() {
        DiscoveryParams::new()
    } else {
        DiscoveryParams::new().insert("ip_ranges", ranges.to_vec())
    }
}

async fn discover(engine: &DiscoveryEngine, protocols: &[String], ranges: &[String], json: bool) -> Result<()> {
    let params = params_for(ranges);
    let (devices, failed) = if protocols.is_empty() {
        let result = engine.discover_all(params).await?;
        let failed: Vec<String> = result.failed_protocols().into_iter().map(String::from).collect();
        (result.devices, failed)
    } else {
        let mut failed = Vec::new();
        for protocol in protocols {
            let result = engine.discover_protocol(protocol, params.clone()).await?;
            if !result.success {
                failed.push(protocol.clone());
            }
        }
        (engine.devices().await, failed)
    };

    if json {
        let output = serde_json::json!({ "devices": devices, "failed_protocols": failed });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for device in &devices {
        *by_type.entry(device.device_type.as_str()).or_default() += 1;
        println!(
            "{:<16} {:<14} {:<24} {:<16} {}",
            device.ip_address,
            device.device_type.as_str(),
            device.name.as_deref().unwrap_or("-"),
            device.manufacturer.as_deref().unwrap_or("-"),
            device.protocols.iter().cloned().collect::<Vec<_>>().join(",")
        );
    }
    println!("\n{} device(s)", devices.len());
    for (device_type, count) in by_type {
        println!("  {device_type}: {count}");
    }
    if !failed.is_empty() {
        println!("failed protocols: {}", failed.join(", "));
    }
    Ok(())
}

async fn watch(engine: &DiscoveryEngine, protocols: &[String], interval: Option<Duration>) -> Result<()> {
    let subscription = engine
        .subscribe(
            handler_fn(|event| async move {
                println!("{}", serde_json::to_string(&event.to_flat_map())?);
                Ok(())
            }),
            None,
        )
        .await;

    let names: Vec<String> = if protocols.is_empty() {
        engine.get_active_plugins().await.into_keys().collect()
    } else {
        protocols.to_vec()
    };
    let mut jobs = Vec::new();
    for name in &names {
        jobs.push(engine.schedule_recurring(name, interval).await?);
    }
    info!(protocols = ?names, "👀 Watching for devices, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping");
    for id in jobs {
        engine.cancel_job(id).await;
    }
    engine.unsubscribe(subscription).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env();
    if cli.debug {
        log_config.level = Level::DEBUG;
    }
    log_config.json |= cli.json_logs;
    let _guard = init_logging(log_config)?;

    let config = load_config(cli.config.as_ref())?;
    if let Command::Config = cli.command {
        println!(
            "{}",
            toml::to_string_pretty(&config).map_err(|e| EngineError::config(e.to_string()))?
        );
        return Ok(());
    }

    info!("🚀 Starting edge discovery v{}", env!("CARGO_PKG_VERSION"));
    let engine = DiscoveryEngine::new(config).with_builtin_protocols();
    engine.initialize().await?;

    let outcome = match &cli.command {
        Command::Discover { protocols, ranges, json } => discover(&engine, protocols, ranges, *json).await,
        Command::Watch { protocols, interval } => watch(&engine, protocols, *interval).await,
        Command::Config => Ok(()),
    };

    if let Err(e) = &outcome {
        edge_discovery::log_structured_error!(e, "cli", "run");
    }
    let stats = engine.get_statistics().await;
    info!(
        devices = stats.registry.total,
        discovered = stats.devices_discovered,
        errors = stats.discovery_errors,
        "✅ Done"
    );
    engine.shutdown().await;
    outcome
}
