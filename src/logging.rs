//! Logging bootstrap
//!
//! Sets up a `tracing` subscriber with an env filter and optional stderr,
//! rolling file and JSON output. Library code only emits `tracing` events;
//! this module is used by the binary and by embedders that want the same
//! defaults.

use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,

    /// Log to a daily rotated file
    pub file_path: Option<PathBuf>,

    /// Log to stderr
    pub stderr: bool,

    /// Emit JSON lines instead of human readable text
    pub json: bool,

    /// Include thread IDs
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_path: None,
            stderr: true,
            json: false,
            thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            config.level = level_from_directive(&rust_log).unwrap_or(config.level);
        }

        if let Ok(log_file) = std::env::var("DISCOVERY_LOG_FILE") {
            config.file_path = Some(PathBuf::from(log_file));
        }

        if let Ok(log_stderr) = std::env::var("DISCOVERY_LOG_STDERR") {
            config.stderr = log_stderr.to_lowercase() != "false";
        }

        if let Ok(json) = std::env::var("DISCOVERY_LOG_JSON") {
            config.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        config
    }
}

/// Pick the most verbose level mentioned in a `RUST_LOG` style directive
fn level_from_directive(directive: &str) -> Option<Level> {
    let directive = directive.to_lowercase();
    [
        ("trace", Level::TRACE),
        ("debug", Level::DEBUG),
        ("info", Level::INFO),
        ("warn", Level::WARN),
        ("error", Level::ERROR),
    ]
    .into_iter()
    .find(|(name, _)| directive.contains(name))
    .map(|(_, level)| level)
}

/// Initialize the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for as long as file logging is wanted.
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.stderr {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(config.thread_ids);
        if config.json {
            layers.push(layer.json().boxed());
        } else {
            layers.push(layer.with_ansi(true).boxed());
        }
    }

    let mut guard = None;
    if let Some(file_path) = &config.file_path {
        let (writer, file_guard) = tracing_appender::non_blocking(rolling_appender(file_path)?);
        guard = Some(file_guard);

        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_ids(config.thread_ids);
        if config.json {
            layers.push(layer.json().boxed());
        } else {
            layers.push(layer.boxed());
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| EngineError::config(format!("Failed to install log subscriber: {e}")))?;

    Ok(guard)
}

fn rolling_appender(file_path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender> {
    let directory = file_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory)?;

    let file_name = file_path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("edge-discovery.log"));

    Ok(tracing_appender::rolling::daily(directory, file_name))
}

/// Performance logging helpers
pub struct PerfLogger;

impl PerfLogger {
    /// Warn when an operation took longer than the threshold
    pub fn log_if_slow(operation: &str, elapsed: Duration, threshold: Duration) {
        if elapsed > threshold {
            tracing::warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "Slow operation detected"
            );
        } else {
            tracing::debug!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                "Operation completed"
            );
        }
    }
}
