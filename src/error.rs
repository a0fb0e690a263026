//! Error types for the discovery engine
//!
//! Every failure class the engine knows about has its own variant so callers
//! can decide between retrying, degrading a plugin, or surfacing the problem.
//! Plugin and subscriber failures are normally caught at their boundary and
//! logged through [`ErrorReporter`] rather than returned.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy for the discovery engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Plugin could not be loaded (missing/cyclic dependency, failed initialize)
    #[error("Plugin load error: {0}")]
    PluginLoad(String),

    /// Plugin code failed while discovering or cleaning up
    #[error("Plugin runtime error: {0}")]
    PluginRuntime(String),

    /// A scheduled job timed out or failed
    #[error("Job execution error: {0}")]
    JobExecution(String),

    /// Malformed payload received from a device
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Event bus subscriber callback failed
    #[error("Subscriber error: {0}")]
    Subscriber(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation called before the engine was initialized
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Not found errors (plugins, jobs, devices)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP client errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML manifest errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Layered configuration errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Information only
    Info,
    /// Degraded but recoverable
    Warning,
    /// Operation failed
    Error,
    /// Immediate attention required
    Critical,
}

/// Structured context attached to a logged error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Component that generated the error
    pub component: String,
    /// Operation that was being performed
    pub operation: String,
    /// Additional metadata about the error
    pub metadata: HashMap<String, serde_json::Value>,
    /// Timestamp when error occurred
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorContext {
    /// Create new error context
    pub fn new(component: &str, operation: &str) -> Self {
        Self {
            component: component.to_string(),
            operation: operation.to_string(),
            metadata: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Add metadata to error context
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl EngineError {
    /// Create a plugin load error
    pub fn plugin_load<S: Into<String>>(msg: S) -> Self {
        Self::PluginLoad(msg.into())
    }

    /// Create a plugin runtime error
    pub fn plugin_runtime<S: Into<String>>(msg: S) -> Self {
        Self::PluginRuntime(msg.into())
    }

    /// Create a job execution error
    pub fn job_execution<S: Into<String>>(msg: S) -> Self {
        Self::JobExecution(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a subscriber error
    pub fn subscriber<S: Into<String>>(msg: S) -> Self {
        Self::Subscriber(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not-initialized error
    pub fn not_initialized<S: Into<String>>(msg: S) -> Self {
        Self::NotInitialized(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited<S: Into<String>>(msg: S) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Short machine-readable category name
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::PluginLoad(_) => "plugin_load",
            EngineError::PluginRuntime(_) => "plugin_runtime",
            EngineError::JobExecution(_) => "job_execution",
            EngineError::Protocol(_) => "protocol",
            EngineError::Subscriber(_) => "subscriber",
            EngineError::Config(_) | EngineError::ConfigSource(_) | EngineError::Toml(_) => {
                "configuration"
            }
            EngineError::NotInitialized(_) => "lifecycle",
            EngineError::NotFound(_) => "not_found",
            EngineError::Timeout(_) => "timeout",
            EngineError::RateLimited(_) => "rate_limit",
            EngineError::Network(_) | EngineError::Http(_) | EngineError::Io(_) => "network",
            EngineError::InvalidInput(_) | EngineError::Json(_) => "input",
            EngineError::Generic(_) => "internal",
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::Config(_)
            | EngineError::ConfigSource(_)
            | EngineError::NotInitialized(_) => ErrorSeverity::Critical,
            EngineError::PluginLoad(_) | EngineError::JobExecution(_) => ErrorSeverity::Error,
            EngineError::PluginRuntime(_)
            | EngineError::Subscriber(_)
            | EngineError::Timeout(_)
            | EngineError::Network(_)
            | EngineError::Http(_)
            | EngineError::RateLimited(_) => ErrorSeverity::Warning,
            EngineError::Protocol(_) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout(_)
                | EngineError::Network(_)
                | EngineError::Http(_)
                | EngineError::Io(_)
                | EngineError::RateLimited(_)
                | EngineError::JobExecution(_)
                | EngineError::PluginRuntime(_)
                | EngineError::Protocol(_)
        )
    }
}

/// Error logging and reporting utilities
pub struct ErrorReporter;

impl ErrorReporter {
    /// Log an error with the tracing level matching its severity
    pub fn log_error(error: &EngineError, context: Option<ErrorContext>) {
        let (component, operation, metadata) = match context {
            Some(ctx) => (ctx.component, ctx.operation, ctx.metadata),
            None => ("unknown".to_string(), "unknown".to_string(), HashMap::new()),
        };
        let category = error.category();

        match error.severity() {
            ErrorSeverity::Critical => {
                tracing::error!(
                    category,
                    component = %component,
                    operation = %operation,
                    metadata = ?metadata,
                    "Critical error occurred: {}",
                    error
                );
            }
            ErrorSeverity::Error => {
                tracing::error!(
                    category,
                    component = %component,
                    operation = %operation,
                    metadata = ?metadata,
                    "Error occurred: {}",
                    error
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    category,
                    component = %component,
                    operation = %operation,
                    metadata = ?metadata,
                    "Warning: {}",
                    error
                );
            }
            ErrorSeverity::Info => {
                tracing::info!(
                    category,
                    component = %component,
                    operation = %operation,
                    "Info: {}",
                    error
                );
            }
        }
    }
}

/// Macro for easy structured error logging
#[macro_export]
macro_rules! log_structured_error {
    ($error:expr, $component:expr, $operation:expr) => {
        $crate::error::ErrorReporter::log_error(
            &$error,
            Some($crate::error::ErrorContext::new($component, $operation)),
        )
    };
    ($error:expr, $component:expr, $operation:expr, $($key:literal => $value:expr),+) => {
        $crate::error::ErrorReporter::log_error(
            &$error,
            Some(
                $crate::error::ErrorContext::new($component, $operation)
                    $(.with_metadata($key, $value))+,
            ),
        )
    };
}

impl From<regex::Error> for EngineError {
    fn from(err: regex::Error) -> Self {
        EngineError::InvalidInput(format!("Regex pattern error: {err}"))
    }
}

impl From<notify::Error> for EngineError {
    fn from(err: notify::Error) -> Self {
        EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
    }
}

impl From<ipnetwork::IpNetworkError> for EngineError {
    fn from(err: ipnetwork::IpNetworkError) -> Self {
        EngineError::InvalidInput(format!("Invalid network range: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_and_retry_classification() {
        let err = EngineError::timeout("mdns took too long");
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert!(err.is_retryable());
        assert_eq!(err.category(), "timeout");

        let err = EngineError::config("max_concurrent_jobs must be > 0");
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_display_includes_message() {
        let err = EngineError::plugin_load("Circular dependency detected: a -> b -> a");
        assert_eq!(
            err.to_string(),
            "Plugin load error: Circular dependency detected: a -> b -> a"
        );
    }

    #[test]
    fn test_context_metadata() {
        let ctx = ErrorContext::new("scheduler", "execute_job").with_metadata("job_id", "42");
        assert_eq!(ctx.component, "scheduler");
        assert_eq!(ctx.metadata.get("job_id"), Some(&serde_json::json!("42")));
    }

    #[test]
    fn test_log_macro_compiles_with_metadata() {
        let err = EngineError::protocol("truncated SSDP header");
        log_structured_error!(err, "ssdp", "parse_response", "bytes" => 12);
    }
}
