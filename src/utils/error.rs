use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Custom error types for the self-healing supervisor
///
/// Covers the full error taxonomy of the system: configuration problems
/// (fatal at startup), probe and action failures (local, converted to
/// health/attempt records), notifier failures (retried or dropped), and
/// internal errors (counted by the supervisor's error reporter).
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum SentinelError {
    /// Configuration errors
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Configuration file not found: {path}")]
    ConfigurationFileNotFound { path: String },

    #[error("Invalid configuration value: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// Probe errors
    #[error("Probe '{probe}' failed for node {node_id}: {reason}")]
    ProbeFailed {
        probe: String,
        node_id: String,
        reason: String,
    },

    #[error("Probe '{probe}' timed out for node {node_id} after {timeout_ms}ms")]
    ProbeTimeout {
        probe: String,
        node_id: String,
        timeout_ms: u64,
    },

    #[error("Probe not registered: {probe}")]
    ProbeNotRegistered { probe: String },

    /// Recovery action errors
    #[error("Action '{action}' failed to launch for node {node_id}: {reason}")]
    ActionLaunchFailed {
        action: String,
        node_id: String,
        reason: String,
    },

    #[error("Action '{action}' timed out for node {node_id} after {timeout_ms}ms")]
    ActionTimeout {
        action: String,
        node_id: String,
        timeout_ms: u64,
    },

    #[error("Action not registered: {action}")]
    ActionNotRegistered { action: String },

    /// Notification errors
    #[error("Notifier '{notifier}' delivery failed: {reason}")]
    NotificationFailed { notifier: String, reason: String },

    #[error("Notification queue closed")]
    NotificationQueueClosed,

    /// Lifecycle errors
    #[error("System is already running")]
    AlreadyRunning,

    #[error("System is not running")]
    NotRunning,

    #[error("Operation cancelled: {operation}")]
    OperationCancelled { operation: String },

    #[error("Graceful shutdown timeout: {component} after {timeout_ms}ms")]
    ShutdownTimeout { component: String, timeout_ms: u64 },

    /// IO and system errors
    #[error("IO error: {reason}")]
    Io { reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Result type alias for the supervisor
pub type SentinelResult<T> = Result<T, SentinelError>;

impl From<std::io::Error> for SentinelError {
    fn from(err: std::io::Error) -> Self {
        SentinelError::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SentinelError {
    fn from(err: serde_json::Error) -> Self {
        SentinelError::Configuration {
            reason: format!("JSON parse failure: {err}"),
        }
    }
}

impl From<serde_yaml::Error> for SentinelError {
    fn from(err: serde_yaml::Error) -> Self {
        SentinelError::Configuration {
            reason: format!("YAML parse failure: {err}"),
        }
    }
}

impl From<config::ConfigError> for SentinelError {
    fn from(err: config::ConfigError) -> Self {
        SentinelError::Configuration {
            reason: err.to_string(),
        }
    }
}

impl SentinelError {
    /// Whether this error is fatal at startup (exit code 1) as opposed to
    /// a local failure the running system absorbs.
    #[must_use]
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            SentinelError::Configuration { .. }
                | SentinelError::ConfigurationFileNotFound { .. }
                | SentinelError::Validation { .. }
        )
    }
}

/// Helper trait for attaching operation context to foreign errors
pub trait ResultExt<T> {
    fn with_context(self, operation: &str, component: &str) -> SentinelResult<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn with_context(self, operation: &str, component: &str) -> SentinelResult<T> {
        self.map_err(|e| SentinelError::Internal {
            reason: format!("{operation} in {component}: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_fatality_classification() {
        let config_err = SentinelError::Configuration {
            reason: "missing cluster section".to_string(),
        };
        assert!(config_err.is_fatal_at_startup());

        let probe_err = SentinelError::ProbeTimeout {
            probe: "socket".to_string(),
            node_id: "kafka-1".to_string(),
            timeout_ms: 5000,
        };
        assert!(!probe_err.is_fatal_at_startup());
    }

    #[test]
    fn context_helper_wraps_foreign_errors() {
        let result: Result<(), std::fmt::Error> = Err(std::fmt::Error);
        let wrapped = result.with_context("formatting", "notification");
        match wrapped {
            Err(SentinelError::Internal { reason }) => {
                assert!(reason.contains("formatting in notification"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
