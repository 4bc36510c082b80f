//! Configuration model for the supervisor
//!
//! The cluster topology, retry policies, notification transport and
//! logging settings are loaded once at startup, validated, and frozen.
//! Runtime back-pressure never mutates this structure; the monitoring
//! service owns an atomic cell holding the *current* probe interval.

use crate::utils::error::{SentinelError, SentinelResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration files searched in the working directory, in order.
const DEFAULT_CONFIG_FILES: [&str; 4] = ["config.yaml", "config.yml", "config.json", "config.ini"];

/// Kind of cluster node being supervised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    KafkaBroker,
    Zookeeper,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::KafkaBroker => write!(f, "kafka_broker"),
            NodeType::Zookeeper => write!(f, "zookeeper"),
        }
    }
}

/// Retry policy for recovery actions and notification delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_seconds: 5,
            backoff_multiplier: 2.0,
            max_delay_seconds: 60,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before attempt `attempt` (1-indexed). The first
    /// attempt runs immediately; attempt k > 1 waits
    /// `min(initial * multiplier^(k-1), max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let initial = self.initial_delay_seconds as f64;
        let factor = self.backoff_multiplier.powi((attempt - 1) as i32);
        let delay = (initial * factor).min(self.max_delay_seconds as f64);
        Duration::from_secs_f64(delay.max(0.0))
    }

    fn validate(&self, scope: &str) -> SentinelResult<()> {
        if self.max_attempts == 0 {
            return Err(SentinelError::Validation {
                field: format!("{scope}.max_attempts"),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.backoff_multiplier < 1.0 {
            return Err(SentinelError::Validation {
                field: format!("{scope}.backoff_multiplier"),
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.max_delay_seconds < self.initial_delay_seconds {
            return Err(SentinelError::Validation {
                field: format!("{scope}.max_delay_seconds"),
                reason: "must be >= initial_delay_seconds".to_string(),
            });
        }
        Ok(())
    }
}

/// A single Kafka broker or ZooKeeper node under supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub node_type: NodeType,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub jmx_port: Option<u16>,
    pub monitoring_methods: Vec<String>,
    pub recovery_actions: Vec<String>,
    /// Command template for the `shell` recovery action, with
    /// `{node_id}`, `{host}`, `{port}` and `{node_type}` placeholders.
    #[serde(default)]
    pub shell_command: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl NodeConfig {
    /// Address used by TCP-level probes.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cluster topology and monitoring cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub monitoring_interval_seconds: u64,
    pub default_retry_policy: RetryPolicy,
    pub nodes: Vec<NodeConfig>,
}

impl ClusterConfig {
    #[must_use]
    pub fn get_node(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    #[must_use]
    pub fn kafka_brokers(&self) -> Vec<&NodeConfig> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::KafkaBroker)
            .collect()
    }

    #[must_use]
    pub fn zookeeper_nodes(&self) -> Vec<&NodeConfig> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Zookeeper)
            .collect()
    }

    /// Effective retry policy for a node (per-node override or cluster default).
    #[must_use]
    pub fn retry_policy_for(&self, node: &NodeConfig) -> RetryPolicy {
        node.retry_policy
            .clone()
            .unwrap_or_else(|| self.default_retry_policy.clone())
    }

    #[must_use]
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_seconds)
    }
}

/// SMTP transport settings for operator notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub sender_email: String,
    pub recipients: Vec<String>,
    pub subject_prefix: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Log sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
    #[serde(default)]
    pub compress_backups: bool,
    #[serde(default = "default_console_logging")]
    pub console_logging: bool,
    #[serde(default)]
    pub structured_format: bool,
}

fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_file_size_mb() -> u64 {
    100
}
fn default_backup_count() -> u32 {
    5
}
fn default_console_logging() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            max_file_size_mb: default_max_file_size_mb(),
            backup_count: default_backup_count(),
            compress_backups: false,
            console_logging: default_console_logging(),
            structured_format: false,
        }
    }
}

/// Root configuration for the supervisor process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    pub cluster: ClusterConfig,
    pub notification: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SentinelConfig {
    /// Load configuration from an explicit path or by discovery in the
    /// working directory (`config.yaml`, `.yml`, `.json`, `.ini` in that
    /// order).
    pub fn load(path: Option<&Path>) -> SentinelResult<Self> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(SentinelError::ConfigurationFileNotFound {
                        path: p.display().to_string(),
                    });
                }
                p.to_path_buf()
            }
            None => Self::discover_config_file()?,
        };

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config: Self = match extension.as_str() {
            "yaml" | "yml" => {
                let content = std::fs::read_to_string(&path)?;
                serde_yaml::from_str(&content)?
            }
            "json" => {
                let content = std::fs::read_to_string(&path)?;
                serde_json::from_str(&content)?
            }
            "ini" => config::Config::builder()
                .add_source(config::File::from(path.as_path()).format(config::FileFormat::Ini))
                .build()?
                .try_deserialize()?,
            other => {
                return Err(SentinelError::Configuration {
                    reason: format!("unsupported configuration format: .{other}"),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn discover_config_file() -> SentinelResult<PathBuf> {
        for candidate in DEFAULT_CONFIG_FILES {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(SentinelError::Configuration {
            reason: "no configuration file found; provide one with --config or place \
                     config.yaml|yml|json|ini in the working directory"
                .to_string(),
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> SentinelResult<()> {
        if self.cluster.cluster_name.is_empty() {
            return Err(SentinelError::Validation {
                field: "cluster.cluster_name".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }
        if self.cluster.monitoring_interval_seconds == 0 {
            return Err(SentinelError::Validation {
                field: "cluster.monitoring_interval_seconds".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.cluster.nodes.is_empty() {
            return Err(SentinelError::Validation {
                field: "cluster.nodes".to_string(),
                reason: "at least one node is required".to_string(),
            });
        }

        self.cluster
            .default_retry_policy
            .validate("cluster.default_retry_policy")?;

        let mut seen_ids = HashSet::new();
        for node in &self.cluster.nodes {
            if node.node_id.is_empty() {
                return Err(SentinelError::Validation {
                    field: "node.node_id".to_string(),
                    reason: "cannot be empty".to_string(),
                });
            }
            if !seen_ids.insert(node.node_id.as_str()) {
                return Err(SentinelError::Validation {
                    field: "cluster.nodes".to_string(),
                    reason: format!("duplicate node_id: {}", node.node_id),
                });
            }
            if node.host.is_empty() {
                return Err(SentinelError::Validation {
                    field: format!("node.{}.host", node.node_id),
                    reason: "cannot be empty".to_string(),
                });
            }
            if node.port == 0 {
                return Err(SentinelError::Validation {
                    field: format!("node.{}.port", node.node_id),
                    reason: "cannot be 0".to_string(),
                });
            }
            if node.monitoring_methods.is_empty() {
                return Err(SentinelError::Validation {
                    field: format!("node.{}.monitoring_methods", node.node_id),
                    reason: "at least one monitoring method is required".to_string(),
                });
            }
            if node.recovery_actions.iter().any(|a| a == "shell") && node.shell_command.is_none() {
                return Err(SentinelError::Validation {
                    field: format!("node.{}.shell_command", node.node_id),
                    reason: "required when recovery_actions includes 'shell'".to_string(),
                });
            }
            if let Some(policy) = &node.retry_policy {
                policy.validate(&format!("node.{}.retry_policy", node.node_id))?;
            }
        }

        if self.notification.recipients.is_empty() {
            return Err(SentinelError::Validation {
                field: "notification.recipients".to_string(),
                reason: "at least one recipient is required".to_string(),
            });
        }
        if !self.notification.sender_email.contains('@') {
            return Err(SentinelError::Validation {
                field: "notification.sender_email".to_string(),
                reason: "must be an email address".to_string(),
            });
        }

        Ok(())
    }

    /// Cross-check every probe and action name referenced by the node
    /// configs against the registered capability names. Unknown names are
    /// configuration errors at load time, not at first use.
    pub fn validate_against_registries(
        &self,
        probe_names: &HashSet<String>,
        action_names: &HashSet<String>,
    ) -> SentinelResult<()> {
        for node in &self.cluster.nodes {
            for method in &node.monitoring_methods {
                if !probe_names.contains(method) {
                    return Err(SentinelError::Validation {
                        field: format!("node.{}.monitoring_methods", node.node_id),
                        reason: format!("unknown probe: {method}"),
                    });
                }
            }
            for action in &node.recovery_actions {
                if !action_names.contains(action) {
                    return Err(SentinelError::Validation {
                        field: format!("node.{}.recovery_actions", node.node_id),
                        reason: format!("unknown action: {action}"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_yaml() -> &'static str {
        r#"
cluster:
  cluster_name: "test-cluster"
  monitoring_interval_seconds: 10
  default_retry_policy:
    max_attempts: 3
    initial_delay_seconds: 1
    backoff_multiplier: 2.0
    max_delay_seconds: 30
  nodes:
    - node_id: "kafka-1"
      node_type: "kafka_broker"
      host: "localhost"
      port: 9092
      jmx_port: 9999
      monitoring_methods: ["socket"]
      recovery_actions: ["service_restart"]
    - node_id: "zk-1"
      node_type: "zookeeper"
      host: "localhost"
      port: 2181
      monitoring_methods: ["zookeeper"]
      recovery_actions: ["service_restart"]

notification:
  smtp_host: "localhost"
  smtp_port: 587
  smtp_username: "sentinel"
  smtp_password: "secret"
  sender_email: "sentinel@example.com"
  recipients: ["ops@example.com"]
  subject_prefix: "[sentinel]"
"#
    }

    #[test]
    fn loads_yaml_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(sample_yaml().as_bytes()).unwrap();

        let config = SentinelConfig::load(Some(&path)).unwrap();
        assert_eq!(config.cluster.cluster_name, "test-cluster");
        assert_eq!(config.cluster.nodes.len(), 2);
        assert_eq!(config.cluster.kafka_brokers().len(), 1);
        assert_eq!(config.cluster.zookeeper_nodes().len(), 1);
        assert_eq!(config.cluster.nodes[0].jmx_port, Some(9999));
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = SentinelConfig::load(Some(Path::new("/nonexistent/config.yaml"))).unwrap_err();
        assert!(matches!(
            err,
            SentinelError::ConfigurationFileNotFound { .. }
        ));
    }

    #[test]
    fn duplicate_node_ids_rejected() {
        let yaml = sample_yaml().replace("zk-1", "kafka-1");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        let err = SentinelConfig::load(Some(&path)).unwrap_err();
        match err {
            SentinelError::Validation { reason, .. } => {
                assert!(reason.contains("duplicate node_id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_interval_rejected() {
        let yaml = sample_yaml().replace(
            "monitoring_interval_seconds: 10",
            "monitoring_interval_seconds: 0",
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        assert!(SentinelConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn backoff_delays_follow_policy() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_seconds: 2,
            backoff_multiplier: 2.0,
            max_delay_seconds: 10,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        // Capped at max_delay_seconds
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn unknown_capability_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, sample_yaml()).unwrap();
        let config = SentinelConfig::load(Some(&path)).unwrap();

        let probes: HashSet<String> = ["socket".to_string()].into_iter().collect();
        let actions: HashSet<String> = ["service_restart".to_string()].into_iter().collect();
        // zk-1 references the "zookeeper" probe which is not registered
        let err = config
            .validate_against_registries(&probes, &actions)
            .unwrap_err();
        match err {
            SentinelError::Validation { reason, .. } => {
                assert!(reason.contains("unknown probe: zookeeper"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shell_action_requires_a_shell_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = sample_yaml().replace(
            "      recovery_actions: [\"service_restart\"]\n    - node_id: \"zk-1\"",
            "      recovery_actions: [\"shell\"]\n    - node_id: \"zk-1\"",
        );
        std::fs::write(&path, &yaml).unwrap();

        let err = SentinelConfig::load(Some(&path)).unwrap_err();
        match err {
            SentinelError::Validation { field, reason } => {
                assert_eq!(field, "node.kafka-1.shell_command");
                assert!(reason.contains("shell"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // With a template configured, the same config is accepted.
        let yaml = yaml.replace(
            "      recovery_actions: [\"shell\"]",
            "      shell_command: \"systemctl restart kafka\"\n      recovery_actions: [\"shell\"]",
        );
        std::fs::write(&path, yaml).unwrap();
        let config = SentinelConfig::load(Some(&path)).unwrap();
        let node = config.cluster.get_node("kafka-1").unwrap();
        assert_eq!(
            node.shell_command.as_deref(),
            Some("systemctl restart kafka")
        );
    }

    #[test]
    fn per_node_policy_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = sample_yaml().replace(
            "      monitoring_methods: [\"zookeeper\"]",
            "      retry_policy:\n        max_attempts: 7\n        initial_delay_seconds: 1\n        backoff_multiplier: 1.5\n        max_delay_seconds: 5\n      monitoring_methods: [\"zookeeper\"]",
        );
        std::fs::write(&path, yaml).unwrap();
        let config = SentinelConfig::load(Some(&path)).unwrap();

        let kafka = config.cluster.get_node("kafka-1").unwrap();
        let zk = config.cluster.get_node("zk-1").unwrap();
        assert_eq!(config.cluster.retry_policy_for(kafka).max_attempts, 3);
        assert_eq!(config.cluster.retry_policy_for(zk).max_attempts, 7);
    }
}
