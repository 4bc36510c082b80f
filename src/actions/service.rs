//! systemd service restart action

use super::{run_command, ActionOutcome, RecoveryAction};
use crate::utils::config::{NodeConfig, NodeType};
use crate::utils::error::SentinelResult;
use async_trait::async_trait;
use std::time::Duration;

/// Restarts the node's service unit via `systemctl restart`.
/// Unit names default to `kafka` and `zookeeper` per node type.
#[derive(Debug, Clone)]
pub struct ServiceRestartAction {
    kafka_unit: String,
    zookeeper_unit: String,
}

impl Default for ServiceRestartAction {
    fn default() -> Self {
        Self {
            kafka_unit: "kafka".to_string(),
            zookeeper_unit: "zookeeper".to_string(),
        }
    }
}

impl ServiceRestartAction {
    #[must_use]
    pub fn with_units(kafka_unit: impl Into<String>, zookeeper_unit: impl Into<String>) -> Self {
        Self {
            kafka_unit: kafka_unit.into(),
            zookeeper_unit: zookeeper_unit.into(),
        }
    }

    fn unit_for(&self, node: &NodeConfig) -> &str {
        match node.node_type {
            NodeType::KafkaBroker => &self.kafka_unit,
            NodeType::Zookeeper => &self.zookeeper_unit,
        }
    }
}

#[async_trait]
impl RecoveryAction for ServiceRestartAction {
    fn name(&self) -> &str {
        "service_restart"
    }

    async fn execute(&self, node: &NodeConfig, timeout: Duration) -> SentinelResult<ActionOutcome> {
        let unit = self.unit_for(node).to_string();
        tracing::info!(
            "Restarting service unit '{unit}' for node {}",
            node.node_id
        );
        run_command(
            "systemctl",
            &["restart".to_string(), unit],
            timeout,
            self.name(),
            &node.node_id,
        )
        .await
    }
}
