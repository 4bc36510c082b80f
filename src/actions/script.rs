//! Operator-provided recovery script action

use super::{run_command, ActionOutcome, RecoveryAction};
use crate::utils::config::NodeConfig;
use crate::utils::error::{SentinelError, SentinelResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Executes `recover_<node_type>.sh` from a scripts directory, passing
/// the node id, host and port as arguments.
#[derive(Debug, Clone)]
pub struct ScriptAction {
    scripts_dir: PathBuf,
}

impl Default for ScriptAction {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("scripts"),
        }
    }
}

impl ScriptAction {
    #[must_use]
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    fn script_path(&self, node: &NodeConfig) -> PathBuf {
        self.scripts_dir
            .join(format!("recover_{}.sh", node.node_type))
    }
}

#[async_trait]
impl RecoveryAction for ScriptAction {
    fn name(&self) -> &str {
        "script"
    }

    async fn execute(&self, node: &NodeConfig, timeout: Duration) -> SentinelResult<ActionOutcome> {
        let path = self.script_path(node);
        if !path.exists() {
            return Err(SentinelError::ActionLaunchFailed {
                action: self.name().to_string(),
                node_id: node.node_id.clone(),
                reason: format!("recovery script not found: {}", path.display()),
            });
        }

        let args = vec![
            node.node_id.clone(),
            node.host.clone(),
            node.port.to_string(),
        ];
        run_command(
            &path.display().to_string(),
            &args,
            timeout,
            self.name(),
            &node.node_id,
        )
        .await
    }
}
