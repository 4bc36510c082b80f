//! Operator-defined shell command action

use super::{run_command, ActionOutcome, RecoveryAction};
use crate::utils::config::NodeConfig;
use crate::utils::error::{SentinelError, SentinelResult};
use async_trait::async_trait;
use std::time::Duration;

/// Runs an operator-defined shell command with per-node placeholder
/// substitution: `{node_id}`, `{host}`, `{port}` and `{node_type}`.
///
/// The built-in registration (named `shell`) takes its template from
/// the node's `shell_command`; configuration validation requires that
/// field on any node listing `shell` among its recovery actions. A
/// fixed template can be supplied instead for custom registrations.
#[derive(Debug, Clone)]
pub struct ShellCommandAction {
    name: String,
    command_template: Option<String>,
}

impl Default for ShellCommandAction {
    fn default() -> Self {
        Self {
            name: "shell".to_string(),
            command_template: None,
        }
    }
}

impl ShellCommandAction {
    #[must_use]
    pub fn new(name: impl Into<String>, command_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_template: Some(command_template.into()),
        }
    }

    fn resolve_template(&self, node: &NodeConfig) -> SentinelResult<String> {
        if let Some(template) = &self.command_template {
            return Ok(template.clone());
        }
        node.shell_command
            .clone()
            .ok_or_else(|| SentinelError::ActionLaunchFailed {
                action: self.name.clone(),
                node_id: node.node_id.clone(),
                reason: "node has no shell_command configured".to_string(),
            })
    }

    fn render(template: &str, node: &NodeConfig) -> String {
        template
            .replace("{node_id}", &node.node_id)
            .replace("{host}", &node.host)
            .replace("{port}", &node.port.to_string())
            .replace("{node_type}", &node.node_type.to_string())
    }
}

#[async_trait]
impl RecoveryAction for ShellCommandAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, node: &NodeConfig, timeout: Duration) -> SentinelResult<ActionOutcome> {
        let template = self.resolve_template(node)?;
        let command = Self::render(&template, node);
        tracing::debug!(
            "Executing shell action '{}' for node {}: {command}",
            self.name,
            node.node_id
        );
        run_command(
            "sh",
            &["-c".to_string(), command],
            timeout,
            &self.name,
            &node.node_id,
        )
        .await
    }
}
