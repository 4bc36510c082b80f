//! Recovery-action capabilities
//!
//! An action is a named capability that attempts to restore a node and
//! reports the executed command, exit code, captured output and wall
//! time. Actions are looked up by the names listed in each node's
//! `recovery_actions`.

use crate::utils::config::NodeConfig;
use crate::utils::error::{SentinelError, SentinelResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::RwLock;

mod script;
mod service;
mod shell;

pub use script::ScriptAction;
pub use service::ServiceRestartAction;
pub use shell::ShellCommandAction;

/// Default per-action timeout applied by the recovery engine.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured result of one action execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "crate::utils::serde_duration")]
    pub duration: Duration,
    pub command_executed: String,
}

impl ActionOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// A named recovery capability
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, node: &NodeConfig, timeout: Duration) -> SentinelResult<ActionOutcome>;
}

/// Spawn a process, wait for it within the timeout, and capture its
/// output. Shared by the built-in actions.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
    action: &str,
    node_id: &str,
) -> SentinelResult<ActionOutcome> {
    let command_executed = if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    };

    let started = Instant::now();
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SentinelError::ActionLaunchFailed {
            action: action.to_string(),
            node_id: node_id.to_string(),
            reason: e.to_string(),
        })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| SentinelError::ActionTimeout {
            action: action.to_string(),
            node_id: node_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| SentinelError::ActionLaunchFailed {
            action: action.to_string(),
            node_id: node_id.to_string(),
            reason: e.to_string(),
        })?;

    Ok(ActionOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration: started.elapsed(),
        command_executed,
    })
}

/// Registry of recovery-action capabilities keyed by name
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<RwLock<HashMap<String, Arc<dyn RecoveryAction>>>>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in actions
    /// (`service_restart`, `script`, `shell`).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut actions: HashMap<String, Arc<dyn RecoveryAction>> = HashMap::new();
        let restart = Arc::new(ServiceRestartAction::default());
        let script = Arc::new(ScriptAction::default());
        let shell = Arc::new(ShellCommandAction::default());
        actions.insert(restart.name().to_string(), restart);
        actions.insert(script.name().to_string(), script);
        actions.insert(shell.name().to_string(), shell);
        Self {
            actions: Arc::new(RwLock::new(actions)),
        }
    }

    /// Register an additional action capability. Replaces any existing
    /// action with the same name.
    pub async fn register(&self, action: Arc<dyn RecoveryAction>) {
        let name = action.name().to_string();
        self.actions.write().await.insert(name.clone(), action);
        tracing::debug!("Registered recovery action '{name}'");
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn RecoveryAction>> {
        self.actions.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> HashSet<String> {
        self.actions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.actions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::NodeType;

    fn test_node() -> NodeConfig {
        NodeConfig {
            node_id: "kafka-1".to_string(),
            node_type: NodeType::KafkaBroker,
            host: "localhost".to_string(),
            port: 9092,
            jmx_port: None,
            monitoring_methods: vec!["socket".to_string()],
            recovery_actions: vec!["service_restart".to_string()],
            shell_command: None,
            retry_policy: None,
        }
    }

    #[tokio::test]
    async fn builtins_are_registered() {
        let registry = ActionRegistry::with_builtins();
        let names = registry.names().await;
        assert!(names.contains("service_restart"));
        assert!(names.contains("script"));
        assert!(names.contains("shell"));
    }

    #[tokio::test]
    async fn run_command_captures_output_and_exit_code() {
        let node = test_node();
        let outcome = run_command(
            "sh",
            &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            Duration::from_secs(5),
            "shell",
            &node.node_id,
        )
        .await
        .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let node = test_node();
        let err = run_command(
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
            "shell",
            &node.node_id,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SentinelError::ActionTimeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let node = test_node();
        let err = run_command(
            "definitely-not-a-real-program",
            &[],
            Duration::from_secs(1),
            "shell",
            &node.node_id,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SentinelError::ActionLaunchFailed { .. }));
    }
}
