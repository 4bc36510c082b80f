//! Recovery engine
//!
//! Walks a node's ordered recovery actions under its retry policy.
//! Each action gets up to `max_attempts` tries with exponential backoff
//! between attempts; the first verified success short-circuits the walk.
//! Every attempt is recorded in a bounded per-node history.

use crate::actions::{ActionRegistry, DEFAULT_ACTION_TIMEOUT};
use crate::monitoring::{FailureEvent, HealthState, MonitoringService};
use crate::shutdown::ShutdownSignal;
use crate::utils::config::{NodeConfig, RetryPolicy};
use crate::utils::error::{SentinelError, SentinelResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Per-node recovery history bound (FIFO drop beyond this).
pub const RECOVERY_HISTORY_LIMIT: usize = 50;

/// Record of one recovery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub node_id: String,
    pub action_name: String,
    pub command_executed: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "crate::utils::serde_duration")]
    pub duration: Duration,
    pub success: bool,
}

/// Terminal outcome of one recovery run
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    Succeeded(RecoveryResult),
    Exhausted(Vec<RecoveryResult>),
    AlreadyInProgress,
}

/// Emitted when a recovery run succeeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub node_id: String,
    pub failure_event: FailureEvent,
    pub recovery_result: RecoveryResult,
    pub completed_at: DateTime<Utc>,
}

/// Progress snapshot for an in-flight recovery run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRecovery {
    pub node_id: String,
    pub current_action: String,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
}

/// Callback invoked with `(node_id, history)` when a run exhausts all actions
pub type EscalationCallback =
    Arc<dyn Fn(String, Vec<RecoveryResult>) -> BoxFuture<'static, ()> + Send + Sync>;
/// Callback invoked when a run succeeds
pub type RecoverySuccessCallback =
    Arc<dyn Fn(RecoveryEvent) -> BoxFuture<'static, ()> + Send + Sync>;

enum RunResult {
    Succeeded(RecoveryResult),
    Exhausted(Vec<RecoveryResult>),
}

/// The recovery engine
#[derive(Clone)]
pub struct RecoveryEngine {
    actions: ActionRegistry,
    default_policy: RetryPolicy,
    action_timeout: Duration,
    shutdown: ShutdownSignal,
    in_flight: Arc<DashMap<String, ActiveRecovery>>,
    history: Arc<DashMap<String, VecDeque<RecoveryResult>>>,
    /// Post-action verifier; when present, an attempt only counts as
    /// successful if an immediate probe cycle reports the node healthy.
    verifier: Arc<RwLock<Option<MonitoringService>>>,
    escalation_callbacks: Arc<RwLock<Vec<EscalationCallback>>>,
    success_callbacks: Arc<RwLock<Vec<RecoverySuccessCallback>>>,
}

impl RecoveryEngine {
    #[must_use]
    pub fn new(actions: ActionRegistry, default_policy: RetryPolicy, shutdown: ShutdownSignal) -> Self {
        Self {
            actions,
            default_policy,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            shutdown,
            in_flight: Arc::new(DashMap::new()),
            history: Arc::new(DashMap::new()),
            verifier: Arc::new(RwLock::new(None)),
            escalation_callbacks: Arc::new(RwLock::new(Vec::new())),
            success_callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Wire the monitoring service as the post-action health verifier.
    pub async fn set_health_verifier(&self, monitoring: MonitoringService) {
        *self.verifier.write().await = Some(monitoring);
    }

    /// Register an additional recovery action capability.
    pub async fn register_action(&self, action: Arc<dyn crate::actions::RecoveryAction>) {
        self.actions.register(action).await;
    }

    pub async fn register_escalation_callback(&self, callback: EscalationCallback) {
        self.escalation_callbacks.write().await.push(callback);
    }

    pub async fn register_recovery_callback(&self, callback: RecoverySuccessCallback) {
        self.success_callbacks.write().await.push(callback);
    }

    /// Execute a recovery run for an unhealthy node.
    ///
    /// At most one run per node is in flight at any instant; a second
    /// concurrent call returns `AlreadyInProgress` immediately without
    /// queueing. Cancellation during a backoff sleep aborts the run with
    /// `OperationCancelled`; no callbacks fire for an aborted run.
    pub async fn execute_recovery(
        &self,
        node: &NodeConfig,
        failure: &FailureEvent,
    ) -> SentinelResult<RecoveryOutcome> {
        use dashmap::mapref::entry::Entry;
        match self.in_flight.entry(node.node_id.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(
                    "Recovery already in progress for node {}, ignoring",
                    node.node_id
                );
                return Ok(RecoveryOutcome::AlreadyInProgress);
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveRecovery {
                    node_id: node.node_id.clone(),
                    current_action: String::new(),
                    attempt_count: 0,
                    started_at: Utc::now(),
                });
            }
        }

        let run = self.run_actions(node).await;
        self.in_flight.remove(&node.node_id);

        match run {
            Ok(RunResult::Succeeded(result)) => {
                let event = RecoveryEvent {
                    node_id: node.node_id.clone(),
                    failure_event: failure.clone(),
                    recovery_result: result.clone(),
                    completed_at: Utc::now(),
                };
                let callbacks: Vec<RecoverySuccessCallback> =
                    self.success_callbacks.read().await.clone();
                for callback in callbacks {
                    callback(event.clone()).await;
                }
                Ok(RecoveryOutcome::Succeeded(result))
            }
            Ok(RunResult::Exhausted(results)) => {
                tracing::error!(
                    "Recovery exhausted for node {} after {} attempts",
                    node.node_id,
                    results.len()
                );
                let callbacks: Vec<EscalationCallback> =
                    self.escalation_callbacks.read().await.clone();
                for callback in callbacks {
                    callback(node.node_id.clone(), results.clone()).await;
                }
                Ok(RecoveryOutcome::Exhausted(results))
            }
            Err(e) => Err(e),
        }
    }

    async fn run_actions(&self, node: &NodeConfig) -> SentinelResult<RunResult> {
        let policy = node
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_policy.clone());
        let mut all_results: Vec<RecoveryResult> = Vec::new();
        let mut total_attempts = 0u32;

        for action_name in &node.recovery_actions {
            let Some(action) = self.actions.get(action_name).await else {
                tracing::warn!(
                    "Skipping unknown recovery action '{action_name}' for node {}",
                    node.node_id
                );
                continue;
            };

            for attempt in 1..=policy.max_attempts {
                let delay = policy.delay_for_attempt(attempt);
                if !delay.is_zero() && !self.shutdown.sleep(delay).await {
                    return Err(SentinelError::OperationCancelled {
                        operation: format!("recovery of node {}", node.node_id),
                    });
                }

                total_attempts += 1;
                if let Some(mut progress) = self.in_flight.get_mut(&node.node_id) {
                    progress.current_action = action_name.clone();
                    progress.attempt_count = total_attempts;
                }

                tracing::info!(
                    "Recovery attempt {attempt}/{} with action '{action_name}' for node {}",
                    policy.max_attempts,
                    node.node_id
                );
                let result = self.run_single_attempt(node, action_name, &*action).await;
                self.record_result(result.clone());
                let success = result.success;
                all_results.push(result.clone());

                if success {
                    tracing::info!(
                        "Recovery of node {} succeeded with action '{action_name}'",
                        node.node_id
                    );
                    return Ok(RunResult::Succeeded(result));
                }
            }
            // Policy resets for the next action in the list.
        }

        Ok(RunResult::Exhausted(all_results))
    }

    async fn run_single_attempt(
        &self,
        node: &NodeConfig,
        action_name: &str,
        action: &dyn crate::actions::RecoveryAction,
    ) -> RecoveryResult {
        let started_at = Utc::now();
        let mut result = match action.execute(node, self.action_timeout).await {
            Ok(outcome) => RecoveryResult {
                node_id: node.node_id.clone(),
                action_name: action_name.to_string(),
                command_executed: outcome.command_executed,
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                started_at,
                duration: outcome.duration,
                success: outcome.exit_code == 0,
            },
            Err(e) => RecoveryResult {
                node_id: node.node_id.clone(),
                action_name: action_name.to_string(),
                command_executed: String::new(),
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
                started_at,
                duration: Duration::ZERO,
                success: false,
            },
        };

        // An exit code of 0 is not enough: the node must actually probe
        // healthy again before the attempt counts as a success.
        if result.success {
            let verifier = self.verifier.read().await.clone();
            if let Some(monitoring) = verifier {
                match monitoring.probe_node_once(&node.node_id).await {
                    Ok(HealthState::Healthy) => {}
                    Ok(state) => {
                        tracing::warn!(
                            "Action '{action_name}' exited 0 but node {} still probes {state:?}",
                            node.node_id
                        );
                        result.success = false;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Post-action verification failed for node {}: {e}",
                            node.node_id
                        );
                        result.success = false;
                    }
                }
            }
        }

        result
    }

    fn record_result(&self, result: RecoveryResult) {
        let mut history = self.history.entry(result.node_id.clone()).or_default();
        history.push_back(result);
        while history.len() > RECOVERY_HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Recovery attempts recorded for a node, oldest first.
    #[must_use]
    pub fn get_recovery_history(&self, node_id: &str) -> Vec<RecoveryResult> {
        self.history
            .get(node_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Progress of currently running recoveries, keyed by node id.
    #[must_use]
    pub fn get_active_recoveries(&self) -> HashMap<String, ActiveRecovery> {
        self.in_flight
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Trim every node's history to at most `max_entries`, dropping the
    /// oldest records. Used by the supervisor under memory pressure.
    pub fn trim_histories(&self, max_entries: usize) {
        for mut entry in self.history.iter_mut() {
            while entry.len() > max_entries {
                entry.pop_front();
            }
        }
    }

    pub async fn registered_action_count(&self) -> usize {
        self.actions.len().await
    }
}
