//! Per-node health monitoring
//!
//! Runs one probe loop per configured node at the current monitoring
//! cadence. A cycle runs the node's monitoring methods in order; the
//! node is healthy iff all of them report healthy within their timeout.
//! State transitions are emitted through registered callbacks; only the
//! monitoring service mutates a node's `HealthState`.

use crate::probes::{ProbeRegistry, DEFAULT_PROBE_TIMEOUT};
use crate::utils::config::{ClusterConfig, NodeConfig};
use crate::utils::error::{SentinelError, SentinelResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long `stop()` waits for in-flight probe loops to drain.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Health state of a supervised node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Latest observed status for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub state: HealthState,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl NodeStatus {
    fn unknown(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            state: HealthState::Unknown,
            last_check_at: None,
            last_transition_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Emitted when a node transitions into the Unhealthy state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub event_id: Uuid,
    pub node_id: String,
    pub detected_at: DateTime<Utc>,
    pub probe_name: String,
    pub diagnostic: Option<String>,
}

/// Callback invoked on Healthy/Unknown -> Unhealthy transitions
pub type UnhealthyCallback = Arc<dyn Fn(FailureEvent) -> BoxFuture<'static, ()> + Send + Sync>;
/// Callback invoked on Unhealthy -> Healthy transitions
pub type HealthyCallback =
    Arc<dyn Fn(String, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Aggregate monitoring statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringStatistics {
    pub active: bool,
    pub interval_seconds: u64,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub unhealthy_nodes: usize,
    pub unknown_nodes: usize,
    pub total_cycles: u64,
    pub nodes: Vec<NodeStatus>,
}

/// Outcome of one full probe cycle for a node
enum CycleOutcome {
    Healthy,
    Unhealthy { probe_name: String, reason: String },
}

struct RunState {
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// The monitoring service: one logical probe loop per node
#[derive(Clone)]
pub struct MonitoringService {
    cluster: Arc<ClusterConfig>,
    probes: ProbeRegistry,
    statuses: Arc<DashMap<String, NodeStatus>>,
    /// Current probe cadence. Degraded-mode and high-CPU handling adjust
    /// this cell; the frozen `ClusterConfig` is never mutated.
    current_interval_secs: Arc<AtomicU64>,
    probe_timeout: Duration,
    drain_deadline: Duration,
    active: Arc<AtomicBool>,
    total_cycles: Arc<AtomicU64>,
    unhealthy_callbacks: Arc<RwLock<Vec<UnhealthyCallback>>>,
    healthy_callbacks: Arc<RwLock<Vec<HealthyCallback>>>,
    run: Arc<Mutex<Option<RunState>>>,
    missing_probe_flagged: Arc<DashMap<String, ()>>,
}

impl MonitoringService {
    #[must_use]
    pub fn new(cluster: Arc<ClusterConfig>, probes: ProbeRegistry) -> Self {
        let interval = cluster.monitoring_interval_seconds;
        Self {
            cluster,
            probes,
            statuses: Arc::new(DashMap::new()),
            current_interval_secs: Arc::new(AtomicU64::new(interval)),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
            active: Arc::new(AtomicBool::new(false)),
            total_cycles: Arc::new(AtomicU64::new(0)),
            unhealthy_callbacks: Arc::new(RwLock::new(Vec::new())),
            healthy_callbacks: Arc::new(RwLock::new(Vec::new())),
            run: Arc::new(Mutex::new(None)),
            missing_probe_flagged: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    /// Handle to the atomic cell holding the current probe interval.
    /// The supervisor adjusts this under back-pressure.
    #[must_use]
    pub fn interval_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current_interval_secs)
    }

    #[must_use]
    pub fn current_interval_seconds(&self) -> u64 {
        self.current_interval_secs.load(Ordering::Relaxed)
    }

    pub fn set_interval_seconds(&self, seconds: u64) {
        self.current_interval_secs
            .store(seconds.max(1), Ordering::Relaxed);
    }

    /// Register an additional probe capability at runtime.
    pub async fn add_probe(&self, probe: Arc<dyn crate::probes::Probe>) {
        self.probes.register(probe).await;
    }

    pub async fn register_on_unhealthy(&self, callback: UnhealthyCallback) {
        self.unhealthy_callbacks.write().await.push(callback);
    }

    pub async fn register_on_healthy(&self, callback: HealthyCallback) {
        self.healthy_callbacks.write().await.push(callback);
    }

    /// Start one probe loop per configured node. Idempotent.
    pub async fn start(&self) -> SentinelResult<()> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            tracing::debug!("Monitoring already active, start() is a no-op");
            return Ok(());
        }

        let (stop_tx, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.cluster.nodes.len());

        for node in &self.cluster.nodes {
            self.statuses
                .entry(node.node_id.clone())
                .or_insert_with(|| NodeStatus::unknown(&node.node_id));

            let service = self.clone();
            let node = node.clone();
            let stop_rx = stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                service.node_loop(node, stop_rx).await;
            }));
        }

        *run = Some(RunState { stop_tx, handles });
        self.active.store(true, Ordering::SeqCst);
        tracing::info!(
            "Monitoring started for {} nodes at {}s cadence",
            self.cluster.nodes.len(),
            self.current_interval_seconds()
        );
        Ok(())
    }

    /// Stop all probe loops, waiting up to the drain deadline for
    /// in-flight probes. Idempotent.
    pub async fn stop(&self) -> SentinelResult<()> {
        let run_state = self.run.lock().await.take();
        let Some(run_state) = run_state else {
            return Ok(());
        };

        self.active.store(false, Ordering::SeqCst);
        let _ = run_state.stop_tx.send(true);

        let drained = tokio::time::timeout(self.drain_deadline, join_all(run_state.handles)).await;
        if drained.is_err() {
            tracing::warn!(
                "Monitoring loops did not drain within {:?}; remaining results discarded",
                self.drain_deadline
            );
        }
        tracing::info!("Monitoring stopped");
        Ok(())
    }

    /// Whether probe loops are currently running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn node_loop(&self, node: NodeConfig, mut stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            self.run_probe_cycle(&node).await;

            let interval = Duration::from_secs(self.current_interval_seconds().max(1));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => break,
            }
        }
        tracing::debug!("Probe loop for node {} exited", node.node_id);
    }

    /// Run one probe cycle for every configured node in parallel.
    /// Used by single-shot diagnostics and tests.
    pub async fn check_all_nodes_once(&self) -> HashMap<String, HealthState> {
        let cycles = self.cluster.nodes.iter().map(|node| {
            let service = self.clone();
            async move {
                let state = service.run_probe_cycle(node).await;
                (node.node_id.clone(), state)
            }
        });
        join_all(cycles).await.into_iter().collect()
    }

    /// Run one immediate probe cycle for a single node. Used by the
    /// recovery engine's post-action verification.
    pub async fn probe_node_once(&self, node_id: &str) -> SentinelResult<HealthState> {
        let node = self
            .cluster
            .get_node(node_id)
            .ok_or_else(|| SentinelError::Internal {
                reason: format!("node not in cluster config: {node_id}"),
            })?
            .clone();
        Ok(self.run_probe_cycle(&node).await)
    }

    async fn run_probe_cycle(&self, node: &NodeConfig) -> HealthState {
        let outcome = self.evaluate_node(node).await;
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        self.apply_outcome(node, outcome).await
    }

    /// Run the node's monitoring methods in order; unhealthy on the
    /// first failing method.
    async fn evaluate_node(&self, node: &NodeConfig) -> CycleOutcome {
        for method in &node.monitoring_methods {
            let Some(probe) = self.probes.get(method).await else {
                if self
                    .missing_probe_flagged
                    .insert(format!("{}/{method}", node.node_id), ())
                    .is_none()
                {
                    tracing::error!(
                        "Node {} references unregistered probe '{method}'; \
                         node is unhealthy until configuration is fixed",
                        node.node_id
                    );
                }
                return CycleOutcome::Unhealthy {
                    probe_name: method.clone(),
                    reason: format!("probe not registered: {method}"),
                };
            };

            let outcome = probe.check(node, self.probe_timeout).await;
            if let Some(reason) = outcome.reason() {
                return CycleOutcome::Unhealthy {
                    probe_name: method.clone(),
                    reason: reason.to_string(),
                };
            }
        }
        CycleOutcome::Healthy
    }

    async fn apply_outcome(&self, node: &NodeConfig, outcome: CycleOutcome) -> HealthState {
        let now = Utc::now();
        let (previous, current, failure) = {
            let mut status = self
                .statuses
                .entry(node.node_id.clone())
                .or_insert_with(|| NodeStatus::unknown(&node.node_id));
            let previous = status.state;

            let (current, failure) = match outcome {
                CycleOutcome::Healthy => {
                    status.state = HealthState::Healthy;
                    status.consecutive_failures = 0;
                    (HealthState::Healthy, None)
                }
                CycleOutcome::Unhealthy { probe_name, reason } => {
                    status.state = HealthState::Unhealthy;
                    status.consecutive_failures += 1;
                    (
                        HealthState::Unhealthy,
                        Some(FailureEvent {
                            event_id: Uuid::new_v4(),
                            node_id: node.node_id.clone(),
                            detected_at: now,
                            probe_name,
                            diagnostic: Some(reason),
                        }),
                    )
                }
            };

            status.last_check_at = Some(now);
            if previous != current {
                status.last_transition_at = Some(now);
            }
            (previous, current, failure)
        };

        // Callbacks run outside the status entry lock, in per-node
        // probe-time order.
        match (previous, current) {
            (HealthState::Healthy | HealthState::Unknown, HealthState::Unhealthy) => {
                if let Some(event) = failure {
                    tracing::warn!(
                        "Node {} became unhealthy ({}: {})",
                        node.node_id,
                        event.probe_name,
                        event.diagnostic.as_deref().unwrap_or("no diagnostic")
                    );
                    let callbacks: Vec<UnhealthyCallback> =
                        self.unhealthy_callbacks.read().await.clone();
                    for callback in callbacks {
                        callback(event.clone()).await;
                    }
                }
            }
            (HealthState::Unhealthy, HealthState::Healthy) => {
                tracing::info!("Node {} recovered to healthy", node.node_id);
                let callbacks: Vec<HealthyCallback> = self.healthy_callbacks.read().await.clone();
                for callback in callbacks {
                    callback(node.node_id.clone(), now).await;
                }
            }
            _ => {}
        }

        current
    }

    #[must_use]
    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.statuses.get(node_id).map(|s| s.clone())
    }

    #[must_use]
    pub fn last_state(&self, node_id: &str) -> Option<HealthState> {
        self.statuses.get(node_id).map(|s| s.state)
    }

    #[must_use]
    pub fn get_statistics(&self) -> MonitoringStatistics {
        let nodes: Vec<NodeStatus> = self.statuses.iter().map(|e| e.value().clone()).collect();
        let healthy = nodes
            .iter()
            .filter(|n| n.state == HealthState::Healthy)
            .count();
        let unhealthy = nodes
            .iter()
            .filter(|n| n.state == HealthState::Unhealthy)
            .count();
        let unknown = nodes
            .iter()
            .filter(|n| n.state == HealthState::Unknown)
            .count();

        MonitoringStatistics {
            active: self.is_active(),
            interval_seconds: self.current_interval_seconds(),
            total_nodes: nodes.len(),
            healthy_nodes: healthy,
            unhealthy_nodes: unhealthy,
            unknown_nodes: unknown,
            total_cycles: self.total_cycles.load(Ordering::Relaxed),
            nodes,
        }
    }
}
