//! Monitoring-to-recovery integration
//!
//! The integrator sits at the hub of the callback star: it receives
//! health transitions from monitoring, dispatches recovery runs under a
//! global concurrency cap with per-node exclusivity and cooldown, and
//! fans engine outcomes out to externally registered handlers (the
//! notification dispatcher, in the production wiring).

use crate::monitoring::{FailureEvent, MonitoringService};
use crate::recovery::{
    EscalationCallback, RecoveryEngine, RecoveryEvent, RecoveryOutcome, RecoveryResult,
    RecoverySuccessCallback,
};
use crate::shutdown::ShutdownSignal;
use crate::utils::config::ClusterConfig;
use crate::utils::error::SentinelError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Per-node failure/recovery event list bound (FIFO drop beyond this).
pub const EVENT_HISTORY_LIMIT: usize = 20;

/// Integrator policy knobs
#[derive(Debug, Clone)]
pub struct IntegratorConfig {
    pub max_concurrent_recoveries: usize,
    pub cooldown: Duration,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

// Each incoming unhealthy callback lands in exactly one of: dispatched,
// queued_total, dropped_in_cooldown, ignored_in_progress or
// queue_deduplicated. Queue outcomes (drained, discarded_from_queue) are
// accounted separately so the two layers each sum up.
#[derive(Default)]
struct Counters {
    callbacks_received: AtomicU64,
    dispatched: AtomicU64,
    queued_total: AtomicU64,
    dropped_in_cooldown: AtomicU64,
    ignored_in_progress: AtomicU64,
    queue_deduplicated: AtomicU64,
    drained: AtomicU64,
    discarded_from_queue: AtomicU64,
    total_successes: AtomicU64,
    total_exhaustions: AtomicU64,
    queue_high_water: AtomicUsize,
    handler_failures: AtomicU64,
}

/// Snapshot of integrator state and counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureStatistics {
    pub active_recoveries: usize,
    pub nodes_in_cooldown: usize,
    pub queued: usize,
    pub queue_high_water: usize,
    pub callbacks_received: u64,
    pub dispatched: u64,
    pub queued_total: u64,
    pub dropped_in_cooldown: u64,
    pub ignored_in_progress: u64,
    pub queue_deduplicated: u64,
    pub drained: u64,
    pub discarded_from_queue: u64,
    pub total_successes: u64,
    pub total_exhaustions: u64,
    pub handler_failures: u64,
    pub flaps_by_node: HashMap<String, u64>,
}

/// The monitoring/recovery integrator
#[derive(Clone)]
pub struct RecoveryIntegrator {
    cluster: Arc<ClusterConfig>,
    engine: RecoveryEngine,
    shutdown: ShutdownSignal,
    cooldown: Duration,
    max_concurrent: Arc<AtomicUsize>,
    /// Probe-interval cell shared with the monitoring service; the flap
    /// window is 2x the current interval.
    interval_secs: Arc<AtomicU64>,
    active: Arc<DashMap<String, Uuid>>,
    queue: Arc<Mutex<VecDeque<FailureEvent>>>,
    cooldown_until: Arc<DashMap<String, DateTime<Utc>>>,
    last_unhealthy_at: Arc<DashMap<String, DateTime<Utc>>>,
    flaps: Arc<DashMap<String, u64>>,
    failure_events: Arc<DashMap<String, VecDeque<FailureEvent>>>,
    recovery_events: Arc<DashMap<String, VecDeque<RecoveryEvent>>>,
    counters: Arc<Counters>,
    escalation_handlers: Arc<RwLock<Vec<EscalationCallback>>>,
    recovery_handlers: Arc<RwLock<Vec<RecoverySuccessCallback>>>,
}

impl RecoveryIntegrator {
    #[must_use]
    pub fn new(
        cluster: Arc<ClusterConfig>,
        engine: RecoveryEngine,
        interval_secs: Arc<AtomicU64>,
        shutdown: ShutdownSignal,
        config: IntegratorConfig,
    ) -> Self {
        Self {
            cluster,
            engine,
            shutdown,
            cooldown: config.cooldown,
            max_concurrent: Arc::new(AtomicUsize::new(config.max_concurrent_recoveries)),
            interval_secs,
            active: Arc::new(DashMap::new()),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            cooldown_until: Arc::new(DashMap::new()),
            last_unhealthy_at: Arc::new(DashMap::new()),
            flaps: Arc::new(DashMap::new()),
            failure_events: Arc::new(DashMap::new()),
            recovery_events: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            escalation_handlers: Arc::new(RwLock::new(Vec::new())),
            recovery_handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Wire the integrator into the monitoring service and recovery
    /// engine. Called once by the supervisor after all components exist.
    pub async fn wire(&self, monitoring: &MonitoringService) {
        let integrator = self.clone();
        monitoring
            .register_on_unhealthy(Arc::new(move |event| {
                let integrator = integrator.clone();
                Box::pin(async move {
                    integrator.handle_node_unhealthy(event).await;
                })
            }))
            .await;

        let integrator = self.clone();
        monitoring
            .register_on_healthy(Arc::new(move |node_id, at| {
                let integrator = integrator.clone();
                Box::pin(async move {
                    integrator.handle_node_healthy(&node_id, at);
                })
            }))
            .await;

        let integrator = self.clone();
        self.engine
            .register_escalation_callback(Arc::new(move |node_id, history| {
                let integrator = integrator.clone();
                Box::pin(async move {
                    integrator.forward_escalation(node_id, history).await;
                })
            }))
            .await;

        let integrator = self.clone();
        self.engine
            .register_recovery_callback(Arc::new(move |event| {
                let integrator = integrator.clone();
                Box::pin(async move {
                    integrator.forward_recovery(event).await;
                })
            }))
            .await;
    }

    /// Register an external handler for exhausted recoveries.
    pub async fn register_escalation_handler(&self, handler: EscalationCallback) {
        self.escalation_handlers.write().await.push(handler);
    }

    /// Register an external handler for successful recoveries.
    pub async fn register_recovery_handler(&self, handler: RecoverySuccessCallback) {
        self.recovery_handlers.write().await.push(handler);
    }

    fn cap(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Adjust the global concurrency cap and drain the queue into any
    /// newly freed slots.
    pub async fn set_max_concurrent_recoveries(&self, cap: usize) {
        self.max_concurrent.store(cap.max(1), Ordering::SeqCst);
        tracing::info!("Max concurrent recoveries set to {}", cap.max(1));
        self.drain_queue().await;
    }

    #[must_use]
    pub fn max_concurrent_recoveries(&self) -> usize {
        self.cap()
    }

    fn in_cooldown(&self, node_id: &str) -> bool {
        self.cooldown_until
            .get(node_id)
            .is_some_and(|until| *until > Utc::now())
    }

    /// Entry point for NodeUnhealthy transitions.
    pub async fn handle_node_unhealthy(&self, event: FailureEvent) {
        self.counters.callbacks_received.fetch_add(1, Ordering::Relaxed);
        self.record_failure_event(&event);
        self.last_unhealthy_at
            .insert(event.node_id.clone(), event.detected_at);

        if self.active.contains_key(&event.node_id) {
            self.counters
                .ignored_in_progress
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Node {} already in recovery, ignoring unhealthy callback",
                event.node_id
            );
            return;
        }

        if self.in_cooldown(&event.node_id) {
            self.counters
                .dropped_in_cooldown
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Node {} in cooldown, dropping unhealthy callback",
                event.node_id
            );
            return;
        }

        // The queue mutex doubles as the dispatch lock: cap check and
        // slot claim are atomic across nodes.
        let mut queue = self.queue.lock().await;
        if self.active.len() >= self.cap() {
            if queue.iter().any(|e| e.node_id == event.node_id) {
                self.counters
                    .queue_deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Node {} already queued for recovery", event.node_id);
            } else {
                queue.push_back(event);
                self.counters.queued_total.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .queue_high_water
                    .fetch_max(queue.len(), Ordering::Relaxed);
            }
            return;
        }

        self.active.insert(event.node_id.clone(), event.event_id);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.spawn_run(event);
    }

    /// Entry point for NodeHealthy transitions: flap accounting.
    pub fn handle_node_healthy(&self, node_id: &str, at: DateTime<Utc>) {
        if let Some(last_unhealthy) = self.last_unhealthy_at.get(node_id) {
            let window_secs = self.interval_secs.load(Ordering::Relaxed).saturating_mul(2);
            let window = ChronoDuration::seconds(window_secs as i64);
            if at.signed_duration_since(*last_unhealthy) <= window {
                let mut flaps = self.flaps.entry(node_id.to_string()).or_insert(0);
                *flaps += 1;
                tracing::debug!("Node {node_id} flapped ({} total)", *flaps);
            }
        }
    }

    fn spawn_run(&self, event: FailureEvent) {
        let integrator = self.clone();
        tokio::spawn(async move {
            integrator.run_recovery(event).await;
        });
    }

    async fn run_recovery(&self, event: FailureEvent) {
        let node_id = event.node_id.clone();

        if self.shutdown.is_triggered() {
            self.active.remove(&node_id);
            return;
        }

        let Some(node) = self.cluster.get_node(&node_id).cloned() else {
            tracing::warn!("Node {node_id} no longer in configuration, discarding recovery");
            self.active.remove(&node_id);
            return;
        };

        let outcome = self.engine.execute_recovery(&node, &event).await;
        self.active.remove(&node_id);

        match outcome {
            Ok(RecoveryOutcome::Succeeded(_)) => {
                self.counters.total_successes.fetch_add(1, Ordering::Relaxed);
                self.start_cooldown(&node_id);
            }
            Ok(RecoveryOutcome::Exhausted(_)) => {
                self.counters
                    .total_exhaustions
                    .fetch_add(1, Ordering::Relaxed);
                self.start_cooldown(&node_id);
            }
            Ok(RecoveryOutcome::AlreadyInProgress) => {
                // Exclusivity is enforced here; the engine agreeing is
                // only reachable through direct engine use.
                tracing::debug!("Engine reported node {node_id} already in progress");
            }
            Err(SentinelError::OperationCancelled { .. }) => {
                tracing::debug!("Recovery of node {node_id} cancelled by shutdown, discarded");
            }
            Err(e) => {
                tracing::error!("Recovery run for node {node_id} failed internally: {e}");
            }
        }

        self.drain_queue().await;
    }

    fn start_cooldown(&self, node_id: &str) {
        let until = Utc::now() + ChronoDuration::from_std(self.cooldown).unwrap_or_default();
        self.cooldown_until.insert(node_id.to_string(), until);
    }

    async fn drain_queue(&self) {
        loop {
            if self.shutdown.is_triggered() {
                return;
            }
            let event = {
                let mut queue = self.queue.lock().await;
                if self.active.len() >= self.cap() {
                    return;
                }
                let Some(event) = queue.pop_front() else {
                    return;
                };
                if self.in_cooldown(&event.node_id) || self.active.contains_key(&event.node_id) {
                    self.counters
                        .discarded_from_queue
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                self.active.insert(event.node_id.clone(), event.event_id);
                self.counters.drained.fetch_add(1, Ordering::Relaxed);
                event
            };
            self.spawn_run(event);
        }
    }

    fn record_failure_event(&self, event: &FailureEvent) {
        let mut events = self
            .failure_events
            .entry(event.node_id.clone())
            .or_default();
        events.push_back(event.clone());
        while events.len() > EVENT_HISTORY_LIMIT {
            events.pop_front();
        }
    }

    fn record_recovery_event(&self, event: &RecoveryEvent) {
        let mut events = self
            .recovery_events
            .entry(event.node_id.clone())
            .or_default();
        events.push_back(event.clone());
        while events.len() > EVENT_HISTORY_LIMIT {
            events.pop_front();
        }
    }

    /// Fan an exhausted recovery out to the external handlers, each in
    /// its own failure domain.
    pub(crate) async fn forward_escalation(&self, node_id: String, history: Vec<RecoveryResult>) {
        let handlers: Vec<EscalationCallback> = self.escalation_handlers.read().await.clone();
        for handler in handlers {
            let node_id = node_id.clone();
            let history = history.clone();
            let join = tokio::spawn(async move { handler(node_id, history).await });
            if let Err(e) = join.await {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Escalation handler panicked: {e}");
            }
        }
    }

    /// Fan a successful recovery out to the external handlers, each in
    /// its own failure domain.
    pub(crate) async fn forward_recovery(&self, event: RecoveryEvent) {
        self.record_recovery_event(&event);
        let handlers: Vec<RecoverySuccessCallback> = self.recovery_handlers.read().await.clone();
        for handler in handlers {
            let event = event.clone();
            let join = tokio::spawn(async move { handler(event).await });
            if let Err(e) = join.await {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Recovery handler panicked: {e}");
            }
        }
    }

    /// Trim per-node event lists to at most `max_entries`. Used by the
    /// supervisor under memory pressure.
    pub fn trim_event_lists(&self, max_entries: usize) {
        for mut entry in self.failure_events.iter_mut() {
            while entry.len() > max_entries {
                entry.pop_front();
            }
        }
        for mut entry in self.recovery_events.iter_mut() {
            while entry.len() > max_entries {
                entry.pop_front();
            }
        }
    }

    #[must_use]
    pub fn get_failure_statistics(&self) -> FailureStatistics {
        let now = Utc::now();
        let nodes_in_cooldown = self
            .cooldown_until
            .iter()
            .filter(|e| *e.value() > now)
            .count();
        let queued = self
            .queue
            .try_lock()
            .map(|q| q.len())
            .unwrap_or_default();

        FailureStatistics {
            active_recoveries: self.active.len(),
            nodes_in_cooldown,
            queued,
            queue_high_water: self.counters.queue_high_water.load(Ordering::Relaxed),
            callbacks_received: self.counters.callbacks_received.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            queued_total: self.counters.queued_total.load(Ordering::Relaxed),
            dropped_in_cooldown: self.counters.dropped_in_cooldown.load(Ordering::Relaxed),
            ignored_in_progress: self.counters.ignored_in_progress.load(Ordering::Relaxed),
            queue_deduplicated: self.counters.queue_deduplicated.load(Ordering::Relaxed),
            drained: self.counters.drained.load(Ordering::Relaxed),
            discarded_from_queue: self.counters.discarded_from_queue.load(Ordering::Relaxed),
            total_successes: self.counters.total_successes.load(Ordering::Relaxed),
            total_exhaustions: self.counters.total_exhaustions.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            flaps_by_node: self
                .flaps
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    #[must_use]
    pub fn active_recovery_count(&self) -> usize {
        self.active.len()
    }
}
