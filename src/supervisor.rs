//! Process supervisor
//!
//! Owns the lifecycle of every component: strict startup ordering,
//! signal handling, the periodic self-health check, resource sampling
//! with load-shedding, degraded-mode transitions, and graceful shutdown
//! with drain deadlines. All state is in-memory; a restart starts clean.

use crate::actions::ActionRegistry;
use crate::integration::{IntegratorConfig, RecoveryIntegrator};
use crate::logging::LoggingService;
use crate::monitoring::MonitoringService;
use crate::notification::{EmailNotifier, LogNotifier, NotificationService, WebhookNotifier};
use crate::probes::ProbeRegistry;
use crate::recovery::{RecoveryEngine, RecoveryResult};
use crate::shutdown::ShutdownSignal;
use crate::utils::config::SentinelConfig;
use crate::utils::error::{ResultExt, SentinelError, SentinelResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Internal-error budget; one more error triggers graceful shutdown.
pub const MAX_INTERNAL_ERRORS: u32 = 5;
/// Errors within this window put the supervisor into degraded mode.
const ERROR_BURST_THRESHOLD: u32 = 3;
const ERROR_BURST_WINDOW_MINUTES: i64 = 5;

const SELF_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const RESOURCE_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);
const TASK_JOIN_DEADLINE: Duration = Duration::from_secs(5);

const MEMORY_THRESHOLD_PERCENT: f64 = 85.0;
const DISK_THRESHOLD_PERCENT: f64 = 90.0;
const CPU_THRESHOLD_PERCENT: f64 = 95.0;

const DEGRADED_MIN_INTERVAL_SECS: u64 = 60;
const DEGRADED_RECOVERY_CAP: usize = 2;
const HIGH_CPU_RECOVERY_CAP: usize = 1;
const HIGH_CPU_INTERVAL_CAP_SECS: u64 = 300;
const HIGH_CPU_RESTORE_DELAY: Duration = Duration::from_secs(300);

const DELIVERY_QUEUE_WARN: usize = 100;
const RETRY_QUEUE_WARN: usize = 50;
const ACTIVE_RECOVERIES_WARN: usize = 10;
const COOLDOWN_NODES_WARN: usize = 5;
const STUCK_ATTEMPTS_WARN: u32 = 3;

/// Explicit sink for internal errors in supervisor-owned tasks.
/// Installed at start and dropped at stop; never relies on ambient
/// process state.
#[derive(Clone)]
pub struct ErrorReporter {
    count: Arc<AtomicU32>,
    last_error_at: Arc<StdMutex<Option<DateTime<Utc>>>>,
    shutdown: ShutdownSignal,
}

impl ErrorReporter {
    #[must_use]
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            count: Arc::new(AtomicU32::new(0)),
            last_error_at: Arc::new(StdMutex::new(None)),
            shutdown,
        }
    }

    /// Record an internal error. Past the budget the shutdown signal is
    /// set and a CRITICAL line is logged.
    pub fn record(&self, context: &str, error: &SentinelError) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut last) = self.last_error_at.lock() {
            *last = Some(Utc::now());
        }
        tracing::error!("Internal error in {context} ({count} total): {error}");

        if count > MAX_INTERNAL_ERRORS {
            tracing::error!(
                "CRITICAL: {count} internal errors exceed budget of {MAX_INTERNAL_ERRORS}, \
                 initiating shutdown"
            );
            self.shutdown.trigger();
        }
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.last_error_at.lock().ok().and_then(|l| *l)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        if let Ok(mut last) = self.last_error_at.lock() {
            *last = None;
        }
    }

    /// True when more than `threshold` errors occurred and the latest
    /// one is inside the window.
    #[must_use]
    pub fn has_error_burst(&self, threshold: u32, window: chrono::Duration) -> bool {
        if self.error_count() <= threshold {
            return false;
        }
        self.last_error_at()
            .is_some_and(|at| Utc::now().signed_duration_since(at) < window)
    }
}

/// One resource reading with threshold classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReading {
    pub percent: f64,
    pub threshold_percent: f64,
    pub critical: bool,
}

impl ResourceReading {
    fn new(percent: f64, threshold: f64) -> Self {
        Self {
            percent,
            threshold_percent: threshold,
            critical: percent > threshold,
        }
    }
}

/// Process-visible resource usage snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub memory: ResourceReading,
    pub disk: ResourceReading,
    pub cpu: ResourceReading,
}

/// The supervisor: owns every long-running task in the process
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<SentinelConfig>,
    shutdown: ShutdownSignal,
    running: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    reporter: ErrorReporter,
    logging: Arc<LoggingService>,
    probes: ProbeRegistry,
    actions: ActionRegistry,
    monitoring: MonitoringService,
    engine: RecoveryEngine,
    notification: NotificationService,
    integrator: RecoveryIntegrator,
    system: Arc<Mutex<System>>,
    started_at: Arc<StdMutex<Option<Instant>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Build and wire every component in the strict startup order:
    /// configuration, logging, registries, monitoring, recovery,
    /// notification, integrator, callback wiring.
    pub async fn initialize(config_path: Option<&Path>) -> SentinelResult<Self> {
        let config = Arc::new(SentinelConfig::load(config_path)?);
        let logging = Arc::new(LoggingService::init(&config.logging)?);
        tracing::info!(
            "Configuration loaded for cluster '{}'",
            config.cluster.cluster_name
        );

        let shutdown = ShutdownSignal::new();
        let reporter = ErrorReporter::new(shutdown.clone());

        let probes = ProbeRegistry::with_builtins();
        let actions = ActionRegistry::with_builtins();
        config
            .validate_against_registries(&probes.names().await, &actions.names().await)?;

        let cluster = Arc::new(config.cluster.clone());
        let monitoring = MonitoringService::new(Arc::clone(&cluster), probes.clone());

        let engine = RecoveryEngine::new(
            actions.clone(),
            cluster.default_retry_policy.clone(),
            shutdown.clone(),
        );
        engine.set_health_verifier(monitoring.clone()).await;

        let notification = NotificationService::new(&config.notification, shutdown.clone());
        notification
            .register_notifier(Arc::new(EmailNotifier::from_config(&config.notification)?))
            .await;
        if let Some(url) = &config.notification.webhook_url {
            notification
                .register_notifier(Arc::new(WebhookNotifier::new(url.clone())))
                .await;
        }
        notification.register_notifier(Arc::new(LogNotifier)).await;

        let integrator = RecoveryIntegrator::new(
            Arc::clone(&cluster),
            engine.clone(),
            monitoring.interval_handle(),
            shutdown.clone(),
            IntegratorConfig::default(),
        );
        integrator.wire(&monitoring).await;

        let supervisor = Self {
            config,
            shutdown,
            running: Arc::new(AtomicBool::new(false)),
            degraded: Arc::new(AtomicBool::new(false)),
            reporter,
            logging,
            probes,
            actions,
            monitoring,
            engine,
            notification,
            integrator,
            system: Arc::new(Mutex::new(System::new())),
            started_at: Arc::new(StdMutex::new(None)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };

        supervisor.wire_notification_handlers().await;
        tracing::info!("System initialization completed");
        Ok(supervisor)
    }

    /// Forward integrator fan-out into the notification dispatcher.
    async fn wire_notification_handlers(&self) {
        let supervisor = self.clone();
        self.integrator
            .register_escalation_handler(Arc::new(move |node_id, history| {
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    supervisor.on_recovery_escalation(&node_id, &history).await;
                })
            }))
            .await;

        let supervisor = self.clone();
        self.integrator
            .register_recovery_handler(Arc::new(move |event| {
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    supervisor.on_recovery_success(event).await;
                })
            }))
            .await;
    }

    async fn on_recovery_escalation(&self, node_id: &str, history: &[RecoveryResult]) {
        let Some(node) = self.config.cluster.get_node(node_id) else {
            tracing::warn!("Escalation for unknown node {node_id} discarded");
            return;
        };
        let last_error = history
            .iter()
            .rev()
            .find(|r| !r.stderr.is_empty())
            .map_or("unknown error", |r| r.stderr.as_str());
        self.notification
            .send_failure_alert(node, history, last_error)
            .await;
        tracing::info!("Failure alert queued for node {node_id}");
    }

    async fn on_recovery_success(&self, event: crate::recovery::RecoveryEvent) {
        let Some(node) = self.config.cluster.get_node(&event.node_id) else {
            return;
        };
        let downtime = event
            .completed_at
            .signed_duration_since(event.failure_event.detected_at)
            .to_std()
            .unwrap_or_default();
        let history = self.engine.get_recovery_history(&event.node_id);
        let prior_failed: Vec<RecoveryResult> =
            history.into_iter().filter(|r| !r.success).collect();

        self.notification
            .send_recovery_confirmation(node, &event.recovery_result, downtime, &prior_failed)
            .await;
        tracing::info!("Recovery confirmation queued for node {}", event.node_id);
    }

    /// Start all services and background tasks.
    pub async fn start(&self) -> SentinelResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SentinelError::AlreadyRunning);
        }

        self.notification.start().await;
        self.monitoring.start().await?;

        let (sigterm, sigint) = match self.install_signal_handlers() {
            Ok(streams) => streams,
            Err(e) => {
                // Failed mid-startup: unwind the already-started services.
                self.running.store(false, Ordering::SeqCst);
                self.monitoring.stop().await?;
                self.notification.stop().await;
                return Err(e);
            }
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_signal_listener(sigterm, sigint));
        tasks.push(self.spawn_self_health_loop());
        tasks.push(self.spawn_resource_monitor());
        drop(tasks);

        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Instant::now());
        }
        self.log_startup_summary();
        Ok(())
    }

    /// Block until shutdown is requested (signal, error budget, or
    /// explicit `stop`).
    pub async fn run(&self) -> SentinelResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SentinelError::NotRunning);
        }
        self.shutdown.wait().await;
        Ok(())
    }

    /// Graceful shutdown in reverse startup order, with deadlines.
    pub async fn stop(&self) -> SentinelResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Supervisor is not running");
            return Ok(());
        }

        tracing::info!("Initiating shutdown");
        self.shutdown.trigger();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(TASK_JOIN_DEADLINE, task).await.is_err() {
                tracing::warn!("Background task did not stop within {TASK_JOIN_DEADLINE:?}");
            }
        }

        self.monitoring.stop().await?;
        self.notification.stop().await;

        tracing::info!("Shutdown completed");
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn error_reporter(&self) -> ErrorReporter {
        self.reporter.clone()
    }

    #[must_use]
    pub fn monitoring(&self) -> &MonitoringService {
        &self.monitoring
    }

    #[must_use]
    pub fn integrator(&self) -> &RecoveryIntegrator {
        &self.integrator
    }

    #[must_use]
    pub fn notification(&self) -> &NotificationService {
        &self.notification
    }

    #[must_use]
    pub fn recovery_engine(&self) -> &RecoveryEngine {
        &self.engine
    }

    /// Registries for runtime capability additions.
    #[must_use]
    pub fn probe_registry(&self) -> &ProbeRegistry {
        &self.probes
    }

    #[must_use]
    pub fn action_registry(&self) -> &ActionRegistry {
        &self.actions
    }

    fn install_signal_handlers(&self) -> SentinelResult<(Signal, Signal)> {
        let sigterm = signal(SignalKind::terminate())
            .with_context("installing SIGTERM handler", "supervisor")?;
        let sigint = signal(SignalKind::interrupt())
            .with_context("installing SIGINT handler", "supervisor")?;
        Ok((sigterm, sigint))
    }

    fn spawn_signal_listener(&self, mut sigterm: Signal, mut sigint: Signal) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating shutdown"),
                _ = sigint.recv() => tracing::info!("Received SIGINT, initiating shutdown"),
                () = shutdown.wait() => return,
            }
            shutdown.trigger();
        })
    }

    fn spawn_self_health_loop(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                if !supervisor.shutdown.sleep(SELF_HEALTH_INTERVAL).await {
                    break;
                }
                supervisor.check_system_health().await;
                supervisor.check_degraded_mode().await;
            }
        })
    }

    fn spawn_resource_monitor(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                if !supervisor.shutdown.sleep(RESOURCE_SAMPLE_INTERVAL).await {
                    break;
                }
                supervisor.check_resource_constraints().await;
            }
        })
    }

    /// Periodic self-health check. Issues are logged at WARN and never
    /// crash the loop.
    pub async fn check_system_health(&self) {
        let mut issues: Vec<String> = Vec::new();

        if self.running.load(Ordering::SeqCst) && !self.monitoring.is_active() {
            issues.push("monitoring service is not active".to_string());
            match self.monitoring.start().await {
                Ok(()) => tracing::info!("Restarted monitoring service"),
                Err(e) => {
                    self.reporter.record("monitoring restart", &e);
                }
            }
        }

        let sizes = self.notification.queue_sizes().await;
        if sizes.delivery_queue > DELIVERY_QUEUE_WARN {
            issues.push(format!(
                "large notification delivery queue: {}",
                sizes.delivery_queue
            ));
        }
        if sizes.retry_queue > RETRY_QUEUE_WARN {
            issues.push(format!("large notification retry queue: {}", sizes.retry_queue));
        }

        let stats = self.integrator.get_failure_statistics();
        if stats.active_recoveries > ACTIVE_RECOVERIES_WARN {
            issues.push(format!(
                "too many active recoveries: {}",
                stats.active_recoveries
            ));
        }
        if stats.nodes_in_cooldown > COOLDOWN_NODES_WARN {
            issues.push(format!("many nodes in cooldown: {}", stats.nodes_in_cooldown));
        }

        for (node_id, progress) in self.engine.get_active_recoveries() {
            if progress.attempt_count >= STUCK_ATTEMPTS_WARN {
                issues.push(format!(
                    "node {node_id} has many recovery attempts: {}",
                    progress.attempt_count
                ));
            }
        }

        if issues.is_empty() {
            tracing::debug!("System health check passed");
        } else {
            for issue in issues {
                tracing::warn!("Health issue: {issue}");
            }
        }
    }

    /// Degraded-mode entry/exit based on the error burst and component
    /// health.
    pub async fn check_degraded_mode(&self) {
        let burst = self.reporter.has_error_burst(
            ERROR_BURST_THRESHOLD,
            chrono::Duration::minutes(ERROR_BURST_WINDOW_MINUTES),
        );
        let monitoring_down =
            self.running.load(Ordering::SeqCst) && !self.monitoring.is_active();
        let should_degrade = burst || monitoring_down;

        if should_degrade && !self.is_degraded() {
            self.enter_degraded_mode().await;
        } else if !should_degrade && self.is_degraded() {
            self.exit_degraded_mode().await;
        }
    }

    async fn enter_degraded_mode(&self) {
        self.degraded.store(true, Ordering::SeqCst);
        let base = self.config.cluster.monitoring_interval_seconds;
        let degraded_interval = (base * 2).max(DEGRADED_MIN_INTERVAL_SECS);
        self.monitoring.set_interval_seconds(degraded_interval);
        self.integrator
            .set_max_concurrent_recoveries(DEGRADED_RECOVERY_CAP)
            .await;
        tracing::warn!(
            "Entering degraded mode: interval {degraded_interval}s, \
             max concurrent recoveries {DEGRADED_RECOVERY_CAP}"
        );
    }

    async fn exit_degraded_mode(&self) {
        self.degraded.store(false, Ordering::SeqCst);
        self.monitoring
            .set_interval_seconds(self.config.cluster.monitoring_interval_seconds);
        self.integrator
            .set_max_concurrent_recoveries(IntegratorConfig::default().max_concurrent_recoveries)
            .await;
        self.reporter.reset();
        tracing::info!("Exiting degraded mode, normal operation restored");
    }

    async fn sample_resources(&self) -> ResourceStatus {
        let (memory_percent, cpu_percent) = {
            let mut system = self.system.lock().await;
            system.refresh_memory();
            system.refresh_cpu_usage();
            let total = system.total_memory();
            let memory_percent = if total > 0 {
                (system.used_memory() as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            (memory_percent, f64::from(system.global_cpu_info().cpu_usage()))
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = disks
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| disks.iter().next())
            .map(|d| {
                let total = d.total_space();
                if total > 0 {
                    ((total - d.available_space()) as f64 / total as f64) * 100.0
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        ResourceStatus {
            memory: ResourceReading::new(memory_percent, MEMORY_THRESHOLD_PERCENT),
            disk: ResourceReading::new(disk_percent, DISK_THRESHOLD_PERCENT),
            cpu: ResourceReading::new(cpu_percent, CPU_THRESHOLD_PERCENT),
        }
    }

    /// Resource-driven load shedding.
    pub async fn check_resource_constraints(&self) {
        let status = self.sample_resources().await;

        if status.memory.critical {
            tracing::warn!("High memory usage: {:.1}%", status.memory.percent);
            self.handle_high_memory_usage();
        }
        if status.disk.critical {
            tracing::warn!("High disk usage: {:.1}%", status.disk.percent);
            self.handle_high_disk_usage();
        }
        if status.cpu.critical {
            tracing::warn!("High CPU usage: {:.1}%", status.cpu.percent);
            self.handle_high_cpu_usage().await;
        }
    }

    fn handle_high_memory_usage(&self) {
        self.engine.trim_histories(10);
        self.integrator.trim_event_lists(20);
        if let Err(e) = self.logging.cleanup_old_logs(7) {
            self.reporter.record("log cleanup", &e);
        }
        tracing::info!("Performed memory cleanup");
    }

    fn handle_high_disk_usage(&self) {
        if let Err(e) = self.logging.cleanup_old_logs(3) {
            self.reporter.record("log cleanup", &e);
        }
        if let Err(e) = self.logging.remove_temp_files() {
            self.reporter.record("temp file cleanup", &e);
        }
        tracing::warn!("Performed disk cleanup");
    }

    async fn handle_high_cpu_usage(&self) {
        let current = self.monitoring.current_interval_seconds();
        let slowed = (current * 2).min(HIGH_CPU_INTERVAL_CAP_SECS);
        self.monitoring.set_interval_seconds(slowed);
        self.integrator
            .set_max_concurrent_recoveries(HIGH_CPU_RECOVERY_CAP)
            .await;
        tracing::info!(
            "Throttled under CPU pressure: interval {slowed}s, \
             max concurrent recoveries {HIGH_CPU_RECOVERY_CAP}"
        );

        // Automatic restoration once the pressure window passes.
        let monitoring = self.monitoring.clone();
        let integrator = self.integrator.clone();
        let shutdown = self.shutdown.clone();
        let normal_interval = self.config.cluster.monitoring_interval_seconds;
        tokio::spawn(async move {
            if shutdown.sleep(HIGH_CPU_RESTORE_DELAY).await {
                monitoring.set_interval_seconds(normal_interval);
                integrator
                    .set_max_concurrent_recoveries(
                        IntegratorConfig::default().max_concurrent_recoveries,
                    )
                    .await;
                tracing::info!("Restored normal operation after CPU pressure");
            }
        });
    }

    /// Aggregate status report: lifecycle, per-component statistics and
    /// resource readings.
    pub async fn system_status(&self) -> serde_json::Value {
        let uptime_seconds = self
            .started_at
            .lock()
            .ok()
            .and_then(|s| *s)
            .map_or(0, |s| s.elapsed().as_secs());
        let resources = self.sample_resources().await;
        let monitoring = self.monitoring.get_statistics();
        let integration = self.integrator.get_failure_statistics();
        let queue_sizes = self.notification.queue_sizes().await;

        serde_json::json!({
            "running": self.is_running(),
            "degraded_mode": self.is_degraded(),
            "uptime_seconds": uptime_seconds,
            "error_count": self.reporter.error_count(),
            "last_error_time": self.reporter.last_error_at(),
            "components": {
                "monitoring": monitoring,
                "recovery": {
                    "active_recoveries": self.engine.get_active_recoveries().len(),
                    "registered_actions": self.actions.len().await,
                },
                "integration": integration,
                "notification": {
                    "queue_sizes": queue_sizes,
                    "registered_notifiers": self.notification.notifier_count().await,
                    "delivered_total": self.notification.delivered_total(),
                    "dropped_total": self.notification.dropped_total(),
                },
            },
            "resources": resources,
        })
    }

    fn log_startup_summary(&self) {
        let cluster = &self.config.cluster;
        tracing::info!(
            "Supervisor started: cluster '{}', {} nodes ({} kafka brokers, {} zookeeper), \
             monitoring every {}s",
            cluster.cluster_name,
            cluster.nodes.len(),
            cluster.kafka_brokers().len(),
            cluster.zookeeper_nodes().len(),
            cluster.monitoring_interval_seconds
        );
    }
}
