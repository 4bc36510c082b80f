//! # Kafka Sentinel
//!
//! An always-on, self-healing supervisor for Kafka + ZooKeeper
//! clusters. The supervisor continuously probes each configured node,
//! walks ordered recovery actions under a retry policy when a node goes
//! unhealthy, and escalates to operators once self-healing is
//! exhausted.
//!
//! ## Architecture Overview
//!
//! - [`probes`]: health-check capabilities behind a named registry
//! - [`actions`]: recovery-action capabilities behind a named registry
//! - [`monitoring`]: per-node probe loops and health-state transitions
//! - [`recovery`]: retry-policy driven recovery engine
//! - [`integration`]: the hub bridging monitoring events to recovery
//!   runs with exclusivity, concurrency caps, cooldown and flap dedup
//! - [`notification`]: priority-queued operator alerting
//! - [`supervisor`]: process lifecycle, self-health and resource-driven
//!   degradation
//! - [`utils`]: configuration and error handling
//!
//! Data flow: probe -> monitoring -> integrator -> recovery engine ->
//! integrator -> notification. All state is in-memory; a restart starts
//! clean.

/// Recovery-action capabilities and registry
pub mod actions;
/// Monitoring-to-recovery integration hub
pub mod integration;
/// Log sink initialization and maintenance
pub mod logging;
/// Per-node health monitoring
pub mod monitoring;
/// Operator notification dispatch
pub mod notification;
/// Health-check capabilities and registry
pub mod probes;
/// Recovery engine with retry policies
pub mod recovery;
/// Process-wide shutdown broadcast
pub mod shutdown;
/// Process supervisor and lifecycle
pub mod supervisor;
/// Configuration, errors and shared helpers
pub mod utils;

/// Unit and integration tests
pub mod tests;

// Re-export the types most callers need.
pub use actions::{ActionOutcome, ActionRegistry, RecoveryAction};
pub use integration::{FailureStatistics, IntegratorConfig, RecoveryIntegrator};
pub use monitoring::{FailureEvent, HealthState, MonitoringService, NodeStatus};
pub use notification::{AlertMessage, DeliveryStatus, NotificationService, Notifier};
pub use probes::{HealthOutcome, Probe, ProbeRegistry};
pub use recovery::{RecoveryEngine, RecoveryEvent, RecoveryOutcome, RecoveryResult};
pub use shutdown::ShutdownSignal;
pub use supervisor::Supervisor;
pub use utils::config::{ClusterConfig, NodeConfig, NodeType, RetryPolicy, SentinelConfig};
pub use utils::error::{SentinelError, SentinelResult};
