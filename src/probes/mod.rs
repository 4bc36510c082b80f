//! Health-check capabilities
//!
//! A probe is a named capability that answers Healthy/Unhealthy for a
//! single node within a timeout. Probes are looked up by the names
//! listed in each node's `monitoring_methods`; unknown names are
//! rejected at configuration validation.

use crate::utils::config::NodeConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

mod jmx;
mod socket;
mod zookeeper;

pub use jmx::JmxProbe;
pub use socket::SocketProbe;
pub use zookeeper::ZookeeperProbe;

/// Default per-probe timeout applied by the monitoring service.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a single probe check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthOutcome {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthOutcome {
    #[must_use]
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        HealthOutcome::Unhealthy {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy)
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            HealthOutcome::Healthy => None,
            HealthOutcome::Unhealthy { reason } => Some(reason),
        }
    }
}

/// A named health-check capability
///
/// Implementations must never block beyond the given timeout; the
/// built-ins wrap their I/O in `tokio::time::timeout`.
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, node: &NodeConfig, timeout: Duration) -> HealthOutcome;
}

/// Registry of probe capabilities keyed by name
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: Arc<RwLock<HashMap<String, Arc<dyn Probe>>>>,
}

impl ProbeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in probes
    /// (`socket`, `zookeeper`, `jmx`).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut probes: HashMap<String, Arc<dyn Probe>> = HashMap::new();
        let socket = Arc::new(SocketProbe::new());
        let zookeeper = Arc::new(ZookeeperProbe::new());
        let jmx = Arc::new(JmxProbe::new());
        probes.insert(socket.name().to_string(), socket);
        probes.insert(zookeeper.name().to_string(), zookeeper);
        probes.insert(jmx.name().to_string(), jmx);
        Self {
            probes: Arc::new(RwLock::new(probes)),
        }
    }

    /// Register an additional probe capability. Replaces any existing
    /// probe with the same name.
    pub async fn register(&self, probe: Arc<dyn Probe>) {
        let name = probe.name().to_string();
        self.probes.write().await.insert(name.clone(), probe);
        tracing::debug!("Registered probe capability '{name}'");
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Probe>> {
        self.probes.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> HashSet<String> {
        self.probes.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.probes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.probes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysHealthy;

    #[async_trait]
    impl Probe for AlwaysHealthy {
        fn name(&self) -> &str {
            "always_healthy"
        }

        async fn check(&self, _node: &NodeConfig, _timeout: Duration) -> HealthOutcome {
            HealthOutcome::Healthy
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = ProbeRegistry::with_builtins();
        let names = tokio_test::block_on(registry.names());
        assert!(names.contains("socket"));
        assert!(names.contains("zookeeper"));
        assert!(names.contains("jmx"));
    }

    #[tokio::test]
    async fn custom_probe_registration() {
        let registry = ProbeRegistry::new();
        assert!(registry.is_empty().await);
        registry.register(Arc::new(AlwaysHealthy)).await;
        assert!(registry.get("always_healthy").await.is_some());
        assert!(registry.get("missing").await.is_none());
    }

    #[test]
    fn outcome_accessors() {
        assert!(HealthOutcome::Healthy.is_healthy());
        let outcome = HealthOutcome::unhealthy("connection refused");
        assert!(!outcome.is_healthy());
        assert_eq!(outcome.reason(), Some("connection refused"));
    }
}
