//! TCP socket reachability probe

use super::{HealthOutcome, Probe};
use crate::utils::config::NodeConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Probes a node by opening a TCP connection to its service port.
/// A completed handshake within the timeout counts as healthy.
#[derive(Debug, Default)]
pub struct SocketProbe;

impl SocketProbe {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Probe for SocketProbe {
    fn name(&self) -> &str {
        "socket"
    }

    async fn check(&self, node: &NodeConfig, timeout: Duration) -> HealthOutcome {
        let address = node.address();
        match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => HealthOutcome::Healthy,
            Ok(Err(e)) => HealthOutcome::unhealthy(format!("connect to {address} failed: {e}")),
            Err(_) => HealthOutcome::unhealthy(format!(
                "connect to {address} timed out after {}ms",
                timeout.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::NodeType;
    use tokio::net::TcpListener;

    fn node_for(port: u16) -> NodeConfig {
        NodeConfig {
            node_id: "kafka-1".to_string(),
            node_type: NodeType::KafkaBroker,
            host: "127.0.0.1".to_string(),
            port,
            jmx_port: None,
            monitoring_methods: vec!["socket".to_string()],
            recovery_actions: vec![],
            shell_command: None,
            retry_policy: None,
        }
    }

    #[tokio::test]
    async fn reports_healthy_for_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = SocketProbe::new();
        let outcome = probe.check(&node_for(port), Duration::from_secs(1)).await;
        assert!(outcome.is_healthy());
    }

    #[tokio::test]
    async fn reports_unhealthy_for_closed_port() {
        // Bind then drop to obtain a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = SocketProbe::new();
        let outcome = probe.check(&node_for(port), Duration::from_secs(1)).await;
        assert!(!outcome.is_healthy());
    }
}
