//! ZooKeeper four-letter-word probe

use super::{HealthOutcome, Probe};
use crate::utils::config::NodeConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Probes a ZooKeeper node with the `ruok` four-letter command.
/// The node is healthy iff it answers `imok` within the timeout.
#[derive(Debug, Default)]
pub struct ZookeeperProbe;

impl ZookeeperProbe {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn four_letter_word(address: &str, word: &[u8]) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(word).await?;
        stream.shutdown().await?;

        let mut response = Vec::with_capacity(16);
        stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response).trim().to_string())
    }
}

#[async_trait]
impl Probe for ZookeeperProbe {
    fn name(&self) -> &str {
        "zookeeper"
    }

    async fn check(&self, node: &NodeConfig, timeout: Duration) -> HealthOutcome {
        let address = node.address();
        match tokio::time::timeout(timeout, Self::four_letter_word(&address, b"ruok")).await {
            Ok(Ok(response)) if response == "imok" => HealthOutcome::Healthy,
            Ok(Ok(response)) => HealthOutcome::unhealthy(format!(
                "unexpected ruok response from {address}: {response:?}"
            )),
            Ok(Err(e)) => HealthOutcome::unhealthy(format!("ruok to {address} failed: {e}")),
            Err(_) => HealthOutcome::unhealthy(format!(
                "ruok to {address} timed out after {}ms",
                timeout.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::NodeType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn node_for(port: u16) -> NodeConfig {
        NodeConfig {
            node_id: "zk-1".to_string(),
            node_type: NodeType::Zookeeper,
            host: "127.0.0.1".to_string(),
            port,
            jmx_port: None,
            monitoring_methods: vec!["zookeeper".to_string()],
            recovery_actions: vec![],
            shell_command: None,
            retry_policy: None,
        }
    }

    async fn fake_zookeeper(response: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4];
                let _ = stream.read_exact(&mut buf).await;
                let _ = stream.write_all(response).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn imok_response_is_healthy() {
        let port = fake_zookeeper(b"imok").await;
        let probe = ZookeeperProbe::new();
        let outcome = probe.check(&node_for(port), Duration::from_secs(1)).await;
        assert!(outcome.is_healthy());
    }

    #[tokio::test]
    async fn other_response_is_unhealthy() {
        let port = fake_zookeeper(b"ronk").await;
        let probe = ZookeeperProbe::new();
        let outcome = probe.check(&node_for(port), Duration::from_secs(1)).await;
        assert!(!outcome.is_healthy());
        assert!(outcome.reason().unwrap().contains("unexpected"));
    }
}
