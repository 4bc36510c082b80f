//! JMX health probe over a Jolokia REST bridge

use super::{HealthOutcome, Probe};
use crate::utils::config::NodeConfig;
use async_trait::async_trait;
use std::time::Duration;

/// Probes a broker's JMX endpoint through a Jolokia HTTP bridge on the
/// node's `jmx_port`. A 2xx response with Jolokia `status: 200` counts
/// as healthy.
#[derive(Debug)]
pub struct JmxProbe {
    client: reqwest::Client,
}

impl Default for JmxProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl JmxProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Probe for JmxProbe {
    fn name(&self) -> &str {
        "jmx"
    }

    async fn check(&self, node: &NodeConfig, timeout: Duration) -> HealthOutcome {
        let Some(jmx_port) = node.jmx_port else {
            return HealthOutcome::unhealthy(format!(
                "node {} lists the jmx probe but has no jmx_port configured",
                node.node_id
            ));
        };

        let url = format!("http://{}:{}/jolokia/version", node.host, jmx_port);
        let response = self.client.get(&url).timeout(timeout).send().await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<serde_json::Value>().await {
                    Ok(body) => {
                        let status = body.get("status").and_then(serde_json::Value::as_u64);
                        if status == Some(200) {
                            HealthOutcome::Healthy
                        } else {
                            HealthOutcome::unhealthy(format!(
                                "jolokia at {url} returned status {status:?}"
                            ))
                        }
                    }
                    Err(e) => {
                        HealthOutcome::unhealthy(format!("jolokia response from {url} invalid: {e}"))
                    }
                }
            }
            Ok(resp) => {
                HealthOutcome::unhealthy(format!("jolokia at {url} returned HTTP {}", resp.status()))
            }
            Err(e) if e.is_timeout() => HealthOutcome::unhealthy(format!(
                "jolokia at {url} timed out after {}ms",
                timeout.as_millis()
            )),
            Err(e) => HealthOutcome::unhealthy(format!("jolokia request to {url} failed: {e}")),
        }
    }
}
