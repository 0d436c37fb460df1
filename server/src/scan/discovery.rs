//! Subnet discovery primitive.
//!
//! Probes every host of a /24 over HTTP, looking for monitoring agents that
//! answer on the agent port with a metrics page carrying their identity key.
//! Concurrency is bounded per chunk to avoid flooding the network interface.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::scan::types::{DiscoveredAgent, ScanOptions};

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONCURRENCY: usize = 25;
const DEFAULT_AGENT_PORT: u16 = 9182;

/// Marker emitted by agents on their metrics page, carrying the agent key.
const AGENT_KEY_MARKER: &str = "UNIQUE_ID_SYSTEM{uuid=\"";

/// External device registry collaborator: answers whether an agent key is
/// already known to the persistent inventory.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn is_registered(&self, agent_key: &str) -> bool;
}

/// Registry used when no inventory is wired up: every agent reads as new.
pub struct NullDeviceRegistry;

#[async_trait]
impl DeviceRegistry for NullDeviceRegistry {
    async fn is_registered(&self, _agent_key: &str) -> bool {
        false
    }
}

pub struct SubnetProber {
    http: reqwest::Client,
    registry: Arc<dyn DeviceRegistry>,
    handshake_key: String,
}

impl SubnetProber {
    pub fn new(registry: Arc<dyn DeviceRegistry>, handshake_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            registry,
            handshake_key,
        }
    }

    /// Scan all hosts of the subnet in `options`, invoking `on_progress` with
    /// `(probed, total)` after each chunk. Cancellation is checked between
    /// chunks; a cancelled scan returns the agents accumulated so far.
    pub async fn scan<F, Fut>(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<Vec<DiscoveredAgent>, PipelineError>
    where
        F: Fn(usize, usize) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let subnet = match &options.subnet {
            Some(subnet) => subnet.clone(),
            None => current_subnet()?,
        };
        let net: Ipv4Net = subnet
            .parse()
            .map_err(|e| PipelineError::InvalidOptions(format!("Invalid subnet {subnet}: {e}")))?;

        let timeout = Duration::from_millis(options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let concurrency = options.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1);
        let agent_port = options.agent_port.unwrap_or(DEFAULT_AGENT_PORT);

        let hosts: Vec<String> = net.hosts().map(|ip| ip.to_string()).collect();
        let total = hosts.len();
        info!("Scanning {} hosts in {}", total, subnet);

        let mut agents = Vec::new();
        let mut probed = 0usize;

        for chunk in hosts.chunks(concurrency) {
            if cancel.is_cancelled() {
                info!("Scan cancelled after {}/{} hosts", probed, total);
                return Ok(agents);
            }

            let probes = chunk
                .iter()
                .map(|ip| self.probe_agent(ip, agent_port, timeout));
            let results = futures::future::join_all(probes).await;

            probed += chunk.len();
            for agent in results.into_iter().flatten() {
                debug!(
                    "Found agent: ip={} key={} registered={}",
                    agent.ip_address, agent.agent_key, agent.is_registered
                );
                agents.push(agent);
            }

            on_progress(probed, total).await;
        }

        info!("Scan complete: {} agents found", agents.len());
        Ok(agents)
    }

    /// One-shot liveness probe for a known address.
    pub async fn check_agent(&self, ip: &str) -> bool {
        self.probe_agent(ip, DEFAULT_AGENT_PORT, Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .await
            .is_some()
    }

    async fn probe_agent(
        &self,
        ip: &str,
        agent_port: u16,
        timeout: Duration,
    ) -> Option<DiscoveredAgent> {
        let url = format!("http://{ip}:{agent_port}/metrics");
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .header("X-Agent-Handshake-Key", &self.handshake_key)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let body = response.text().await.ok()?;
        let agent_key = extract_agent_key(&body)?;
        let is_registered = self.registry.is_registered(&agent_key).await;

        Some(DiscoveredAgent {
            ip_address: ip.to_string(),
            agent_key,
            is_registered,
        })
    }
}

/// Pull the agent key out of a metrics page body.
pub(crate) fn extract_agent_key(body: &str) -> Option<String> {
    let start = body.find(AGENT_KEY_MARKER)? + AGENT_KEY_MARKER.len();
    let rest = &body[start..];
    let end = rest.find('"')?;
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

/// The /24 of the primary outbound interface, e.g. `192.168.1.0/24`.
///
/// Resolved by a connected UDP socket; no packet is sent.
pub fn current_subnet() -> Result<String, PipelineError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80").map_err(|_| {
        PipelineError::ConfigError("No active network interfaces found".to_string())
    })?;
    let local = socket.local_addr()?;

    match local.ip() {
        std::net::IpAddr::V4(ip) => {
            let [a, b, c, _] = ip.octets();
            Ok(format!("{a}.{b}.{c}.0/24"))
        }
        std::net::IpAddr::V6(_) => {
            warn!("Primary interface is IPv6 only, cannot derive /24");
            Err(PipelineError::ConfigError(
                "No active IPv4 network interfaces found".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_agent_key_from_metrics_body() {
        let body = "# HELP stuff\nUNIQUE_ID_SYSTEM{uuid=\"AGT-1\"} 1\nother 2\n";
        assert_eq!(extract_agent_key(body).as_deref(), Some("AGT-1"));
    }

    #[test]
    fn missing_or_empty_key_yields_none() {
        assert!(extract_agent_key("no marker here").is_none());
        assert!(extract_agent_key("UNIQUE_ID_SYSTEM{uuid=\"\"} 1").is_none());
    }
}
