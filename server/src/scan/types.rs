//! Scan option and result types shared by the queue, the discovery primitive
//! and the REST surface.

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// Options accepted at enqueue time. Opaque to the queue itself; validated at
/// the API boundary before a job is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
    /// Subnet in `x.x.x.0/24` form. Absent means "scan the current subnet".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// Per-probe timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Number of hosts probed concurrently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// Port the monitoring agent listens on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_port: Option<u16>,
}

impl ScanOptions {
    /// Reject malformed options synchronously, before the worker ever sees
    /// them. Only `/24` networks with a zero host octet are scannable.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let Some(subnet) = &self.subnet {
            validate_subnet(subnet)?;
        }
        if self.concurrency == Some(0) {
            return Err(PipelineError::InvalidOptions(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

pub fn validate_subnet(subnet: &str) -> Result<(), PipelineError> {
    let malformed =
        || PipelineError::InvalidOptions(format!("Subnet must be in format: xxx.xxx.xxx.0/24, got {subnet}"));

    let (addr, prefix) = subnet.split_once('/').ok_or_else(malformed)?;
    if prefix != "24" {
        return Err(malformed());
    }
    let octets: Vec<&str> = addr.split('.').collect();
    if octets.len() != 4 || octets[3] != "0" {
        return Err(malformed());
    }
    for octet in &octets[..3] {
        octet.parse::<u8>().map_err(|_| malformed())?;
    }
    Ok(())
}

/// A monitorable agent discovered during a scan. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredAgent {
    pub ip_address: String,

    /// Opaque identity string reported by the agent itself.
    pub agent_key: String,

    /// Whether that agent key is already known to the device registry.
    pub is_registered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_slash_24_with_zero_host() {
        assert!(validate_subnet("192.168.1.0/24").is_ok());
        assert!(validate_subnet("10.0.0.0/24").is_ok());
    }

    #[test]
    fn rejects_malformed_subnets() {
        for bad in [
            "192.168.1.0",
            "192.168.1.5/24",
            "192.168.1.0/16",
            "300.0.0.0/24",
            "not-a-subnet",
        ] {
            assert!(validate_subnet(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn zero_concurrency_rejected() {
        let options = ScanOptions {
            concurrency: Some(0),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
