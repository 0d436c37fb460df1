//! Application configuration options

use std::time::Duration;

use crate::metrics::poller;
use crate::sockets::hub;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// HTTP server configuration
    pub server: ServerOptions,

    /// Job state store configuration
    pub store: StoreOptions,

    /// External metrics source configuration
    pub metrics_source: MetricsSourceOptions,

    /// Metrics poller options
    pub poller: poller::Options,

    /// Process socket hub options
    pub hub: hub::Options,

    /// Subnet discovery options
    pub scanner: ScannerOptions,

    /// Bearer token required on the scan endpoints
    pub api_token: String,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            server: ServerOptions::default(),
            store: StoreOptions::default(),
            metrics_source: MetricsSourceOptions::default(),
            poller: poller::Options::default(),
            hub: hub::Options::default(),
            scanner: ScannerOptions::default(),
            api_token: String::new(),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Job state store options
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Redis connection URL; `None` runs on the in-process store.
    pub redis_url: Option<String>,

    /// Retention window for terminal job state
    pub job_ttl: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            redis_url: None,
            job_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// External metrics source options
#[derive(Debug, Clone)]
pub struct MetricsSourceOptions {
    /// Base URL of the Prometheus-compatible query API
    pub base_url: String,

    /// Basic auth credentials, when the source requires them
    pub username: Option<String>,
    pub password: Option<String>,

    /// Port the device exporter is scraped on
    pub exporter_port: u16,
}

impl Default for MetricsSourceOptions {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            username: None,
            password: None,
            exporter_port: 9182,
        }
    }
}

/// Subnet discovery options
#[derive(Debug, Clone)]
pub struct ScannerOptions {
    /// Handshake header value expected by monitoring agents
    pub handshake_key: String,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            handshake_key: "VERY_SECRET_KEY".to_string(),
        }
    }
}
