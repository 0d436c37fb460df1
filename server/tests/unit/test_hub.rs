//! Process socket hub lifecycle tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use netpulse::errors::PipelineError;
use netpulse::metrics::source::{
    DynamicMetrics, MetricsSource, ProcessInfo, ProcessListing, StaticMetrics,
};
use netpulse::sockets::hub::{self, HubSupervisor};

struct StubSource;

#[async_trait]
impl MetricsSource for StubSource {
    async fn fetch_static(&self, _device_id: &str) -> Result<StaticMetrics, PipelineError> {
        Ok(StaticMetrics {
            system_info: json!({}),
            hardware_info: json!({}),
        })
    }

    async fn fetch_dynamic(&self, _device_id: &str) -> Result<DynamicMetrics, PipelineError> {
        Ok(DynamicMetrics {
            processor_metrics: json!([]),
            memory_metrics: json!([]),
            disk_metrics: json!([]),
            network_metrics: json!([]),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_processes(&self, _device_id: &str) -> Result<ProcessListing, PipelineError> {
        Ok(ProcessListing {
            processes: vec![ProcessInfo {
                name: "init".to_string(),
                pid: "1".to_string(),
                cpu_usage: 0.1,
                memory_usage: 1024.0,
            }],
            total: 1,
        })
    }

    async fn check_available(&self, _device_id: &str) -> bool {
        true
    }
}

fn supervisor() -> HubSupervisor {
    let options = hub::Options {
        host: "127.0.0.1".to_string(),
        // Ephemeral port so parallel test runs never collide.
        port: 0,
        push_interval: Duration::from_millis(50),
    };
    HubSupervisor::new(options, Arc::new(StubSource), CancellationToken::new())
}

#[tokio::test]
async fn test_ensure_started_is_idempotent() {
    let supervisor = supervisor();

    let first = supervisor.ensure_started().await.unwrap();
    let second = supervisor.ensure_started().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second), "running hub must be reused");

    assert!(!first.has_connection("10.0.0.5"));
}

#[tokio::test]
async fn test_stop_then_restart_creates_fresh_hub() {
    let supervisor = supervisor();

    let first = supervisor.ensure_started().await.unwrap();
    supervisor.stop().await;
    // Stopping again is a no-op.
    supervisor.stop().await;

    let second = supervisor.ensure_started().await.unwrap();
    assert!(
        !Arc::ptr_eq(&first, &second),
        "a stopped hub must be replaced, not resurrected"
    );
    supervisor.stop().await;
}

#[tokio::test]
async fn test_shutdown_token_tears_down_hub() {
    let shutdown = CancellationToken::new();
    let options = hub::Options {
        host: "127.0.0.1".to_string(),
        port: 0,
        push_interval: Duration::from_millis(50),
    };
    let supervisor = HubSupervisor::new(options, Arc::new(StubSource), shutdown.clone());

    supervisor.ensure_started().await.unwrap();
    shutdown.cancel();

    // The serve task exits once the token fires; the next ensure_started
    // observes the dead task and recreates the hub.
    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.ensure_started().await.unwrap();
    supervisor.stop().await;
}
