//! Metrics relay event-ordering tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use netpulse::errors::PipelineError;
use netpulse::metrics::poller::{self, MetricsPoller};
use netpulse::metrics::source::{
    DynamicMetrics, MetricsSource, ProcessListing, StaticMetrics,
};
use netpulse::scan::discovery::{NullDeviceRegistry, SubnetProber};
use netpulse::scan::queue::ScanJobQueue;
use netpulse::server::sse;
use netpulse::server::state::ServerState;
use netpulse::sockets::hub::{self, HubSupervisor};
use netpulse::store::{JobStateStore, MemoryJobStore};

/// Static data never becomes available, and availability checks are slow
/// while dynamic fetches answer instantly. The relay must still announce the
/// waiting state before the first dynamic reading.
struct SlowStaticSource;

#[async_trait]
impl MetricsSource for SlowStaticSource {
    async fn fetch_static(&self, _device_id: &str) -> Result<StaticMetrics, PipelineError> {
        Err(PipelineError::Upstream("no static data".to_string()))
    }

    async fn fetch_dynamic(&self, _device_id: &str) -> Result<DynamicMetrics, PipelineError> {
        Ok(DynamicMetrics {
            processor_metrics: json!([{ "value": 1.0 }]),
            memory_metrics: json!([]),
            disk_metrics: json!([]),
            network_metrics: json!([]),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_processes(&self, _device_id: &str) -> Result<ProcessListing, PipelineError> {
        Ok(ProcessListing {
            processes: vec![],
            total: 0,
        })
    }

    async fn check_available(&self, _device_id: &str) -> bool {
        tokio::time::sleep(Duration::from_millis(100)).await;
        false
    }
}

fn test_state(source: Arc<SlowStaticSource>) -> Arc<ServerState> {
    let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::default());
    let prober = Arc::new(SubnetProber::new(
        Arc::new(NullDeviceRegistry),
        "test-key".to_string(),
    ));
    let queue = ScanJobQueue::new(store.clone(), prober, CancellationToken::new());

    let poller_options = poller::Options {
        interval: Duration::from_secs(3600),
        initial_delay: Duration::from_millis(0),
        static_max_age: Duration::from_secs(3600),
    };
    let poller = MetricsPoller::new(source.clone(), poller_options, CancellationToken::new());

    let hub_options = hub::Options {
        host: "127.0.0.1".to_string(),
        port: 0,
        push_interval: Duration::from_millis(50),
    };
    let hub = Arc::new(HubSupervisor::new(
        hub_options,
        source.clone(),
        CancellationToken::new(),
    ));

    let store: Arc<dyn JobStateStore> = store;
    Arc::new(ServerState::new(
        store,
        queue,
        poller,
        source,
        hub,
        "test-token".to_string(),
    ))
}

/// Read the wire-encoded SSE body until `count` events (blank-line
/// separated blocks) have arrived.
async fn read_events(body: axum::body::Body, count: usize) -> Vec<String> {
    let mut stream = body.into_data_stream();
    let mut buffer = String::new();

    while buffer.matches("\n\n").count() < count {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for SSE events")
            .expect("SSE body ended early")
            .expect("SSE body errored");
        buffer.push_str(std::str::from_utf8(&chunk).expect("SSE body must be UTF-8"));
    }

    buffer
        .split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .take(count)
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_waiting_notice_precedes_first_dynamic_event() {
    let state = test_state(Arc::new(SlowStaticSource));

    let response = sse::metrics_stream(state, "10.0.0.5".to_string())
        .await
        .into_response();
    let events = read_events(response.into_body(), 3).await;

    assert!(
        events[0].contains("connected"),
        "first event must announce the connection: {}",
        events[0]
    );
    assert!(
        events[1].contains("waiting_static"),
        "waiting notice must precede dynamic data: {}",
        events[1]
    );
    assert!(
        events[2].contains("dynamic"),
        "dynamic data flows after the waiting notice: {}",
        events[2]
    );
}
