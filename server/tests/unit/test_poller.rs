//! Metrics poller unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use netpulse::errors::PipelineError;
use netpulse::metrics::poller::{self, MetricsPoller, MetricsUpdate};
use netpulse::metrics::source::{
    DynamicMetrics, MetricsSource, ProcessListing, StaticMetrics,
};

struct FakeSource {
    available: AtomicBool,
    fail_dynamic: AtomicBool,
    static_fetches: AtomicUsize,
    availability_checks: AtomicUsize,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            fail_dynamic: AtomicBool::new(false),
            static_fetches: AtomicUsize::new(0),
            availability_checks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MetricsSource for FakeSource {
    async fn fetch_static(&self, _device_id: &str) -> Result<StaticMetrics, PipelineError> {
        self.static_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(StaticMetrics {
            system_info: json!({ "os": "linux" }),
            hardware_info: json!({ "cores": 8 }),
        })
    }

    async fn fetch_dynamic(&self, device_id: &str) -> Result<DynamicMetrics, PipelineError> {
        if self.fail_dynamic.load(Ordering::SeqCst) {
            return Err(PipelineError::Upstream(format!(
                "no data for {device_id}"
            )));
        }
        Ok(DynamicMetrics {
            processor_metrics: json!([{ "value": 42.0 }]),
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
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst)
    }
}

/// A poller whose periodic loop effectively never fires, so tests only see
/// the pushes they trigger themselves.
fn quiet_poller(source: Arc<FakeSource>) -> Arc<MetricsPoller> {
    let options = poller::Options {
        interval: Duration::from_secs(3600),
        initial_delay: Duration::from_millis(0),
        static_max_age: Duration::from_secs(3600),
    };
    MetricsPoller::new(source, options, CancellationToken::new())
}

async fn next_update(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<MetricsUpdate>,
) -> MetricsUpdate {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for update")
        .expect("update channel closed")
}

#[tokio::test]
async fn test_first_subscriber_triggers_immediate_poll() {
    let source = Arc::new(FakeSource::new());
    let poller = quiet_poller(source);

    let (_guard, mut rx) = poller.subscribe("10.0.0.5");
    match next_update(&mut rx).await {
        MetricsUpdate::Dynamic(metrics) => {
            assert_eq!(metrics.processor_metrics, json!([{ "value": 42.0 }]));
        }
        MetricsUpdate::Error(e) => panic!("expected dynamic update, got error: {e}"),
    }
}

#[tokio::test]
async fn test_poll_failure_surfaces_as_error_update() {
    let source = Arc::new(FakeSource::new());
    source.fail_dynamic.store(true, Ordering::SeqCst);
    let poller = quiet_poller(source);

    let (_guard, mut rx) = poller.subscribe("10.0.0.5");
    match next_update(&mut rx).await {
        MetricsUpdate::Error(message) => assert!(message.contains("10.0.0.5")),
        MetricsUpdate::Dynamic(_) => panic!("expected error update"),
    }
}

#[tokio::test]
async fn test_late_subscriber_gets_latest_replayed() {
    let source = Arc::new(FakeSource::new());
    let poller = quiet_poller(source);

    let (_guard_a, mut rx_a) = poller.subscribe("10.0.0.5");
    // Wait until the immediate poll has landed, so `latest` is populated.
    assert!(matches!(
        next_update(&mut rx_a).await,
        MetricsUpdate::Dynamic(_)
    ));

    let (_guard_b, mut rx_b) = poller.subscribe("10.0.0.5");
    assert!(matches!(
        next_update(&mut rx_b).await,
        MetricsUpdate::Dynamic(_)
    ));
}

#[tokio::test]
async fn test_dropping_guard_unsubscribes_and_clears_device() {
    let source = Arc::new(FakeSource::new());
    let poller = quiet_poller(source);

    let (guard_a, _rx_a) = poller.subscribe("10.0.0.5");
    let (guard_b, _rx_b) = poller.subscribe("10.0.0.5");
    assert_eq!(poller.subscriber_count("10.0.0.5"), 2);

    drop(guard_a);
    assert_eq!(poller.subscriber_count("10.0.0.5"), 1);

    drop(guard_b);
    assert_eq!(poller.subscriber_count("10.0.0.5"), 0);
}

#[tokio::test]
async fn test_static_snapshot_is_cached() {
    let source = Arc::new(FakeSource::new());
    let poller = quiet_poller(source.clone());

    let first = poller.get_static("10.0.0.5").await.unwrap();
    let second = poller.get_static("10.0.0.5").await.unwrap();
    assert_eq!(first.system_info, second.system_info);
    assert_eq!(source.static_fetches.load(Ordering::SeqCst), 1);

    // A different device is its own cache entry.
    poller.get_static("10.0.0.6").await.unwrap();
    assert_eq!(source.static_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_wait_for_availability_bounded_retries() {
    let source = Arc::new(FakeSource::new());
    source.available.store(false, Ordering::SeqCst);
    let poller = quiet_poller(source.clone());

    let checks_before = source.availability_checks.load(Ordering::SeqCst);
    let available = poller
        .wait_for_availability("10.0.0.5", 3, Duration::from_millis(5))
        .await;
    assert!(!available);
    assert_eq!(
        source.availability_checks.load(Ordering::SeqCst) - checks_before,
        3
    );

    source.available.store(true, Ordering::SeqCst);
    assert!(
        poller
            .wait_for_availability("10.0.0.5", 3, Duration::from_millis(5))
            .await
    );
}
