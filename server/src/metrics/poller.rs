//! Per-device metrics polling and fan-out.
//!
//! One background loop polls the external source for every device that has at
//! least one live subscriber and pushes each reading to all of that device's
//! subscribers. Each subscriber owns a receive-only channel endpoint; dropping
//! the guard unsubscribes. A device with no subscribers left is dropped from
//! the registry and stops being polled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::PipelineError;
use crate::metrics::source::{DynamicMetrics, MetricsSource, StaticMetrics};

/// One reading pushed to subscribers. Poll failures are reported as
/// error-shaped updates rather than silently dropped, so relays can surface
/// connectivity problems to observers.
#[derive(Debug, Clone)]
pub enum MetricsUpdate {
    Dynamic(DynamicMetrics),
    Error(String),
}

/// Poller options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval for dynamic metrics
    pub interval: Duration,

    /// Initial delay before the first collection pass
    pub initial_delay: Duration,

    /// How long a cached static snapshot stays fresh
    pub static_max_age: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(1),
            static_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

struct DeviceSlot {
    subscribers: HashMap<u64, mpsc::UnboundedSender<MetricsUpdate>>,
    latest: Option<DynamicMetrics>,
}

pub struct MetricsPoller {
    source: Arc<dyn MetricsSource>,
    options: Options,
    devices: Mutex<HashMap<String, DeviceSlot>>,
    static_cache: Mutex<HashMap<String, (Instant, StaticMetrics)>>,
    next_subscriber_id: AtomicU64,
}

/// Releases its subscription on drop. A subscriber never outlives the
/// connection that owns this guard.
pub struct SubscriptionGuard {
    poller: Arc<MetricsPoller>,
    device_id: String,
    handle: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.poller.unsubscribe(&self.device_id, self.handle);
    }
}

impl MetricsPoller {
    /// Create the poller and spawn its collection loop, which runs until
    /// `shutdown` fires.
    pub fn new(
        source: Arc<dyn MetricsSource>,
        options: Options,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let poller = Arc::new(Self {
            source,
            options,
            devices: Mutex::new(HashMap::new()),
            static_cache: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
        });

        let runner = poller.clone();
        tokio::spawn(async move {
            runner.run(shutdown).await;
        });

        poller
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Metrics poller starting...");
        tokio::time::sleep(self.options.initial_delay).await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Metrics poller shutting down...");
                    return;
                }
                _ = tokio::time::sleep(self.options.interval) => {}
            }

            self.collect().await;
        }
    }

    async fn collect(&self) {
        let device_ids: Vec<String> = {
            let devices = self.devices.lock().expect("device registry poisoned");
            devices
                .iter()
                .filter(|(_, slot)| !slot.subscribers.is_empty())
                .map(|(id, _)| id.clone())
                .collect()
        };

        if device_ids.is_empty() {
            return;
        }

        debug!("Polling {} device(s)", device_ids.len());
        let updates = device_ids.iter().map(|id| self.update_device(id));
        futures::future::join_all(updates).await;
    }

    /// Poll one device and push the result. Failures stay confined to this
    /// device's subscribers.
    async fn update_device(&self, device_id: &str) {
        match self.source.fetch_dynamic(device_id).await {
            Ok(metrics) => {
                let mut devices = self.devices.lock().expect("device registry poisoned");
                if let Some(slot) = devices.get_mut(device_id) {
                    slot.latest = Some(metrics.clone());
                }
                drop(devices);
                self.push(device_id, MetricsUpdate::Dynamic(metrics));
            }
            Err(e) => {
                warn!("Metrics poll failed for device {}: {}", device_id, e);
                self.push(device_id, MetricsUpdate::Error(e.to_string()));
            }
        }
    }

    fn push(&self, device_id: &str, update: MetricsUpdate) {
        let mut devices = self.devices.lock().expect("device registry poisoned");
        if let Some(slot) = devices.get_mut(device_id) {
            slot.subscribers
                .retain(|_, tx| tx.send(update.clone()).is_ok());
        }
    }

    /// Register a subscriber for a device's dynamic updates. The last known
    /// reading, if any, is replayed immediately. Multiple subscribers per
    /// device are independent.
    pub fn subscribe(
        self: &Arc<Self>,
        device_id: &str,
    ) -> (SubscriptionGuard, mpsc::UnboundedReceiver<MetricsUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);

        let first_subscriber = {
            let mut devices = self.devices.lock().expect("device registry poisoned");
            let slot = devices.entry(device_id.to_string()).or_insert_with(|| DeviceSlot {
                subscribers: HashMap::new(),
                latest: None,
            });
            if let Some(latest) = &slot.latest {
                let _ = tx.send(MetricsUpdate::Dynamic(latest.clone()));
            }
            let first = slot.subscribers.is_empty();
            slot.subscribers.insert(handle, tx);
            first
        };

        // A fresh device gets an immediate poll instead of waiting a full
        // interval for its first reading.
        if first_subscriber {
            let poller = self.clone();
            let id = device_id.to_string();
            tokio::spawn(async move {
                poller.update_device(&id).await;
            });
        }

        let guard = SubscriptionGuard {
            poller: self.clone(),
            device_id: device_id.to_string(),
            handle,
        };
        (guard, rx)
    }

    fn unsubscribe(&self, device_id: &str, handle: u64) {
        let mut devices = self.devices.lock().expect("device registry poisoned");
        if let Some(slot) = devices.get_mut(device_id) {
            slot.subscribers.remove(&handle);
            if slot.subscribers.is_empty() {
                devices.remove(device_id);
                debug!("Device {} dropped from polling registry", device_id);
            }
        }
    }

    /// Poll the source up to `max_attempts` times, `interval` apart, until
    /// static data is obtainable. Initial unavailability is expected for
    /// freshly discovered devices and must not be treated as permanent.
    pub async fn wait_for_availability(
        &self,
        device_id: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> bool {
        info!("Waiting for metrics availability for {}...", device_id);

        for attempt in 1..=max_attempts {
            if self.source.check_available(device_id).await {
                info!("Metrics available for {}", device_id);
                return true;
            }
            debug!(
                "No metrics available yet for {} (attempt {}/{})",
                device_id, attempt, max_attempts
            );
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        false
    }

    /// One-shot fetch of the static half, independent of subscriptions.
    /// Cached until `static_max_age` elapses.
    pub async fn get_static(&self, device_id: &str) -> Result<StaticMetrics, PipelineError> {
        {
            let cache = self.static_cache.lock().expect("static cache poisoned");
            if let Some((fetched_at, data)) = cache.get(device_id) {
                if fetched_at.elapsed() < self.options.static_max_age {
                    return Ok(data.clone());
                }
            }
        }

        let data = self.source.fetch_static(device_id).await.map_err(|e| {
            error!("Static fetch failed for device {}: {}", device_id, e);
            e
        })?;

        self.static_cache
            .lock()
            .expect("static cache poisoned")
            .insert(device_id.to_string(), (Instant::now(), data.clone()));

        Ok(data)
    }

    /// Number of live subscribers for a device. Zero once all guards dropped.
    pub fn subscriber_count(&self, device_id: &str) -> usize {
        self.devices
            .lock()
            .expect("device registry poisoned")
            .get(device_id)
            .map(|slot| slot.subscribers.len())
            .unwrap_or(0)
    }
}
