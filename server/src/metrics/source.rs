//! External metrics source client.
//!
//! Devices expose an exporter scraped by a Prometheus-compatible server; this
//! client queries that server per device. Static metrics are the slow-changing
//! hardware/system inventory, dynamic metrics the fast-changing performance
//! counters, and the process group feeds the process socket hub.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::PipelineError;

/// Metric names in the static (inventory) group.
const STATIC_METRICS: &[&str] = &["UNIQUE_ID_SYSTEM", "system_info", "hardware_info"];

/// Metric names in the dynamic (performance counter) group.
const DYNAMIC_METRICS: &[&str] = &[
    "cpu_usage_percent",
    "memory_usage_bytes",
    "disk_io_bytes",
    "network_io_bytes",
];

/// Metric names in the process group, as emitted by the device exporter.
const PROCESS_COUNT_METRIC: &str = "active_proccess_list";
const PROCESS_MEMORY_METRIC: &str = "active_proccess_memory_usage";
const PROCESS_CPU_METRIC: &str = "proccess_cpu_usage_percent";

/// Hardware/system inventory for one device. Expensive to become available
/// after a device first appears; cached for a day by the poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticMetrics {
    pub system_info: Value,
    pub hardware_info: Value,
}

/// Fast-changing counters for one device, replaced on each poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicMetrics {
    pub processor_metrics: Value,
    pub memory_metrics: Value,
    pub disk_metrics: Value,
    pub network_metrics: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub name: String,
    pub pid: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// Snapshot of the device's process table, pushed over the socket hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessListing {
    pub processes: Vec<ProcessInfo>,
    pub total: usize,
}

/// The external metrics source collaborator. Per-device failures must stay
/// isolated: an error for one device never affects another.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch_static(&self, device_id: &str) -> Result<StaticMetrics, PipelineError>;

    async fn fetch_dynamic(&self, device_id: &str) -> Result<DynamicMetrics, PipelineError>;

    async fn fetch_processes(&self, device_id: &str) -> Result<ProcessListing, PipelineError>;

    /// Whether static data is scrapeable for the device yet. A freshly
    /// discovered device may take a while to appear in the source.
    async fn check_available(&self, device_id: &str) -> bool;
}

pub struct HttpMetricsSource {
    http: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    exporter_port: u16,
}

impl HttpMetricsSource {
    pub fn new(
        base_url: &str,
        username: Option<String>,
        password: Option<String>,
        exporter_port: u16,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            exporter_port,
        }
    }

    /// Instant query for one metric name, scoped to the device's exporter
    /// instance. Returns the raw result vector.
    async fn query(&self, metric: &str, device_id: &str) -> Result<Vec<Value>, PipelineError> {
        let instance = format!("{}:{}", device_id, self.exporter_port);
        let query = format!("{metric}{{instance=\"{instance}\"}}");
        let url = format!("{}/api/v1/query", self.base_url);
        debug!("Metrics query: {}", query);

        let mut request = self.http.get(&url).query(&[("query", query.as_str())]);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await.map_err(|e| {
            PipelineError::Upstream(format!("metrics source unreachable: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(PipelineError::Upstream(format!(
                "metrics source returned {}",
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        if body.get("status").and_then(Value::as_str) != Some("success") {
            return Err(PipelineError::Upstream("metrics query failed".into()));
        }

        Ok(body
            .pointer("/data/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_group(
        &self,
        metrics: &[&str],
        device_id: &str,
    ) -> Result<Value, PipelineError> {
        let mut grouped = serde_json::Map::new();
        for metric in metrics {
            let result = self.query(metric, device_id).await?;
            grouped.insert((*metric).to_string(), Value::Array(result));
        }
        Ok(Value::Object(grouped))
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch_static(&self, device_id: &str) -> Result<StaticMetrics, PipelineError> {
        let grouped = self.query_group(STATIC_METRICS, device_id).await?;
        Ok(StaticMetrics {
            system_info: grouped
                .get("system_info")
                .cloned()
                .unwrap_or(Value::Null),
            hardware_info: grouped
                .get("hardware_info")
                .cloned()
                .unwrap_or(Value::Null),
        })
    }

    async fn fetch_dynamic(&self, device_id: &str) -> Result<DynamicMetrics, PipelineError> {
        let grouped = self.query_group(DYNAMIC_METRICS, device_id).await?;
        Ok(DynamicMetrics {
            processor_metrics: grouped
                .get("cpu_usage_percent")
                .cloned()
                .unwrap_or(Value::Null),
            memory_metrics: grouped
                .get("memory_usage_bytes")
                .cloned()
                .unwrap_or(Value::Null),
            disk_metrics: grouped
                .get("disk_io_bytes")
                .cloned()
                .unwrap_or(Value::Null),
            network_metrics: grouped
                .get("network_io_bytes")
                .cloned()
                .unwrap_or(Value::Null),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_processes(&self, device_id: &str) -> Result<ProcessListing, PipelineError> {
        let memory = self.query(PROCESS_MEMORY_METRIC, device_id).await?;
        let cpu = self.query(PROCESS_CPU_METRIC, device_id).await?;
        let count = self.query(PROCESS_COUNT_METRIC, device_id).await?;
        Ok(parse_process_listing(&memory, &cpu, &count))
    }

    async fn check_available(&self, device_id: &str) -> bool {
        match self.query(STATIC_METRICS[0], device_id).await {
            Ok(result) => !result.is_empty(),
            Err(_) => false,
        }
    }
}

/// Join the per-process memory and cpu series on (process, pid) labels.
fn parse_process_listing(memory: &[Value], cpu: &[Value], count: &[Value]) -> ProcessListing {
    fn label<'a>(sample: &'a Value, name: &str) -> Option<&'a str> {
        sample.pointer(&format!("/metric/{name}")).and_then(Value::as_str)
    }

    fn sample_value(sample: &Value) -> f64 {
        sample
            .pointer("/value/1")
            .and_then(Value::as_str)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    let mut processes: Vec<ProcessInfo> = memory
        .iter()
        .filter_map(|sample| {
            let name = label(sample, "process")?;
            let pid = label(sample, "pid")?;
            let cpu_usage = cpu
                .iter()
                .find(|c| label(c, "pid") == Some(pid) && label(c, "process") == Some(name))
                .map(sample_value)
                .unwrap_or(0.0);
            Some(ProcessInfo {
                name: name.to_string(),
                pid: pid.to_string(),
                cpu_usage,
                memory_usage: sample_value(sample),
            })
        })
        .collect();

    processes.sort_by(|a, b| {
        b.memory_usage
            .partial_cmp(&a.memory_usage)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total = count
        .first()
        .map(sample_value)
        .filter(|v| *v > 0.0)
        .map(|v| v as usize)
        .unwrap_or(processes.len());

    ProcessListing { processes, total }
}
