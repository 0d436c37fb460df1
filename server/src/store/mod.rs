//! Durable, TTL-bounded scan job state plus a per-job pub/sub channel.
//!
//! The queue writes every transition twice: `put` so late subscribers can
//! recover current state, and `publish` so live subscribers get push updates.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::PipelineError;
use crate::scan::types::{DiscoveredAgent, ScanOptions};

pub use self::memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

/// Scan job lifecycle. `Queued` and `Running` are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

/// Full persisted state of one subnet scan job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub id: String,
    pub status: ScanStatus,

    /// Advisory 0-100, monotonically non-decreasing while `Running`.
    pub progress: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ScanOptions>,

    /// Present only once terminal and successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<DiscoveredAgent>>,

    /// Present only on failure or cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn new(id: String, options: Option<ScanOptions>, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: ScanStatus::Queued,
            progress: 0,
            options,
            result: None,
            error: None,
            user_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Partial view broadcast on the job channel.
    pub fn to_message(&self) -> JobChannelMessage {
        JobChannelMessage {
            status: self.status,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Partial view of a job's mutable fields, broadcast on its channel.
/// Consumed transiently by relays, never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobChannelMessage {
    pub status: ScanStatus,
    pub progress: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<DiscoveredAgent>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Live handle onto one job's channel. Messages arrive in publish order.
/// Dropping the subscription releases the underlying channel resources.
pub struct JobSubscription {
    rx: mpsc::UnboundedReceiver<JobChannelMessage>,
}

impl JobSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<JobChannelMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<JobChannelMessage> {
        self.rx.recv().await
    }
}

/// Durable key/value record per scan job plus a pub/sub channel keyed by job id.
///
/// Expired entries are indistinguishable from deleted ones: both `get` as
/// `None`. An unreachable backing store surfaces as
/// [`PipelineError::StoreUnavailable`].
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Persist/overwrite job state with a bounded expiry.
    async fn put(&self, job_id: &str, job: &ScanJob) -> Result<(), PipelineError>;

    async fn get(&self, job_id: &str) -> Result<Option<ScanJob>, PipelineError>;

    async fn delete(&self, job_id: &str) -> Result<(), PipelineError>;

    /// Fire-and-forget broadcast to current subscribers of this job's channel.
    async fn publish(&self, job_id: &str, message: &JobChannelMessage)
        -> Result<(), PipelineError>;

    /// Attach to the job's channel. Each subscriber gets its own independent
    /// stream; fan-out to N subscribers is supported.
    async fn subscribe(&self, job_id: &str) -> Result<JobSubscription, PipelineError>;
}

pub(crate) const JOB_KEY_PREFIX: &str = "network_scan_job:";
pub(crate) const JOB_CHANNEL_PREFIX: &str = "network_scan_job_channel:";
