//! Redis-backed job store: SET with EX for state, PUBLISH/SUBSCRIBE for the
//! per-job channel. Subscriptions run a dedicated pub/sub connection each, so
//! relays never contend on a shared connection.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::store::{
    JobChannelMessage, JobStateStore, JobSubscription, ScanJob, JOB_CHANNEL_PREFIX, JOB_KEY_PREFIX,
};

pub struct RedisJobStore {
    client: redis::Client,
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisJobStore {
    pub async fn new(redis_url: &str, ttl: Duration) -> Result<Self, PipelineError> {
        info!("Connecting to job store at {}", redis_url);

        let client = redis::Client::open(redis_url)
            .map_err(|e| PipelineError::StoreUnavailable(format!("invalid redis url: {e}")))?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| PipelineError::StoreUnavailable(format!("redis connect failed: {e}")))?;

        Ok(Self { client, conn, ttl })
    }

    fn key(job_id: &str) -> String {
        format!("{JOB_KEY_PREFIX}{job_id}")
    }

    fn channel(job_id: &str) -> String {
        format!("{JOB_CHANNEL_PREFIX}{job_id}")
    }
}

#[async_trait]
impl JobStateStore for RedisJobStore {
    async fn put(&self, job_id: &str, job: &ScanJob) -> Result<(), PipelineError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::key(job_id), payload, self.ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ScanJob>, PipelineError> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(Self::key(job_id)).await?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, job_id: &str) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(job_id)).await?;
        Ok(())
    }

    async fn publish(
        &self,
        job_id: &str,
        message: &JobChannelMessage,
    ) -> Result<(), PipelineError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(Self::channel(job_id), payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, job_id: &str) -> Result<JobSubscription, PipelineError> {
        let channel = Self::channel(job_id);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| PipelineError::StoreUnavailable(format!("pubsub connect failed: {e}")))?;
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let job = job_id.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Bad channel payload for job {}: {}", job, e);
                        continue;
                    }
                };
                match serde_json::from_str::<JobChannelMessage>(&payload) {
                    Ok(message) => {
                        // Receiver dropped means the relay detached; stop relaying.
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Undecodable channel message for job {}: {}", job, e),
                }
            }
            debug!("Subscription closed for job {}", job);
        });

        Ok(JobSubscription::new(rx))
    }
}
