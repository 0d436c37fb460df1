//! In-process job store with the same TTL and fan-out semantics as the
//! Redis backend. Used by tests and by `--memory-store` deployments that
//! run without an external store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::errors::PipelineError;
use crate::store::{JobChannelMessage, JobStateStore, JobSubscription, ScanJob};

struct Entry {
    job: ScanJob,
    expires_at: Instant,
}

pub struct MemoryJobStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<JobChannelMessage>>>,
    ttl: Duration,
}

impl MemoryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn sender(&self, job_id: &str) -> broadcast::Sender<JobChannelMessage> {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Drop the channel entry once its last receiver is gone, so the map
    /// does not accumulate senders for detached jobs.
    fn prune_idle_channel(&self, job_id: &str) {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        if channels
            .get(job_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(job_id);
        }
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.lock().expect("channel registry poisoned").len()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }
}

#[async_trait]
impl JobStateStore for MemoryJobStore {
    async fn put(&self, job_id: &str, job: &ScanJob) -> Result<(), PipelineError> {
        let mut entries = self.entries.lock().expect("entry registry poisoned");
        entries.insert(
            job_id.to_string(),
            Entry {
                job: job.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ScanJob>, PipelineError> {
        let expired;
        let job = {
            let mut entries = self.entries.lock().expect("entry registry poisoned");
            match entries.get(job_id) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    expired = false;
                    Some(entry.job.clone())
                }
                Some(_) => {
                    // Expired entries read back exactly like deleted ones.
                    entries.remove(job_id);
                    expired = true;
                    None
                }
                None => {
                    expired = false;
                    None
                }
            }
        };

        if expired {
            self.prune_idle_channel(job_id);
        }
        Ok(job)
    }

    async fn delete(&self, job_id: &str) -> Result<(), PipelineError> {
        self.entries
            .lock()
            .expect("entry registry poisoned")
            .remove(job_id);
        self.prune_idle_channel(job_id);
        Ok(())
    }

    async fn publish(
        &self,
        job_id: &str,
        message: &JobChannelMessage,
    ) -> Result<(), PipelineError> {
        // No delivery guarantee to absent subscribers, and no channel is
        // created for a job nobody listens to.
        {
            let channels = self.channels.lock().expect("channel registry poisoned");
            if let Some(sender) = channels.get(job_id) {
                let _ = sender.send(message.clone());
            }
        }
        self.prune_idle_channel(job_id);
        Ok(())
    }

    async fn subscribe(&self, job_id: &str) -> Result<JobSubscription, PipelineError> {
        let mut broadcast_rx = self.sender(job_id).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // The relay detached; release the broadcast receiver
                    // instead of parking until the next publish.
                    _ = tx.closed() => break,
                    result = broadcast_rx.recv() => match result {
                        Ok(message) => {
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(JobSubscription::new(rx))
    }
}
