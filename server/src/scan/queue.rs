//! Scan job queue: accepts scan requests, runs subnet discovery one job at a
//! time, and advances job state through the store on every transition.
//!
//! State machine: QUEUED -> RUNNING -> {COMPLETED, FAILED, CANCELLED}.
//! Cancellation is cooperative: a per-job token that the discovery loop
//! checks between probe chunks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::scan::discovery::SubnetProber;
use crate::scan::types::ScanOptions;
use crate::store::{JobStateStore, ScanJob, ScanStatus};

struct QueuedJob {
    id: String,
    options: ScanOptions,
    user_id: Option<String>,
}

pub struct ScanJobQueue {
    store: Arc<dyn JobStateStore>,
    jobs_tx: mpsc::UnboundedSender<QueuedJob>,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl ScanJobQueue {
    /// Create the queue and spawn its worker task. The worker drains jobs
    /// sequentially until `shutdown` fires.
    pub fn new(
        store: Arc<dyn JobStateStore>,
        prober: Arc<SubnetProber>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let queue = Arc::new(Self {
            store,
            jobs_tx,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
        });

        let worker = queue.clone();
        tokio::spawn(async move {
            worker.run(prober, jobs_rx, shutdown).await;
        });

        queue
    }

    /// Create a job in QUEUED state and schedule it. Returns the fresh job id
    /// immediately; execution happens on the worker task.
    pub async fn enqueue(
        &self,
        options: ScanOptions,
        user_id: Option<String>,
    ) -> Result<String, PipelineError> {
        options.validate()?;

        let id = Uuid::new_v4().to_string();
        let job = ScanJob::new(id.clone(), Some(options.clone()), user_id.clone());

        self.store.put(&id, &job).await?;
        self.store.publish(&id, &job.to_message()).await?;

        self.cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .insert(id.clone(), CancellationToken::new());

        self.jobs_tx
            .send(QueuedJob {
                id: id.clone(),
                options,
                user_id,
            })
            .map_err(|_| PipelineError::ServerError("scan worker is not running".into()))?;

        info!("Scan job {} enqueued", id);
        Ok(id)
    }

    /// Cooperative cancel. Accepted only while the job is QUEUED or RUNNING;
    /// a terminal job reports [`PipelineError::AlreadyFinished`], an unknown
    /// one [`PipelineError::NotFound`].
    pub async fn cancel(&self, job_id: &str) -> Result<(), PipelineError> {
        let Some(mut job) = self.store.get(job_id).await? else {
            return Err(PipelineError::NotFound(format!("scan job {job_id}")));
        };

        if job.status.is_terminal() {
            return Err(PipelineError::AlreadyFinished);
        }

        if let Some(token) = self
            .cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .get(job_id)
        {
            token.cancel();
        }

        job.status = ScanStatus::Cancelled;
        job.progress = 0;
        job.error = Some("Cancelled by user".to_string());
        job.updated_at = chrono::Utc::now();

        self.store.put(job_id, &job).await?;
        self.store.publish(job_id, &job.to_message()).await?;

        warn!("Scan job {} cancelled", job_id);
        Ok(())
    }

    async fn run(
        &self,
        prober: Arc<SubnetProber>,
        mut jobs_rx: mpsc::UnboundedReceiver<QueuedJob>,
        shutdown: CancellationToken,
    ) {
        info!("Scan worker starting...");

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scan worker shutting down...");
                    return;
                }
                job = jobs_rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            };

            self.process(&prober, job).await;
        }
    }

    async fn process(&self, prober: &SubnetProber, queued: QueuedJob) {
        let job_id = queued.id.clone();
        let token = self.cancellation_token(&job_id);

        if token.is_cancelled() {
            warn!("Skipping cancelled job {} before start", job_id);
            self.write_terminal(
                &queued,
                ScanStatus::Cancelled,
                0,
                None,
                Some("Cancelled before start".to_string()),
            )
            .await;
            self.forget(&job_id);
            return;
        }

        info!("Starting scan job {}", job_id);
        self.write_running(&queued, 0).await;

        let last_progress = Arc::new(AtomicU8::new(0));
        let queued_ref = &queued;
        let result = prober
            .scan(&queued.options, &token, |probed, total| {
                let last_progress = last_progress.clone();
                let token = token.clone();
                async move {
                    if token.is_cancelled() {
                        return;
                    }
                    let percent = progress_percent(probed, total);
                    // Progress is monotonically non-decreasing while RUNNING.
                    if percent > last_progress.fetch_max(percent, Ordering::SeqCst) {
                        self.write_running(queued_ref, percent).await;
                    }
                }
            })
            .await;

        match result {
            Ok(_) if token.is_cancelled() => {
                warn!("Scan job {} cancelled during execution", job_id);
                self.write_terminal(
                    &queued,
                    ScanStatus::Cancelled,
                    0,
                    None,
                    Some("Cancelled by user".to_string()),
                )
                .await;
            }
            Ok(agents) => {
                info!("Scan job {} completed, {} agents", job_id, agents.len());
                self.write_terminal(&queued, ScanStatus::Completed, 100, Some(agents), None)
                    .await;
            }
            Err(e) => {
                error!("Scan job {} failed: {}", job_id, e);
                self.write_terminal(&queued, ScanStatus::Failed, 0, None, Some(e.to_string()))
                    .await;
            }
        }

        self.forget(&job_id);
    }

    async fn write_running(&self, queued: &QueuedJob, progress: u8) {
        let mut job = self.load_or_new(queued).await;
        // A concurrent cancel may already have finished the job; progress
        // never flows after a terminal state.
        if job.status.is_terminal() {
            return;
        }
        job.status = ScanStatus::Running;
        job.progress = progress;
        job.updated_at = chrono::Utc::now();
        self.save(&queued.id, &job).await;
    }

    async fn write_terminal(
        &self,
        queued: &QueuedJob,
        status: ScanStatus,
        progress: u8,
        result: Option<Vec<crate::scan::types::DiscoveredAgent>>,
        error: Option<String>,
    ) {
        let mut job = self.load_or_new(queued).await;
        // A record that already reached a different terminal state stays as
        // it is; a late worker result must not overwrite a cancellation.
        if job.status.is_terminal() && job.status != status {
            return;
        }
        job.status = status;
        job.progress = progress;
        job.result = result;
        job.error = error;
        job.updated_at = chrono::Utc::now();
        self.save(&queued.id, &job).await;
    }

    async fn load_or_new(&self, queued: &QueuedJob) -> ScanJob {
        match self.store.get(&queued.id).await {
            Ok(Some(job)) => job,
            _ => ScanJob::new(
                queued.id.clone(),
                Some(queued.options.clone()),
                queued.user_id.clone(),
            ),
        }
    }

    async fn save(&self, job_id: &str, job: &ScanJob) {
        if let Err(e) = self.store.put(job_id, job).await {
            error!("Failed to persist scan state for {}: {}", job_id, e);
        }
        if let Err(e) = self.store.publish(job_id, &job.to_message()).await {
            error!("Failed to publish scan state for {}: {}", job_id, e);
        }
    }

    fn cancellation_token(&self, job_id: &str) -> CancellationToken {
        self.cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    fn forget(&self, job_id: &str) {
        self.cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .remove(job_id);
    }
}

fn progress_percent(probed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (((probed * 100) / total).min(100)) as u8
}
