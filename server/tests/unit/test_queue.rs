//! Scan job queue unit tests
//!
//! Scans target 192.0.2.0/24 (TEST-NET-1), which never hosts a real agent,
//! so every probe fails fast and jobs complete with an empty result.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use netpulse::errors::PipelineError;
use netpulse::scan::discovery::{NullDeviceRegistry, SubnetProber};
use netpulse::scan::queue::ScanJobQueue;
use netpulse::scan::types::ScanOptions;
use netpulse::store::{JobStateStore, MemoryJobStore, ScanJob, ScanStatus};

fn test_queue(store: Arc<MemoryJobStore>) -> Arc<ScanJobQueue> {
    let prober = Arc::new(SubnetProber::new(
        Arc::new(NullDeviceRegistry),
        "test-key".to_string(),
    ));
    ScanJobQueue::new(store, prober, CancellationToken::new())
}

fn fast_options() -> ScanOptions {
    ScanOptions {
        subnet: Some("192.0.2.0/24".to_string()),
        timeout_ms: Some(50),
        concurrency: Some(254),
        agent_port: Some(9182),
    }
}

async fn wait_until_terminal(store: &MemoryJobStore, job_id: &str) -> ScanJob {
    for _ in 0..300 {
        if let Some(job) = store.get(job_id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn test_enqueue_rejects_invalid_options() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = test_queue(store.clone());

    let bad_subnet = ScanOptions {
        subnet: Some("192.168.1.5/16".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        queue.enqueue(bad_subnet, None).await,
        Err(PipelineError::InvalidOptions(_))
    ));

    let bad_concurrency = ScanOptions {
        subnet: Some("192.0.2.0/24".to_string()),
        concurrency: Some(0),
        ..Default::default()
    };
    assert!(matches!(
        queue.enqueue(bad_concurrency, None).await,
        Err(PipelineError::InvalidOptions(_))
    ));
}

#[tokio::test]
async fn test_enqueue_creates_queued_job() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = test_queue(store.clone());

    let id = queue
        .enqueue(fast_options(), Some("user-1".to_string()))
        .await
        .unwrap();

    // The record exists immediately; the worker may already have picked it up.
    let job = store.get(&id).await.unwrap().expect("job must be stored");
    assert_eq!(job.id, id);
    assert_eq!(job.user_id.as_deref(), Some("user-1"));
    assert!(matches!(
        job.status,
        ScanStatus::Queued | ScanStatus::Running | ScanStatus::Completed
    ));
}

#[tokio::test]
async fn test_job_runs_to_completion_with_full_progress() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = test_queue(store.clone());

    let id = queue.enqueue(fast_options(), None).await.unwrap();
    let job = wait_until_terminal(&store, &id).await;

    assert_eq!(job.status, ScanStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.error.is_none());
    let agents = job.result.expect("completed job must carry a result");
    assert!(agents.is_empty(), "TEST-NET must not host agents");
}

#[tokio::test]
async fn test_status_updates_are_published_in_order() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = test_queue(store.clone());

    // Subscribing needs the job id, which only exists after enqueue; the
    // initial QUEUED publish may be missed, terminal never is because the
    // scan takes longer than the subscribe below.
    let id = queue.enqueue(fast_options(), None).await.unwrap();
    let mut subscription = store.subscribe(&id).await.unwrap();

    let mut last_progress = 0u8;
    loop {
        let message = tokio::time::timeout(Duration::from_secs(30), subscription.recv())
            .await
            .expect("timed out waiting for job updates")
            .expect("channel closed before terminal state");

        assert!(
            message.progress >= last_progress,
            "progress went backwards: {} -> {}",
            last_progress,
            message.progress
        );
        last_progress = message.progress;

        if message.status.is_terminal() {
            assert_eq!(message.status, ScanStatus::Completed);
            break;
        }
    }
}

#[tokio::test]
async fn test_cancel_unknown_job_is_not_found() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = test_queue(store);

    assert!(matches!(
        queue.cancel("no-such-job").await,
        Err(PipelineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_terminal_job_conflicts() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = test_queue(store.clone());

    let id = queue.enqueue(fast_options(), None).await.unwrap();

    // Cancel races the worker; either it lands while the job is live or the
    // job already finished. Both end terminal.
    let first_cancel = queue.cancel(&id).await;
    let job = wait_until_terminal(&store, &id).await;
    match first_cancel {
        Ok(()) => {
            // The cancel landed while the job was live; a late worker result
            // must not overwrite the cancellation.
            assert_eq!(job.status, ScanStatus::Cancelled);
            assert!(job.error.as_deref().unwrap_or_default().contains("Cancelled"));
        }
        Err(PipelineError::AlreadyFinished) => {
            assert_eq!(job.status, ScanStatus::Completed);
        }
        Err(e) => panic!("unexpected cancel error: {e}"),
    }

    // A terminal job always refuses further cancellation.
    assert!(matches!(
        queue.cancel(&id).await,
        Err(PipelineError::AlreadyFinished)
    ));
}
