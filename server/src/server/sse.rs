//! Server-push relays.
//!
//! Each relay instance serves exactly one remote observer. The scan relay
//! replays current job state on attach and then forwards the job channel;
//! the metrics relay runs two concurrent paths: dynamic updates start
//! flowing immediately while the static snapshot is fetched (and retried)
//! in the background.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::metrics::poller::MetricsUpdate;
use crate::server::state::ServerState;
use crate::store::JobChannelMessage;

/// Client reconnect hint carried on the first event of a metrics stream.
const RECONNECT_RETRY_MS: u64 = 5_000;

/// Heartbeat comment interval; defeats intermediary buffering and lets the
/// observer detect a hung-but-open connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Delay between background static-snapshot retry rounds.
const STATIC_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Attempts and spacing for each availability round.
const STATIC_MAX_ATTEMPTS: u32 = 10;
const STATIC_ATTEMPT_INTERVAL: Duration = Duration::from_secs(2);

type EventStream = UnboundedReceiverStream<Result<Event, Infallible>>;

/// Live scan status relay: replay current state via `get`, then forward the
/// job channel until the observer disconnects or the job turns terminal.
pub async fn scan_stream(
    state: Arc<ServerState>,
    scan_id: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // Late subscribers recover current state before the live feed.
        match state.store.get(&scan_id).await {
            Ok(Some(job)) => {
                let terminal = job.status.is_terminal();
                let _ = tx.send(Ok(scan_event(&scan_id, &job.to_message())));
                if terminal {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Scan relay state fetch failed for {}: {}", scan_id, e);
            }
        }

        let mut subscription = match state.store.subscribe(&scan_id).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Scan relay subscribe failed for {}: {}", scan_id, e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    let terminal = message.status.is_terminal();
                    if tx.send(Ok(scan_event(&scan_id, &message))).is_err() {
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
            }
        }
        debug!("Scan relay for {} detached", scan_id);
    });

    Sse::new(EventStream::new(rx))
}

fn scan_event(scan_id: &str, message: &JobChannelMessage) -> Event {
    Event::default().data(scan_payload(scan_id, message).to_string())
}

fn scan_payload(scan_id: &str, message: &JobChannelMessage) -> serde_json::Value {
    let mut payload = serde_json::to_value(message).unwrap_or_else(|_| json!({}));
    if let Some(map) = payload.as_object_mut() {
        map.insert("scanId".to_string(), json!(scan_id));
    }
    payload
}

/// Live metrics relay for one device: dynamic path starts immediately, the
/// static snapshot is delivered as soon as the source can produce it, with
/// an unbounded background retry while the connection stays open.
pub async fn metrics_stream(
    state: Arc<ServerState>,
    device_id: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();

    // Connection status first; carries the client reconnect hint.
    let _ = tx.send(Ok(system_event("connected", "SSE connection established")
        .retry(Duration::from_millis(RECONNECT_RETRY_MS))));

    // The waiting notice must precede any dynamic event, so the first
    // availability check completes before the poller subscription (which can
    // push immediately) is registered.
    if !state.source.check_available(&device_id).await {
        let _ = tx.send(Ok(system_event(
            "waiting_static",
            "Static data not yet available, retrying in background",
        )));
    }

    let (guard, mut updates) = state.poller.subscribe(&device_id);

    // Static path, slow and retried. Never gives up while the observer is
    // connected; exits promptly once the receiver is gone.
    let static_tx = tx.clone();
    let static_state = state.clone();
    let static_device = device_id.clone();
    tokio::spawn(async move {
        loop {
            if static_tx.is_closed() {
                return;
            }

            if static_state
                .poller
                .wait_for_availability(&static_device, STATIC_MAX_ATTEMPTS, STATIC_ATTEMPT_INTERVAL)
                .await
            {
                match static_state.poller.get_static(&static_device).await {
                    Ok(snapshot) => {
                        let _ = static_tx.send(Ok(data_event("static", &snapshot)));
                        return;
                    }
                    Err(e) => {
                        let _ = static_tx.send(Ok(error_event(&e.to_string())));
                    }
                }
            } else {
                let _ = static_tx.send(Ok(system_event(
                    "waiting_static",
                    "Still waiting for static data, retrying in background",
                )));
            }

            tokio::select! {
                _ = static_tx.closed() => return,
                _ = tokio::time::sleep(STATIC_RETRY_DELAY) => {}
            }
        }
    });

    // Dynamic path, fast. Owns the subscription guard: dropping it when this
    // task exits releases the poller subscription.
    tokio::spawn(async move {
        let _guard = guard;
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                update = updates.recv() => {
                    let Some(update) = update else { break };
                    let event = match update {
                        MetricsUpdate::Dynamic(metrics) => data_event("dynamic", &metrics),
                        MetricsUpdate::Error(message) => error_event(&message),
                    };
                    if tx.send(Ok(event)).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Metrics relay for {} detached", device_id);
    });

    Sse::new(EventStream::new(rx))
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("ping"))
}

fn system_event(status: &str, message: &str) -> Event {
    Event::default().event("system").data(
        json!({
            "status": status,
            "message": message,
            "timestamp": Utc::now().timestamp_millis(),
        })
        .to_string(),
    )
}

fn data_event<T: serde::Serialize>(kind: &str, data: &T) -> Event {
    let payload = serde_json::to_value(data).unwrap_or_else(|e| json!({ "error": e.to_string() }));
    Event::default().event(kind).data(payload.to_string())
}

fn error_event(message: &str) -> Event {
    Event::default().event("error").data(
        json!({
            "message": message,
            "timestamp": Utc::now().timestamp_millis(),
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ScanStatus;

    #[test]
    fn scan_payload_carries_scan_id() {
        let message = JobChannelMessage {
            status: ScanStatus::Running,
            progress: 40,
            result: None,
            error: None,
        };
        let payload = scan_payload("scan-7", &message);
        assert_eq!(payload["scanId"], "scan-7");
        assert_eq!(payload["status"], "RUNNING");
        assert_eq!(payload["progress"], 40);
        // Absent optionals are omitted, not serialized as null.
        assert!(payload.get("result").is_none());
        assert!(payload.get("error").is_none());
    }

    #[test]
    fn scan_payload_keeps_terminal_error() {
        let message = JobChannelMessage {
            status: ScanStatus::Cancelled,
            progress: 0,
            result: None,
            error: Some("Cancelled by user".to_string()),
        };
        let payload = scan_payload("scan-7", &message);
        assert_eq!(payload["status"], "CANCELLED");
        assert_eq!(payload["error"], "Cancelled by user");
    }
}
