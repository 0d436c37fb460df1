//! Process metrics socket hub.
//!
//! A long-lived hub owning one websocket listener and a registry mapping
//! device id to its single active connection. Each connection gets a process
//! listing pushed on a fixed interval; a newer connection for the same device
//! forcibly closes the older one before it is registered, so at most one live
//! connection per device holds at all times.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::metrics::source::MetricsSource;

/// Socket hub options
#[derive(Debug, Clone)]
pub struct Options {
    /// Host to bind the socket listener to
    pub host: String,

    /// Port for the socket listener
    pub port: u16,

    /// Interval between process listing pushes
    pub push_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            push_interval: Duration::from_secs(5),
        }
    }
}

struct ConnEntry {
    generation: u64,
    close: CancellationToken,
}

pub struct ProcessSocketHub {
    options: Options,
    source: Arc<dyn MetricsSource>,
    connections: Mutex<HashMap<String, ConnEntry>>,
    next_generation: AtomicU64,
    stop: CancellationToken,
}

impl ProcessSocketHub {
    /// Bind the listener and start serving upgrades. Fails (and leaves
    /// nothing half-initialized) when the port cannot be bound; the
    /// supervisor may retry later.
    pub async fn start(
        options: Options,
        source: Arc<dyn MetricsSource>,
        stop: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<Result<(), PipelineError>>), PipelineError> {
        let addr = format!("{}:{}", options.host, options.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PipelineError::Transport(format!("socket hub bind {addr} failed: {e}")))?;

        info!("Process socket hub listening on {}", addr);

        let hub = Arc::new(Self {
            options,
            source,
            connections: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            stop: stop.clone(),
        });

        let app = Router::new()
            .route("/metrics/processes/{device_id}", get(upgrade_handler))
            .with_state(hub.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .map_err(|e| PipelineError::ServerError(e.to_string()))
        });

        Ok((hub, handle))
    }

    pub fn port(&self) -> u16 {
        self.options.port
    }

    /// Register a new connection for a device, forcibly closing any existing
    /// one first so the active slot is never shared.
    fn register(&self, device_id: &str) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let close = CancellationToken::new();

        let mut connections = self.connections.lock().expect("connection registry poisoned");
        if let Some(old) = connections.insert(
            device_id.to_string(),
            ConnEntry {
                generation,
                close: close.clone(),
            },
        ) {
            warn!(
                "Superseding existing process socket for device {}",
                device_id
            );
            old.close.cancel();
        }

        (generation, close)
    }

    /// Remove the registry entry for this device, but only if the closing
    /// connection is still the registered one. A superseded connection must
    /// not evict its replacement.
    fn deregister(&self, device_id: &str, generation: u64) {
        let mut connections = self.connections.lock().expect("connection registry poisoned");
        if connections
            .get(device_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            connections.remove(device_id);
        }
    }

    /// Whether a device currently holds an active connection slot.
    pub fn has_connection(&self, device_id: &str) -> bool {
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .contains_key(device_id)
    }

    async fn handle_connection(self: Arc<Self>, device_id: String, mut socket: WebSocket) {
        let (generation, close) = self.register(&device_id);
        info!("Process socket opened for device {}", device_id);

        let mut push_tick = tokio::time::interval(self.options.push_interval);
        // The first tick fires immediately; skip it so pushes follow the
        // fixed interval, matching the poll cadence.
        push_tick.tick().await;

        loop {
            tokio::select! {
                _ = close.cancelled() => {
                    debug!("Process socket for {} superseded, closing", device_id);
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                _ = self.stop.cancelled() => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                _ = push_tick.tick() => {
                    let payload = match self.source.fetch_processes(&device_id).await {
                        Ok(listing) => serde_json::to_string(&listing)
                            .unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string()),
                        Err(e) => {
                            warn!("Process fetch failed for {}: {}", device_id, e);
                            json!({ "error": e.to_string() }).to_string()
                        }
                    };
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        // Transport failure: clean up exactly like a normal close.
                        break;
                    }
                }
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("Process socket error for {}: {}", device_id, e);
                            break;
                        }
                        // Inbound frames are ignored; this is a push channel.
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        self.deregister(&device_id, generation);
        info!("Process socket closed for device {}", device_id);
    }
}

async fn upgrade_handler(
    Path(device_id): Path<String>,
    State(hub): State<Arc<ProcessSocketHub>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub.handle_connection(device_id, socket))
}

/// Owns the hub lifecycle: start is retried on demand, stop is idempotent.
/// A caller probing liveness through [`HubSupervisor::ensure_started`] can
/// trigger re-initialization after a failed or torn-down hub.
pub struct HubSupervisor {
    options: Options,
    source: Arc<dyn MetricsSource>,
    shutdown: CancellationToken,
    inner: tokio::sync::Mutex<Option<RunningHub>>,
}

struct RunningHub {
    hub: Arc<ProcessSocketHub>,
    task: JoinHandle<Result<(), PipelineError>>,
}

impl HubSupervisor {
    pub fn new(options: Options, source: Arc<dyn MetricsSource>, shutdown: CancellationToken) -> Self {
        Self {
            options,
            source,
            shutdown,
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// The running hub, starting it first if it is not up. A hub whose
    /// serve task has exited is discarded and recreated.
    pub async fn ensure_started(&self) -> Result<Arc<ProcessSocketHub>, PipelineError> {
        let mut inner = self.inner.lock().await;

        if let Some(running) = inner.as_ref() {
            if !running.task.is_finished() {
                return Ok(running.hub.clone());
            }
            warn!("Process socket hub task exited, restarting");
            *inner = None;
        }

        let (hub, task) = ProcessSocketHub::start(
            self.options.clone(),
            self.source.clone(),
            self.shutdown.child_token(),
        )
        .await?;

        *inner = Some(RunningHub {
            hub: hub.clone(),
            task,
        });
        Ok(hub)
    }

    /// Stop the hub if it is running. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(running) = inner.take() {
            running.hub.stop.cancel();
            let _ = running.task.await;
        }
    }
}
