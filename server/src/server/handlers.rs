//! HTTP request handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::errors::PipelineError;
use crate::scan::discovery::current_subnet;
use crate::scan::types::{DiscoveredAgent, ScanOptions};
use crate::server::sse;
use crate::server::state::ServerState;
use crate::store::{ScanJob, ScanStatus};

/// Bearer-token check for the scan endpoints.
fn authorize(headers: &HeaderMap, state: &ServerState) -> Result<(), Response> {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| !state.api_token.is_empty() && token == state.api_token);

    if authorized {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" }))).into_response())
    }
}

/// Caller identity, when supplied. Recorded on the job as its owning user.
fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub scan_id: String,
    pub status: ScanStatus,
}

/// `POST /scan` — validate options, create the job, return its id at once.
pub async fn enqueue_scan_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Option<Json<ScanOptions>>,
) -> Result<impl IntoResponse, Response> {
    authorize(&headers, &state)?;

    let options = body.map(|Json(options)| options).unwrap_or_default();
    let scan_id = state
        .queue
        .enqueue(options, user_id(&headers))
        .await
        .map_err(error_response)?;

    Ok(Json(EnqueueResponse {
        scan_id,
        status: ScanStatus::Queued,
    }))
}

/// `GET /scan` — the current network context.
pub async fn current_subnet_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, Response> {
    authorize(&headers, &state)?;

    let subnet = current_subnet().map_err(error_response)?;
    Ok(Json(json!({ "subnet": subnet })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSnapshot {
    pub scan_id: String,
    pub status: ScanStatus,
    pub progress: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<DiscoveredAgent>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanSnapshot {
    fn from_job(job: ScanJob) -> Self {
        Self {
            scan_id: job.id,
            status: job.status,
            progress: job.progress,
            result: job.result,
            error: job.error,
        }
    }
}

/// `GET /scan/{id}` — a live event stream when the caller accepts one,
/// otherwise a single point-in-time snapshot.
pub async fn scan_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(scan_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    authorize(&headers, &state)?;

    let wants_stream = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    if wants_stream {
        return Ok(sse::scan_stream(state, scan_id).await.into_response());
    }

    match state.store.get(&scan_id).await.map_err(error_response)? {
        Some(job) => Ok(Json(ScanSnapshot::from_job(job)).into_response()),
        None => Err(not_found()),
    }
}

/// `DELETE /scan/{id}` — cooperative cancel; 409 once terminal.
pub async fn cancel_scan_handler(
    State(state): State<Arc<ServerState>>,
    Path(scan_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, Response> {
    authorize(&headers, &state)?;

    state
        .queue
        .cancel(&scan_id)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({ "status": "CANCELLED", "scanId": scan_id })))
}

/// `GET /metrics/stream/{deviceId}` — server-push metrics relay.
pub async fn metrics_stream_handler(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> Response {
    sse::metrics_stream(state, device_id).await.into_response()
}

/// `GET /metrics/processes/{deviceId}` — bootstrap the process socket:
/// verify the upstream source answers for this device, make sure the hub is
/// up (restarting it if its listener died), and hand back the socket URL.
pub async fn process_socket_handler(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, Response> {
    if let Err(e) = state.source.fetch_processes(&device_id).await {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Failed to connect to metrics service",
                "details": e.to_string(),
            })),
        )
            .into_response());
    }

    let hub = state.hub.ensure_started().await.map_err(error_response)?;

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_string())
        .unwrap_or_else(|| "localhost".to_string());

    Ok(Json(json!({
        "message": "Process socket is running",
        "connection": format!("ws://{host}:{}/metrics/processes/{device_id}", hub.port()),
        "updateIntervalMs": 5000,
    })))
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

/// Map pipeline errors to the REST status contract.
fn error_response(error: PipelineError) -> Response {
    let (status, message) = match &error {
        PipelineError::InvalidOptions(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        PipelineError::NotFound(_) => return not_found(),
        PipelineError::AlreadyFinished => {
            (StatusCode::CONFLICT, "Scan already finished".to_string())
        }
        PipelineError::StoreUnavailable(msg) | PipelineError::Upstream(msg) => {
            (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
        }
        PipelineError::Transport(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    };

    (status, Json(json!({ "error": message }))).into_response()
}
