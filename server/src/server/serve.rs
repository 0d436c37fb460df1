//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::PipelineError;
use crate::server::handlers::{
    cancel_scan_handler, current_subnet_handler, enqueue_scan_handler, metrics_stream_handler,
    process_socket_handler, scan_status_handler,
};
use crate::server::state::ServerState;

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PipelineError>>, PipelineError> {
    // Live streams are consumed cross-origin by the dashboard.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        // Scan jobs
        .route("/scan", get(current_subnet_handler).post(enqueue_scan_handler))
        .route(
            "/scan/{scan_id}",
            get(scan_status_handler).delete(cancel_scan_handler),
        )
        // Live metrics
        .route("/metrics/stream/{device_id}", get(metrics_stream_handler))
        .route("/metrics/processes/{device_id}", get(process_socket_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PipelineError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| PipelineError::ServerError(e.to_string()))
    });

    Ok(handle)
}
