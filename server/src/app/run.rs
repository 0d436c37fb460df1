//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app::options::AppOptions;
use crate::errors::PipelineError;
use crate::metrics::poller::MetricsPoller;
use crate::metrics::source::{HttpMetricsSource, MetricsSource};
use crate::scan::discovery::{NullDeviceRegistry, SubnetProber};
use crate::scan::queue::ScanJobQueue;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::sockets::hub::HubSupervisor;
use crate::store::{JobStateStore, MemoryJobStore, RedisJobStore};

/// Run the monitoring pipeline until the shutdown signal fires.
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PipelineError> {
    info!("Initializing monitoring pipeline...");

    let shutdown = CancellationToken::new();
    let mut shutdown_manager = ShutdownManager::new(shutdown.clone(), options.max_shutdown_delay);

    match init(&options, &shutdown, &mut shutdown_manager).await {
        Ok(()) => {}
        Err(e) => {
            error!("Failed to start pipeline: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    shutdown_manager.shutdown().await
}

async fn init(
    options: &AppOptions,
    shutdown: &CancellationToken,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PipelineError> {
    let store: Arc<dyn JobStateStore> = match &options.store.redis_url {
        Some(url) => Arc::new(RedisJobStore::new(url, options.store.job_ttl).await?),
        None => {
            warn!("No store URL configured, job state is process-local");
            Arc::new(MemoryJobStore::new(options.store.job_ttl))
        }
    };

    let source: Arc<dyn MetricsSource> = Arc::new(HttpMetricsSource::new(
        &options.metrics_source.base_url,
        options.metrics_source.username.clone(),
        options.metrics_source.password.clone(),
        options.metrics_source.exporter_port,
    ));

    let prober = Arc::new(SubnetProber::new(
        Arc::new(NullDeviceRegistry),
        options.scanner.handshake_key.clone(),
    ));

    let queue = ScanJobQueue::new(store.clone(), prober, shutdown.child_token());
    let poller = MetricsPoller::new(source.clone(), options.poller.clone(), shutdown.child_token());

    let hub = Arc::new(HubSupervisor::new(
        options.hub.clone(),
        source.clone(),
        shutdown.child_token(),
    ));
    // Eager attempt; a bind conflict is retried lazily by the bootstrap
    // endpoint, so startup proceeds either way.
    if let Err(e) = hub.ensure_started().await {
        warn!("Process socket hub not started yet: {}", e);
    }
    shutdown_manager.with_hub(hub.clone())?;

    let state = ServerState::new(
        store,
        queue,
        poller,
        source,
        hub,
        options.api_token.clone(),
    );

    let server_shutdown = shutdown.child_token();
    let server_handle = serve(&options.server, Arc::new(state), async move {
        server_shutdown.cancelled().await;
    })
    .await?;
    shutdown_manager.with_server_handle(server_handle)?;

    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown: CancellationToken,
    max_shutdown_delay: Duration,
    hub: Option<Arc<HubSupervisor>>,
    server_handle: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl ShutdownManager {
    fn new(shutdown: CancellationToken, max_shutdown_delay: Duration) -> Self {
        Self {
            shutdown,
            max_shutdown_delay,
            hub: None,
            server_handle: None,
        }
    }

    fn with_hub(&mut self, hub: Arc<HubSupervisor>) -> Result<(), PipelineError> {
        if self.hub.is_some() {
            return Err(PipelineError::ShutdownError("hub already set".to_string()));
        }
        self.hub = Some(hub);
        Ok(())
    }

    fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), PipelineError>>,
    ) -> Result<(), PipelineError> {
        if self.server_handle.is_some() {
            return Err(PipelineError::ShutdownError(
                "server_handle already set".to_string(),
            ));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), PipelineError> {
        self.shutdown.cancel();

        match tokio::time::timeout(self.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), PipelineError> {
        info!("Shutting down monitoring pipeline...");

        // 1. Socket hub (closes every device connection)
        if let Some(hub) = self.hub.take() {
            hub.stop().await;
        }

        // 2. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| PipelineError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
