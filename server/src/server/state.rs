//! Server state

use std::sync::Arc;

use crate::metrics::poller::MetricsPoller;
use crate::metrics::source::MetricsSource;
use crate::scan::queue::ScanJobQueue;
use crate::sockets::hub::HubSupervisor;
use crate::store::JobStateStore;

/// Server state shared across handlers
pub struct ServerState {
    pub store: Arc<dyn JobStateStore>,
    pub queue: Arc<ScanJobQueue>,
    pub poller: Arc<MetricsPoller>,
    pub source: Arc<dyn MetricsSource>,
    pub hub: Arc<HubSupervisor>,

    /// Bearer token required on the scan endpoints.
    pub api_token: String,
}

impl ServerState {
    pub fn new(
        store: Arc<dyn JobStateStore>,
        queue: Arc<ScanJobQueue>,
        poller: Arc<MetricsPoller>,
        source: Arc<dyn MetricsSource>,
        hub: Arc<HubSupervisor>,
        api_token: String,
    ) -> Self {
        Self {
            store,
            queue,
            poller,
            source,
            hub,
            api_token,
        }
    }
}
