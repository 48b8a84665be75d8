//! Shared application state.
//!
//! Built once at startup: the connection registry, session store, and
//! coordinator are process singletons with internal synchronization —
//! there is no ambient module state.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_signaling::{
    ConnectionRegistry, DeviceDirectory, InMemoryDirectory, LivenessMonitor, LogAudit,
    SessionCoordinator, SessionStore,
};

use crate::settings::ServerSettings;

/// Everything the HTTP and WS layers share.
pub struct AppState {
    /// Effective settings.
    pub settings: ServerSettings,
    /// Live connection table.
    pub registry: Arc<ConnectionRegistry>,
    /// Session table.
    pub store: Arc<SessionStore>,
    /// Session orchestration.
    pub coordinator: Arc<SessionCoordinator>,
    /// Persistence collaborator for device registration.
    pub directory: Arc<dyn DeviceDirectory>,
    /// Handle for rendering `/metrics`.
    pub metrics: PrometheusHandle,
}

impl AppState {
    /// Wire up the relay's shared state.
    pub fn new(settings: ServerSettings, metrics: PrometheusHandle) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(SessionStore::new());
        let coordinator = SessionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::new(LogAudit),
        );
        Arc::new(Self {
            settings,
            registry,
            store,
            coordinator,
            directory: Arc::new(InMemoryDirectory::new()),
            metrics,
        })
    }

    /// Spawn the liveness monitor; it stops when `shutdown` fires.
    pub fn spawn_liveness(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = LivenessMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.coordinator),
            self.settings.liveness(),
        );
        tokio::spawn(monitor.run(shutdown))
    }
}
