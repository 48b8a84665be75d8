//! Connection and session liveness sweep.
//!
//! A single timer task shared by all connections. Each tick:
//!
//! 1. pings every connection with no inbound traffic within the ping
//!    interval;
//! 2. evicts connections whose ping went unanswered past the grace
//!    period — eviction runs the normal unregister path, so dependent
//!    sessions end and surviving peers are notified;
//! 3. sweeps sessions idle beyond the session threshold, independent of
//!    connection health (covers a host whose session never gets a join).

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether_core::constants::{PONG_GRACE_MS, SESSION_IDLE_TIMEOUT_MS, WS_PING_INTERVAL_MS};

use crate::coordinator::SessionCoordinator;
use crate::registry::ConnectionRegistry;
use crate::store::SessionStore;

/// Timing knobs for the sweep.
#[derive(Copy, Clone, Debug)]
pub struct LivenessConfig {
    /// Idle time after which a connection is pinged.
    pub ping_interval: Duration,
    /// Extra time an unanswered ping is tolerated.
    pub pong_grace: Duration,
    /// Idle time after which a session is ended.
    pub session_idle_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(WS_PING_INTERVAL_MS),
            pong_grace: Duration::from_millis(PONG_GRACE_MS),
            session_idle_timeout: Duration::from_millis(SESSION_IDLE_TIMEOUT_MS),
        }
    }
}

/// The periodic liveness task.
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    store: Arc<SessionStore>,
    coordinator: Arc<SessionCoordinator>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    /// Build a monitor over the shared state.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<SessionStore>,
        coordinator: Arc<SessionCoordinator>,
        config: LivenessConfig,
    ) -> Self {
        Self {
            registry,
            store,
            coordinator,
            config,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        // Tick at grace granularity so evictions are not delayed a full
        // ping interval.
        let period = self.config.ping_interval.min(self.config.pong_grace);
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        info!(
            ping_interval_ms = self.config.ping_interval.as_millis() as u64,
            pong_grace_ms = self.config.pong_grace.as_millis() as u64,
            session_idle_timeout_ms = self.config.session_idle_timeout.as_millis() as u64,
            "liveness monitor running"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("liveness monitor stopping");
                    break;
                }
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    /// One sweep pass.
    pub fn tick(&self) {
        let deadline = self.config.ping_interval + self.config.pong_grace;
        for peer in self.registry.snapshot() {
            if peer.is_closed() {
                // A dead connection (queue overflow, transport fault)
                // whose owning task has not reported in yet.
                let _ = self.registry.unregister(peer.device_id(), peer.conn_id());
                continue;
            }
            let idle = peer.idle_for();
            if peer.awaiting_pong() && idle >= deadline {
                warn!(device = %peer.device_id(), idle_ms = idle.as_millis() as u64, "connection unresponsive, evicting");
                counter!("liveness_evictions_total").increment(1);
                let _ = self.registry.unregister(peer.device_id(), peer.conn_id());
            } else if !peer.awaiting_pong() && idle >= self.config.ping_interval {
                let _ = peer.send_ping();
            }
        }

        for ended in self.store.sweep_expired(self.config.session_idle_timeout) {
            self.coordinator.notify_swept(&ended);
        }
    }
}
