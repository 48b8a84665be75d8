//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Outbound frames dropped on a full queue (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Active sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Sessions created total (counter).
pub const SESSIONS_CREATED_TOTAL: &str = "sessions_created_total";
/// Sessions ended total (counter).
pub const SESSIONS_ENDED_TOTAL: &str = "sessions_ended_total";
/// Negotiation messages forwarded total (counter).
pub const SIGNALS_ROUTED_TOTAL: &str = "signals_routed_total";
/// Frames rejected with an ERROR envelope total (counter).
pub const SIGNAL_ERRORS_TOTAL: &str = "signal_errors_total";
/// Connections evicted by the liveness sweep total (counter).
pub const LIVENESS_EVICTIONS_TOTAL: &str = "liveness_evictions_total";
