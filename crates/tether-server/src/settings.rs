//! Server settings with environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerSettings::default()`] (the shared
//!    protocol constants)
//! 2. Apply `TETHER_*` environment variable overrides
//!
//! Each env var has strict parsing rules: integers must be valid and
//! within range; invalid values are ignored and the default stands.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tether_core::constants::{
    OUTBOUND_QUEUE_DEPTH, PONG_GRACE_MS, SESSION_IDLE_TIMEOUT_MS, SIGNALING_PORT,
    WS_PING_INTERVAL_MS,
};
use tether_signaling::LivenessConfig;

/// Network and liveness settings for the relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Idle time before a connection is pinged, in milliseconds.
    pub ping_interval_ms: u64,
    /// Grace period for an unanswered ping, in milliseconds.
    pub pong_grace_ms: u64,
    /// Idle time before a session is ended, in milliseconds.
    pub session_idle_timeout_ms: u64,
    /// Per-connection outbound queue bound.
    pub outbound_queue_depth: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: SIGNALING_PORT,
            ping_interval_ms: WS_PING_INTERVAL_MS,
            pong_grace_ms: PONG_GRACE_MS,
            session_idle_timeout_ms: SESSION_IDLE_TIMEOUT_MS,
            outbound_queue_depth: OUTBOUND_QUEUE_DEPTH,
        }
    }
}

impl ServerSettings {
    /// `host:port` for the TCP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Liveness knobs derived from these settings.
    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            pong_grace: Duration::from_millis(self.pong_grace_ms),
            session_idle_timeout: Duration::from_millis(self.session_idle_timeout_ms),
        }
    }
}

/// Load settings: compiled defaults, then env overrides.
pub fn load_settings() -> ServerSettings {
    let mut settings = ServerSettings::default();
    apply_env_overrides_from(&mut settings, &|key| std::env::var(key).ok());
    settings
}

/// Apply overrides from an arbitrary key lookup (the environment in
/// production, a map in tests).
pub fn apply_env_overrides_from(
    settings: &mut ServerSettings,
    lookup: &dyn Fn(&str) -> Option<String>,
) {
    if let Some(v) = read_string(lookup, "TETHER_HOST") {
        settings.host = v;
    }
    if let Some(v) = read_u64(lookup, "TETHER_PORT", 1, 65_535) {
        settings.port = v as u16;
    }
    if let Some(v) = read_u64(lookup, "TETHER_PING_INTERVAL_MS", 1_000, 600_000) {
        settings.ping_interval_ms = v;
    }
    if let Some(v) = read_u64(lookup, "TETHER_PONG_GRACE_MS", 100, 60_000) {
        settings.pong_grace_ms = v;
    }
    if let Some(v) = read_u64(lookup, "TETHER_SESSION_IDLE_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.session_idle_timeout_ms = v;
    }
    if let Some(v) = read_u64(lookup, "TETHER_QUEUE_DEPTH", 1, 10_000) {
        settings.outbound_queue_depth = v as usize;
    }
}

fn read_string(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn read_u64(lookup: &dyn Fn(&str) -> Option<String>, key: &str, min: u64, max: u64) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) if (min..=max).contains(&v) => Some(v),
        _ => {
            debug!(key, value = %raw, "ignoring invalid setting override");
            None
        }
    }
}
