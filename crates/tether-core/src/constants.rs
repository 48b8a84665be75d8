//! Shared protocol constants.
//!
//! Port and ping interval are part of the wire contract with clients;
//! the remaining values are relay-side defaults that server settings
//! may override per deployment.

/// Default TCP port the signaling server listens on.
pub const SIGNALING_PORT: u16 = 8080;

/// Interval between liveness pings on an idle connection, in milliseconds.
pub const WS_PING_INTERVAL_MS: u64 = 30_000;

/// How long after a ping an unanswered connection is considered dead,
/// in milliseconds.
pub const PONG_GRACE_MS: u64 = 10_000;

/// Idle threshold after which a session with no signaling traffic is
/// ended, in milliseconds. Covers sessions whose host never gets a join.
pub const SESSION_IDLE_TIMEOUT_MS: u64 = 300_000;

/// Bound of the per-connection outbound write queue. A connection that
/// overflows this is treated as dead.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;
