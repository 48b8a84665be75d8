//! Session lifecycle events exposed to collaborators.
//!
//! The relay itself keeps no persistent state; a persistence layer that
//! wants to record session history implements [`SessionAudit`]. The
//! default [`LogAudit`] writes structured log lines.

use tether_core::ids::SessionId;
use tether_core::session::SessionDto;
use tracing::info;

use crate::store::EndReason;

/// Observer for session lifecycle transitions.
pub trait SessionAudit: Send + Sync {
    /// A session was created and is waiting for a client.
    fn session_created(&self, session: &SessionDto);
    /// A client joined; the session is active.
    fn session_joined(&self, session: &SessionDto);
    /// A session reached its terminal state.
    fn session_ended(&self, session_id: &SessionId, reason: EndReason);
}

/// Audit sink that logs lifecycle events.
pub struct LogAudit;

impl SessionAudit for LogAudit {
    fn session_created(&self, session: &SessionDto) {
        info!(session_id = %session.id, host = %session.host_device_id, "audit: session created");
    }

    fn session_joined(&self, session: &SessionDto) {
        let client = session
            .client_device_id
            .as_ref()
            .map_or("<unset>", |id| id.as_str());
        info!(session_id = %session.id, client, "audit: session joined");
    }

    fn session_ended(&self, session_id: &SessionId, reason: EndReason) {
        info!(session_id = %session_id, %reason, "audit: session ended");
    }
}
