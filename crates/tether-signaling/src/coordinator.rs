//! Session orchestration.
//!
//! The coordinator owns the session state machine:
//!
//! ```text
//! WAITING ──join──────────────▶ ACTIVE
//!    │                            │
//!    │ host gone / cancel /       │ either peer gone / explicit end /
//!    │ timeout                    │ timeout
//!    ▼                            ▼
//!  ENDED ◀─────────────────────────
//! ```
//!
//! It sits above [`MessageRouter`]: control requests surfaced by the
//! router are executed here, replies and peer notifications are framed
//! here, and every disconnect path funnels through the registry's
//! disconnect hook so no session outlives a dead participant. On
//! `ACTIVE → ENDED` the surviving peer always gets a termination
//! envelope before the record is purged.

use std::sync::{Arc, Weak};

use metrics::{counter, gauge};
use tracing::{debug, warn};

use tether_core::envelope::{ClientJoinedPayload, Envelope, ErrorPayload, SignalMessage};
use tether_core::errors::{Result, SignalError};
use tether_core::ids::{ConnectionId, DeviceId, SessionId};
use tether_core::session::SessionDto;

use crate::audit::SessionAudit;
use crate::registry::ConnectionRegistry;
use crate::router::{ControlRequest, MessageRouter, RouteOutcome};
use crate::store::{EndReason, EndedSession, SessionStore};

/// Wire code used when a session is terminated underneath a peer.
const SESSION_ENDED_CODE: &str = "SESSION_ENDED";

/// Orchestrates session lifecycle over the shared registry and store.
pub struct SessionCoordinator {
    registry: Arc<ConnectionRegistry>,
    store: Arc<SessionStore>,
    router: MessageRouter,
    audit: Arc<dyn SessionAudit>,
}

impl SessionCoordinator {
    /// Build the coordinator and install the registry disconnect hook.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<SessionStore>,
        audit: Arc<dyn SessionAudit>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            registry: Arc::clone(&registry),
            store: Arc::clone(&store),
            router: MessageRouter::new(Arc::clone(&registry), store),
            audit,
        });

        // The registry holds only a weak reference; the coordinator owns
        // the registry, never the other way around.
        let weak: Weak<Self> = Arc::downgrade(&coordinator);
        registry.set_disconnect_hook(Arc::new(move |device_id, _conn_id| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.end_sessions_for(device_id);
            }
        }));
        coordinator
    }

    /// Handle one inbound frame from a connected device.
    ///
    /// Every failure is reported back to the sender as an `ERROR`
    /// envelope; nothing propagates.
    pub fn handle_frame(&self, sender: &DeviceId, text: &str) {
        let result = match self.router.route(sender, text) {
            Ok(RouteOutcome::Forwarded(_)) => Ok(()),
            Ok(RouteOutcome::Control(request)) => self.handle_control(sender, request),
            Err(e) => Err(e),
        };

        if let Err(error) = result {
            counter!("signal_errors_total").increment(1);
            debug!(sender = %sender, code = error.code(), "rejecting frame: {error}");
            let _ = self.send_to(
                sender,
                SignalMessage::Error(error.to_payload()),
            );
        }
    }

    fn handle_control(&self, sender: &DeviceId, request: ControlRequest) -> Result<()> {
        match request {
            ControlRequest::RegisterHost { password } => {
                let session = self.create_session(sender, password.as_deref())?;
                let _ = self.send_to(sender, SignalMessage::SessionCreated(session));
                Ok(())
            }
            ControlRequest::RegisterClient {
                session_id,
                password,
            } => {
                let _ = self.join_session(&session_id, sender, password.as_deref())?;
                Ok(())
            }
        }
    }

    /// Create a session hosted by `host_device_id`.
    pub fn create_session(
        &self,
        host_device_id: &DeviceId,
        password: Option<&str>,
    ) -> Result<SessionDto> {
        let session = self.store.create_session(host_device_id, password)?;
        counter!("sessions_created_total").increment(1);
        gauge!("sessions_active").set(self.store.session_count() as f64);
        self.audit.session_created(&session);
        Ok(session)
    }

    /// Join `client_device_id` to a session, notifying both parties.
    ///
    /// Used by the WS `REGISTER_CLIENT` path and the REST join endpoint
    /// alike, so connected peers always learn about the join.
    pub fn join_session(
        &self,
        session_id: &SessionId,
        client_device_id: &DeviceId,
        password: Option<&str>,
    ) -> Result<SessionDto> {
        let session = self
            .store
            .join_session(session_id, client_device_id, password)?;
        self.audit.session_joined(&session);

        let joined = SignalMessage::ClientJoined(ClientJoinedPayload {
            session_id: session.id.clone(),
            client_device_id: client_device_id.clone(),
        });
        let _ = self.send_to(&session.host_device_id, joined.clone());
        let _ = self.send_to(client_device_id, joined);
        Ok(session)
    }

    /// End a session on request of a participant.
    pub fn end_session(&self, session_id: &SessionId, reason: EndReason) -> Option<EndedSession> {
        let ended = self.store.end_session(session_id, reason)?;
        self.finish_session(&ended, None);
        Some(ended)
    }

    /// Current view of a session.
    pub fn get_session(&self, session_id: &SessionId) -> Option<SessionDto> {
        self.store.get(session_id)
    }

    /// Tear down a device's connection and every session it holds.
    ///
    /// `conn_id` guards against a stale task evicting the device's
    /// replacement connection after a reconnect.
    pub fn device_disconnected(&self, device_id: &DeviceId, conn_id: ConnectionId) {
        // Session teardown rides on the registry's disconnect hook.
        let _ = self.registry.unregister(device_id, conn_id);
    }

    /// Notify participants of a session the liveness sweep ended.
    pub fn notify_swept(&self, ended: &EndedSession) {
        self.finish_session(ended, None);
    }

    fn end_sessions_for(&self, device_id: &DeviceId) {
        for session_id in self.store.sessions_for_device(device_id) {
            if let Some(ended) = self
                .store
                .end_session(&session_id, EndReason::PeerDisconnected)
            {
                self.finish_session(&ended, Some(device_id));
            }
        }
    }

    /// Common tail of every `* → ENDED` transition: tell the peers that
    /// are still connected, emit audit, refresh the gauge.
    fn finish_session(&self, ended: &EndedSession, skip: Option<&DeviceId>) {
        let payload = ErrorPayload {
            code: SESSION_ENDED_CODE.to_string(),
            message: format!("session {} ended: {}", ended.id, ended.reason),
        };
        for participant in ended.participants() {
            if skip == Some(participant) {
                continue;
            }
            if !self.send_to(participant, SignalMessage::Error(payload.clone())) {
                debug!(device = %participant, session_id = %ended.id, "peer not connected for termination notice");
            }
        }
        counter!("sessions_ended_total").increment(1);
        gauge!("sessions_active").set(self.store.session_count() as f64);
        self.audit.session_ended(&ended.id, ended.reason);
    }

    /// Frame and queue a message for a device. Returns `false` when the
    /// device has no live connection or its queue rejected the frame.
    fn send_to(&self, device_id: &DeviceId, message: SignalMessage) -> bool {
        let Some(connection) = self.registry.lookup(device_id) else {
            return false;
        };
        let envelope = Envelope::now(message);
        match serde_json::to_string(&envelope) {
            Ok(frame) => connection.send_frame(Arc::new(frame)),
            Err(e) => {
                warn!(device = %device_id, error = %e, "failed to serialize envelope");
                false
            }
        }
    }
}
