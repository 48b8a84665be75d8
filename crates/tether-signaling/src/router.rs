//! Inbound envelope routing.
//!
//! Decodes a text frame, validates it against session and connection
//! state, and either forwards negotiation traffic to the opposite peer
//! or hands control requests up to the coordinator. The relay never
//! interprets SDP or ICE contents: negotiation envelopes are re-framed
//! with payload and timestamp untouched.
//!
//! Frames from one connection are routed strictly in arrival order —
//! the per-connection read loop calls [`MessageRouter::route`]
//! sequentially, so no envelope outruns the state transition it
//! depends on.

use std::sync::Arc;

use metrics::counter;
use tracing::debug;

use tether_core::envelope::{Envelope, SignalMessage};
use tether_core::errors::{Result, SignalError};
use tether_core::ids::{DeviceId, SessionId};
use tether_core::session::SessionStatus;

use crate::registry::ConnectionRegistry;
use crate::store::SessionStore;

/// A control request the coordinator must act on.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlRequest {
    /// `REGISTER_HOST`: create a session for the sender.
    RegisterHost {
        /// Optional session password.
        password: Option<String>,
    },
    /// `REGISTER_CLIENT`: join the sender to a session.
    RegisterClient {
        /// Session to join.
        session_id: SessionId,
        /// Supplied password, if any.
        password: Option<String>,
    },
}

/// What `route` did with a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteOutcome {
    /// A control request for the coordinator.
    Control(ControlRequest),
    /// A negotiation envelope was forwarded to the peer of `session_id`.
    Forwarded(SessionId),
}

/// Stateless router over the shared registry and store.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<SessionStore>,
}

impl MessageRouter {
    /// Create a router over the shared state.
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<SessionStore>) -> Self {
        Self { registry, store }
    }

    /// Decode a frame into an envelope; schema violations become
    /// [`SignalError::MalformedMessage`].
    pub fn decode(text: &str) -> Result<Envelope> {
        serde_json::from_str(text).map_err(|e| SignalError::MalformedMessage(e.to_string()))
    }

    /// Route one inbound frame from `sender`.
    pub fn route(&self, sender: &DeviceId, text: &str) -> Result<RouteOutcome> {
        let envelope = Self::decode(text)?;
        match &envelope.body {
            SignalMessage::RegisterHost(payload) => {
                Ok(RouteOutcome::Control(ControlRequest::RegisterHost {
                    password: payload.password.clone(),
                }))
            }
            SignalMessage::RegisterClient(payload) => {
                Ok(RouteOutcome::Control(ControlRequest::RegisterClient {
                    session_id: payload.session_id.clone(),
                    password: payload.password.clone(),
                }))
            }
            SignalMessage::WebrtcOffer(payload) | SignalMessage::WebrtcAnswer(payload) => {
                let session_id = payload.session_id.clone();
                self.forward(sender, &session_id, &envelope)?;
                Ok(RouteOutcome::Forwarded(session_id))
            }
            SignalMessage::IceCandidate(payload) => {
                let session_id = payload.session_id.clone();
                self.forward(sender, &session_id, &envelope)?;
                Ok(RouteOutcome::Forwarded(session_id))
            }
            SignalMessage::SessionCreated(_)
            | SignalMessage::ClientJoined(_)
            | SignalMessage::Error(_) => Err(SignalError::MalformedMessage(format!(
                "{} is not valid client-to-relay traffic",
                message_tag(&envelope.body)
            ))),
        }
    }

    /// Deliver a negotiation envelope to the opposite participant,
    /// payload untouched.
    fn forward(&self, sender: &DeviceId, session_id: &SessionId, envelope: &Envelope) -> Result<()> {
        let session = self
            .store
            .get(session_id)
            .ok_or_else(|| SignalError::UnknownSession(session_id.clone()))?;

        if session.status != SessionStatus::Active {
            return Err(SignalError::SessionNotActive(session_id.clone()));
        }

        let target = if &session.host_device_id == sender {
            session
                .client_device_id
                .clone()
                .ok_or_else(|| SignalError::SessionNotActive(session_id.clone()))?
        } else if session.client_device_id.as_ref() == Some(sender) {
            session.host_device_id.clone()
        } else {
            return Err(SignalError::NotAParticipant {
                session: session_id.clone(),
                device: sender.clone(),
            });
        };

        let connection = self
            .registry
            .lookup(&target)
            .ok_or_else(|| SignalError::ConnectionUnavailable(target.clone()))?;

        let frame = serde_json::to_string(envelope)
            .map_err(|e| SignalError::MalformedMessage(e.to_string()))?;
        if !connection.send_frame(Arc::new(frame)) {
            return Err(SignalError::ConnectionUnavailable(target));
        }

        self.store.touch(session_id);
        counter!("signals_routed_total").increment(1);
        debug!(session_id = %session_id, from = %sender, to = %target, kind = message_tag(&envelope.body), "negotiation message forwarded");
        Ok(())
    }
}

fn message_tag(body: &SignalMessage) -> &'static str {
    match body {
        SignalMessage::RegisterHost(_) => "REGISTER_HOST",
        SignalMessage::RegisterClient(_) => "REGISTER_CLIENT",
        SignalMessage::SessionCreated(_) => "SESSION_CREATED",
        SignalMessage::ClientJoined(_) => "CLIENT_JOINED",
        SignalMessage::WebrtcOffer(_) => "WEBRTC_OFFER",
        SignalMessage::WebrtcAnswer(_) => "WEBRTC_ANSWER",
        SignalMessage::IceCandidate(_) => "ICE_CANDIDATE",
        SignalMessage::Error(_) => "ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use tether_core::ids::ConnectionId;

    use crate::registry::{Outbound, PeerHandle};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        store: Arc<SessionStore>,
        router: MessageRouter,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let store = Arc::new(SessionStore::new());
            let router = MessageRouter::new(Arc::clone(&registry), Arc::clone(&store));
            Self {
                registry,
                store,
                router,
            }
        }

        fn connect(&self, device: &str) -> mpsc::Receiver<Outbound> {
            let (tx, rx) = mpsc::channel(16);
            let handle = Arc::new(PeerHandle::new(
                DeviceId::from(device),
                ConnectionId::generate(),
                tx,
            ));
            self.registry.register(handle);
            rx
        }

        /// Create a session for `host` and join `client`, both connected.
        fn active_session(&self, host: &str, client: &str) -> SessionId {
            let dto = self
                .store
                .create_session(&DeviceId::from(host), None)
                .unwrap();
            let _ = self
                .store
                .join_session(&dto.id, &DeviceId::from(client), None)
                .unwrap();
            dto.id
        }
    }

    fn offer_json(session_id: &SessionId, sdp: &str) -> String {
        format!(
            r#"{{"type":"WEBRTC_OFFER","payload":{{"sessionId":"{session_id}","sdp":"{sdp}"}},"timestamp":42}}"#
        )
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> serde_json::Value {
        match rx.recv().await.unwrap() {
            Outbound::Frame(frame) => serde_json::from_str(&frame).unwrap(),
            Outbound::Ping => panic!("expected frame, got ping"),
        }
    }

    #[tokio::test]
    async fn offer_is_forwarded_verbatim_to_client() {
        let fx = Fixture::new();
        let _host_rx = fx.connect("host");
        let mut client_rx = fx.connect("client");
        let session_id = fx.active_session("host", "client");

        let outcome = fx
            .router
            .route(&DeviceId::from("host"), &offer_json(&session_id, "v=0..."))
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded(session_id.clone()));

        let delivered = next_frame(&mut client_rx).await;
        assert_eq!(delivered["type"], "WEBRTC_OFFER");
        assert_eq!(delivered["payload"]["sessionId"], session_id.as_str());
        assert_eq!(delivered["payload"]["sdp"], "v=0...");
        assert_eq!(delivered["timestamp"], 42);
    }

    #[tokio::test]
    async fn answer_flows_back_to_host() {
        let fx = Fixture::new();
        let mut host_rx = fx.connect("host");
        let _client_rx = fx.connect("client");
        let session_id = fx.active_session("host", "client");

        let json = format!(
            r#"{{"type":"WEBRTC_ANSWER","payload":{{"sessionId":"{session_id}","sdp":"v=0 answer"}},"timestamp":7}}"#
        );
        let _ = fx.router.route(&DeviceId::from("client"), &json).unwrap();

        let delivered = next_frame(&mut host_rx).await;
        assert_eq!(delivered["type"], "WEBRTC_ANSWER");
        assert_eq!(delivered["payload"]["sdp"], "v=0 answer");
    }

    #[tokio::test]
    async fn ice_candidate_payload_is_untouched() {
        let fx = Fixture::new();
        let _host_rx = fx.connect("host");
        let mut client_rx = fx.connect("client");
        let session_id = fx.active_session("host", "client");

        let json = format!(
            r#"{{"type":"ICE_CANDIDATE","payload":{{"sessionId":"{session_id}","candidate":{{"candidate":"candidate:1 1 UDP 2122 192.0.2.7 50000 typ host","usernameFragment":"u1"}},"sdpMid":"0","sdpMLineIndex":0}},"timestamp":9}}"#
        );
        let _ = fx.router.route(&DeviceId::from("host"), &json).unwrap();

        let delivered = next_frame(&mut client_rx).await;
        let expected: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(delivered["payload"], expected["payload"]);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let fx = Fixture::new();
        let _host_rx = fx.connect("host");
        let err = fx
            .router
            .route(
                &DeviceId::from("host"),
                &offer_json(&SessionId::from("nope"), "sdp"),
            )
            .unwrap_err();
        assert!(matches!(err, SignalError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn waiting_session_is_not_active() {
        let fx = Fixture::new();
        let _host_rx = fx.connect("host");
        let dto = fx
            .store
            .create_session(&DeviceId::from("host"), None)
            .unwrap();

        let err = fx
            .router
            .route(&DeviceId::from("host"), &offer_json(&dto.id, "sdp"))
            .unwrap_err();
        assert!(matches!(err, SignalError::SessionNotActive(_)));
    }

    #[tokio::test]
    async fn outsider_is_not_a_participant() {
        let fx = Fixture::new();
        let _host_rx = fx.connect("host");
        let _client_rx = fx.connect("client");
        let _intruder_rx = fx.connect("intruder");
        let session_id = fx.active_session("host", "client");

        let err = fx
            .router
            .route(&DeviceId::from("intruder"), &offer_json(&session_id, "sdp"))
            .unwrap_err();
        assert!(matches!(err, SignalError::NotAParticipant { .. }));
    }

    #[tokio::test]
    async fn disconnected_peer_is_unavailable() {
        let fx = Fixture::new();
        let _host_rx = fx.connect("host");
        // Client never connects.
        let session_id = fx.active_session("host", "client");

        let err = fx
            .router
            .route(&DeviceId::from("host"), &offer_json(&session_id, "sdp"))
            .unwrap_err();
        assert_eq!(err, SignalError::ConnectionUnavailable(DeviceId::from("client")));
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let fx = Fixture::new();
        let err = fx
            .router
            .route(&DeviceId::from("host"), "{not json")
            .unwrap_err();
        assert!(matches!(err, SignalError::MalformedMessage(_)));
    }

    #[tokio::test]
    async fn server_originated_types_are_rejected_inbound() {
        let fx = Fixture::new();
        let json = r#"{"type":"ERROR","payload":{"code":"X","message":"y"},"timestamp":0}"#;
        let err = fx
            .router
            .route(&DeviceId::from("host"), json)
            .unwrap_err();
        assert!(matches!(err, SignalError::MalformedMessage(_)));

        let json = r#"{"type":"CLIENT_JOINED","payload":{"sessionId":"s","clientDeviceId":"d"},"timestamp":0}"#;
        let err = fx
            .router
            .route(&DeviceId::from("host"), json)
            .unwrap_err();
        assert!(matches!(err, SignalError::MalformedMessage(_)));
    }

    #[tokio::test]
    async fn register_host_surfaces_as_control() {
        let fx = Fixture::new();
        let json = r#"{"type":"REGISTER_HOST","payload":{"password":"p1"},"timestamp":0}"#;
        let outcome = fx.router.route(&DeviceId::from("host"), json).unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Control(ControlRequest::RegisterHost {
                password: Some("p1".to_string())
            })
        );
    }

    #[tokio::test]
    async fn register_client_surfaces_as_control() {
        let fx = Fixture::new();
        let json = r#"{"type":"REGISTER_CLIENT","payload":{"sessionId":"s1"},"timestamp":0}"#;
        let outcome = fx.router.route(&DeviceId::from("client"), json).unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Control(ControlRequest::RegisterClient {
                session_id: SessionId::from("s1"),
                password: None
            })
        );
    }

    #[tokio::test]
    async fn forwarding_touches_the_session() {
        let fx = Fixture::new();
        let _host_rx = fx.connect("host");
        let _client_rx = fx.connect("client");
        let session_id = fx.active_session("host", "client");
        fx.store
            .backdate_activity(&session_id, std::time::Duration::from_secs(600));

        let _ = fx
            .router
            .route(&DeviceId::from("host"), &offer_json(&session_id, "sdp"))
            .unwrap();

        // Routing refreshed the activity clock, so the sweep spares it.
        let ended = fx.store.sweep_expired(std::time::Duration::from_secs(300));
        assert!(ended.is_empty());
    }
}
