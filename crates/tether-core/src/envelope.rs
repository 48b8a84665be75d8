//! The wire envelope for every signaling message.
//!
//! One JSON object per frame: `{ "type": ..., "payload": ..., "timestamp": ... }`
//! with `timestamp` in epoch milliseconds. The `type`/`payload` pair is an
//! adjacently tagged union — unknown tags and payload shape mismatches fail
//! decoding at the transport boundary and never reach routing logic.
//!
//! Negotiation payloads (`WEBRTC_OFFER`, `WEBRTC_ANSWER`, `ICE_CANDIDATE`)
//! are relayed without interpretation: `sdp` is an opaque string and
//! `candidate` is kept as raw JSON.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{DeviceId, SessionId};
use crate::session::SessionDto;

/// A framed signaling message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type and type-specific payload.
    #[serde(flatten)]
    pub body: SignalMessage,
    /// Sender-side epoch milliseconds.
    pub timestamp: i64,
}

impl Envelope {
    /// Wrap a message with the current time.
    pub fn now(body: SignalMessage) -> Self {
        Self {
            body,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// The signaling message union, tagged by `type` with the payload under
/// `payload`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    /// Device asks to host a new session.
    RegisterHost(RegisterHostPayload),
    /// Device asks to join an existing session as client.
    RegisterClient(RegisterClientPayload),
    /// Relay → host: the session was created.
    SessionCreated(SessionDto),
    /// Relay → both parties: a client joined the session.
    ClientJoined(ClientJoinedPayload),
    /// SDP offer, relayed verbatim host → client.
    WebrtcOffer(SdpPayload),
    /// SDP answer, relayed verbatim client → host.
    WebrtcAnswer(SdpPayload),
    /// ICE candidate, relayed verbatim in either direction.
    IceCandidate(IceCandidatePayload),
    /// Relay → device: a request failed or the session was terminated.
    Error(ErrorPayload),
}

/// Payload of `REGISTER_HOST`. The hosting device is identified by its
/// connection, not by the payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterHostPayload {
    /// Optional session password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Payload of `REGISTER_CLIENT`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClientPayload {
    /// Session to join.
    pub session_id: SessionId,
    /// Password, required when the session has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Payload of `CLIENT_JOINED`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoinedPayload {
    /// The joined session.
    pub session_id: SessionId,
    /// The device now bound as client.
    pub client_device_id: DeviceId,
}

/// Payload of `WEBRTC_OFFER` and `WEBRTC_ANSWER`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    /// Session the negotiation belongs to.
    pub session_id: SessionId,
    /// Session Description Protocol blob, not interpreted by the relay.
    pub sdp: String,
}

/// Payload of `ICE_CANDIDATE`.
///
/// `sdp_mid` and `sdp_m_line_index` serialize as explicit `null` when
/// absent, matching the browser RTCIceCandidate shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    /// Session the negotiation belongs to.
    pub session_id: SessionId,
    /// Candidate description, kept as opaque JSON.
    pub candidate: Value,
    /// Media stream identification tag.
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate applies to.
    pub sdp_m_line_index: Option<i64>,
}

/// Payload of `ERROR`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable reason.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(json: &str) -> Envelope {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn offer_envelope_roundtrip() {
        let json = r#"{"type":"WEBRTC_OFFER","payload":{"sessionId":"s1","sdp":"v=0..."},"timestamp":1700000000000}"#;
        let env = decode(json);
        match &env.body {
            SignalMessage::WebrtcOffer(p) => {
                assert_eq!(p.session_id, SessionId::from("s1"));
                assert_eq!(p.sdp, "v=0...");
            }
            other => panic!("unexpected body: {other:?}"),
        }
        assert_eq!(env.timestamp, 1_700_000_000_000);

        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back["type"], "WEBRTC_OFFER");
        assert_eq!(back["payload"]["sdp"], "v=0...");
        assert_eq!(back["timestamp"], 1_700_000_000_000_i64);
    }

    #[test]
    fn tag_names_match_wire_protocol() {
        let cases = [
            (
                SignalMessage::RegisterHost(RegisterHostPayload::default()),
                "REGISTER_HOST",
            ),
            (
                SignalMessage::RegisterClient(RegisterClientPayload {
                    session_id: SessionId::from("s"),
                    password: None,
                }),
                "REGISTER_CLIENT",
            ),
            (
                SignalMessage::ClientJoined(ClientJoinedPayload {
                    session_id: SessionId::from("s"),
                    client_device_id: DeviceId::from("d"),
                }),
                "CLIENT_JOINED",
            ),
            (
                SignalMessage::WebrtcAnswer(SdpPayload {
                    session_id: SessionId::from("s"),
                    sdp: String::new(),
                }),
                "WEBRTC_ANSWER",
            ),
            (
                SignalMessage::IceCandidate(IceCandidatePayload {
                    session_id: SessionId::from("s"),
                    candidate: Value::Null,
                    sdp_mid: None,
                    sdp_m_line_index: None,
                }),
                "ICE_CANDIDATE",
            ),
            (
                SignalMessage::Error(ErrorPayload {
                    code: "NOT_FOUND".into(),
                    message: String::new(),
                }),
                "ERROR",
            ),
        ];
        for (body, tag) in cases {
            let value = serde_json::to_value(Envelope::now(body)).unwrap();
            assert_eq!(value["type"], tag);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let json = r#"{"type":"MEDIA_FRAME","payload":{},"timestamp":0}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn missing_type_is_rejected() {
        let json = r#"{"payload":{"sessionId":"s1","sdp":"x"},"timestamp":0}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn payload_shape_mismatch_is_rejected() {
        // WEBRTC_OFFER without an sdp field.
        let json = r#"{"type":"WEBRTC_OFFER","payload":{"sessionId":"s1"},"timestamp":0}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn ice_candidate_nulls_are_explicit() {
        let body = SignalMessage::IceCandidate(IceCandidatePayload {
            session_id: SessionId::from("s1"),
            candidate: serde_json::json!({"candidate": "candidate:0 1 UDP ..."}),
            sdp_mid: None,
            sdp_m_line_index: None,
        });
        let value = serde_json::to_value(Envelope::now(body)).unwrap();
        assert_eq!(value["payload"]["sdpMid"], Value::Null);
        assert_eq!(value["payload"]["sdpMLineIndex"], Value::Null);
    }

    #[test]
    fn candidate_json_survives_untouched() {
        let json = r#"{"type":"ICE_CANDIDATE","payload":{"sessionId":"s1","candidate":{"candidate":"candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host","usernameFragment":"abcd"},"sdpMid":"0","sdpMLineIndex":0},"timestamp":5}"#;
        let env = decode(json);
        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(
            back["payload"]["candidate"]["candidate"],
            "candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host"
        );
        assert_eq!(back["payload"]["candidate"]["usernameFragment"], "abcd");
        assert_eq!(back["payload"]["sdpMid"], "0");
    }

    #[test]
    fn register_host_allows_empty_payload() {
        let json = r#"{"type":"REGISTER_HOST","payload":{},"timestamp":1}"#;
        let env = decode(json);
        assert!(matches!(
            env.body,
            SignalMessage::RegisterHost(RegisterHostPayload { password: None })
        ));
    }
}
