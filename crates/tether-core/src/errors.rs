//! Signaling error types.
//!
//! Every variant is recoverable: it is reported to the originating
//! connection as an `ERROR` envelope and never tears down the relay or
//! unrelated sessions. [`SignalError::code`] gives the stable wire code
//! carried in the envelope.

use thiserror::Error;

use crate::envelope::ErrorPayload;
use crate::ids::{DeviceId, SessionId};

/// Errors produced by session and routing operations.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SignalError {
    /// The device already participates in a live session.
    #[error("device {0} already has an active session")]
    DeviceBusy(DeviceId),
    /// Create/join target does not exist or has ended.
    #[error("session {0} not found")]
    NotFound(SessionId),
    /// A client is already bound to the session.
    #[error("session {0} already has a client")]
    AlreadyFull(SessionId),
    /// The session requires a password and the supplied one does not match.
    #[error("session password does not match")]
    PasswordMismatch,
    /// Negotiation message for a session that is not `ACTIVE`.
    #[error("session {0} is not active")]
    SessionNotActive(SessionId),
    /// Negotiation message whose session id does not resolve.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// Sender is neither the host nor the client of the session.
    #[error("device {device} is not a participant of session {session}")]
    NotAParticipant {
        /// Referenced session.
        session: SessionId,
        /// Offending sender.
        device: DeviceId,
    },
    /// Frame failed schema validation before routing.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// The target peer has no live registered connection.
    #[error("no live connection for device {0}")]
    ConnectionUnavailable(DeviceId),
}

impl SignalError {
    /// Stable machine-readable code for the `ERROR` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceBusy(_) => "DEVICE_BUSY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyFull(_) => "ALREADY_FULL",
            Self::PasswordMismatch => "PASSWORD_MISMATCH",
            Self::SessionNotActive(_) => "SESSION_NOT_ACTIVE",
            Self::UnknownSession(_) => "UNKNOWN_SESSION",
            Self::NotAParticipant { .. } => "NOT_A_PARTICIPANT",
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::ConnectionUnavailable(_) => "CONNECTION_UNAVAILABLE",
        }
    }

    /// Build the `ERROR` envelope payload for this error.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Result type for signaling operations.
pub type Result<T> = std::result::Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let session = SessionId::from("s1");
        let device = DeviceId::from("d1");
        let cases: Vec<(SignalError, &str)> = vec![
            (SignalError::DeviceBusy(device.clone()), "DEVICE_BUSY"),
            (SignalError::NotFound(session.clone()), "NOT_FOUND"),
            (SignalError::AlreadyFull(session.clone()), "ALREADY_FULL"),
            (SignalError::PasswordMismatch, "PASSWORD_MISMATCH"),
            (
                SignalError::SessionNotActive(session.clone()),
                "SESSION_NOT_ACTIVE",
            ),
            (
                SignalError::UnknownSession(session.clone()),
                "UNKNOWN_SESSION",
            ),
            (
                SignalError::NotAParticipant {
                    session: session.clone(),
                    device: device.clone(),
                },
                "NOT_A_PARTICIPANT",
            ),
            (
                SignalError::MalformedMessage("bad".into()),
                "MALFORMED_MESSAGE",
            ),
            (
                SignalError::ConnectionUnavailable(device),
                "CONNECTION_UNAVAILABLE",
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn payload_carries_code_and_reason() {
        let err = SignalError::NotFound(SessionId::from("s9"));
        let payload = err.to_payload();
        assert_eq!(payload.code, "NOT_FOUND");
        assert!(payload.message.contains("s9"));
    }

    #[test]
    fn display_names_the_offender() {
        let err = SignalError::NotAParticipant {
            session: SessionId::from("s1"),
            device: DeviceId::from("intruder"),
        };
        let text = err.to_string();
        assert!(text.contains("intruder"));
        assert!(text.contains("s1"));
    }
}
