//! Session state and transfer types.
//!
//! All wire types use `#[serde(rename_all = "camelCase")]` and the status
//! enum serializes in SCREAMING_SNAKE form to match the JSON wire format
//! clients already speak.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, SessionId};

/// Lifecycle state of a signaling session.
///
/// Transitions only ever move forward: `WAITING → ACTIVE → ENDED`, or
/// `WAITING → ENDED` when the host abandons before a client joins.
/// `ENDED` is absorbing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Host registered, no client yet.
    Waiting,
    /// Client joined; negotiation may proceed.
    Active,
    /// Terminal. Closed by either party, timeout, or teardown.
    Ended,
}

impl SessionStatus {
    /// Whether this is the terminal state.
    pub fn is_terminal(self) -> bool {
        self == Self::Ended
    }
}

/// Public view of a session, returned by create/join calls and carried
/// in `SESSION_CREATED` envelopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDto {
    /// Session id.
    pub id: SessionId,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Device that created the session.
    pub host_device_id: DeviceId,
    /// Device that joined, `null` while waiting.
    pub client_device_id: Option<DeviceId>,
    /// Creation time.
    pub started_at: DateTime<Utc>,
}

/// Request body for creating a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Device that will host the session.
    pub host_device_id: DeviceId,
    /// Optional session password. Stored hashed; joins must supply it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Request body for joining a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
    /// Session to join.
    pub session_id: SessionId,
    /// Device joining as client.
    pub client_device_id: DeviceId,
    /// Password, required when the session was created with one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}
