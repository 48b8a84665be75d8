//! In-memory session table.
//!
//! Key business rules:
//!
//! - **Forward-only lifecycle**: `WAITING → ACTIVE → ENDED` or
//!   `WAITING → ENDED`; ended sessions accept no further mutation.
//! - **Single binding**: at most one client ever binds to a session, and
//!   a device holds at most one live hosting slot and one live client
//!   slot (`DeviceBusy` otherwise).
//! - **Serialized joins**: competing joins on one session are ordered by
//!   the per-session lock, so exactly one observes success.
//! - **Purge on end**: ending a session drops it from the table and both
//!   device indexes in the same step, so busy checks see only live state.
//!
//! Passwords are stored as SHA-256 digests; the plaintext never outlives
//! the create call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use tether_core::errors::{Result, SignalError};
use tether_core::ids::{DeviceId, SessionId};
use tether_core::session::{SessionDto, SessionStatus};

/// Why a session was ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// A party asked for the session to end.
    Explicit,
    /// The host or client connection went away.
    PeerDisconnected,
    /// No signaling traffic within the idle threshold.
    IdleTimeout,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Explicit => "ended by participant",
            Self::PeerDisconnected => "peer disconnected",
            Self::IdleTimeout => "session idle timeout",
        };
        f.write_str(text)
    }
}

/// Snapshot of a session that was just ended, for notification fan-out.
#[derive(Clone, Debug)]
pub struct EndedSession {
    /// The ended session.
    pub id: SessionId,
    /// Host at time of ending.
    pub host_device_id: DeviceId,
    /// Client at time of ending, if one ever joined.
    pub client_device_id: Option<DeviceId>,
    /// Why it ended.
    pub reason: EndReason,
}

impl EndedSession {
    /// Both participants, host first.
    pub fn participants(&self) -> impl Iterator<Item = &DeviceId> {
        std::iter::once(&self.host_device_id).chain(self.client_device_id.as_ref())
    }
}

struct SessionRecord {
    id: SessionId,
    status: SessionStatus,
    host_device_id: DeviceId,
    client_device_id: Option<DeviceId>,
    password_hash: Option<String>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl SessionRecord {
    fn dto(&self) -> SessionDto {
        SessionDto {
            id: self.id.clone(),
            status: self.status,
            host_device_id: self.host_device_id.clone(),
            client_device_id: self.client_device_id.clone(),
            started_at: self.started_at,
        }
    }
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Shared table of signaling sessions.
///
/// The table itself is a sharded map; each record sits behind its own
/// mutex so unrelated sessions never serialize against each other.
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<SessionRecord>>>,
    hosts: DashMap<DeviceId, SessionId>,
    clients: DashMap<DeviceId, SessionId>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            hosts: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    /// Create a `WAITING` session hosted by `host_device_id`.
    ///
    /// Fails with `DeviceBusy` when the device already hosts a live
    /// session.
    pub fn create_session(
        &self,
        host_device_id: &DeviceId,
        password: Option<&str>,
    ) -> Result<SessionDto> {
        let id = SessionId::generate();
        match self.hosts.entry(host_device_id.clone()) {
            Entry::Occupied(mut slot) => {
                if self.sessions.contains_key(slot.get()) {
                    return Err(SignalError::DeviceBusy(host_device_id.clone()));
                }
                let _ = slot.insert(id.clone());
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(id.clone());
            }
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: id.clone(),
            status: SessionStatus::Waiting,
            host_device_id: host_device_id.clone(),
            client_device_id: None,
            password_hash: password.map(hash_password),
            started_at: now,
            last_activity_at: now,
        };
        let dto = record.dto();
        let _ = self.sessions.insert(id.clone(), Arc::new(Mutex::new(record)));
        info!(session_id = %id, host = %host_device_id, "session created");
        Ok(dto)
    }

    /// Bind `client_device_id` to a `WAITING` session and activate it.
    ///
    /// Exactly one concurrent join can succeed; losers observe
    /// `AlreadyFull` (or `PasswordMismatch`) deterministically.
    pub fn join_session(
        &self,
        session_id: &SessionId,
        client_device_id: &DeviceId,
        password: Option<&str>,
    ) -> Result<SessionDto> {
        let record = self
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| SignalError::NotFound(session_id.clone()))?;

        // Reserve the client slot before taking the session lock; the
        // reservation is rolled back on any failure below.
        match self.clients.entry(client_device_id.clone()) {
            Entry::Occupied(mut slot) => {
                if self.sessions.contains_key(slot.get()) {
                    return Err(SignalError::DeviceBusy(client_device_id.clone()));
                }
                let _ = slot.insert(session_id.clone());
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(session_id.clone());
            }
        }

        let result = {
            let mut rec = record.lock();
            if rec.status.is_terminal() {
                Err(SignalError::NotFound(session_id.clone()))
            } else if rec.client_device_id.is_some() || rec.status == SessionStatus::Active {
                Err(SignalError::AlreadyFull(session_id.clone()))
            } else if &rec.host_device_id == client_device_id {
                Err(SignalError::DeviceBusy(client_device_id.clone()))
            } else if let Some(expected) = &rec.password_hash
                && password.is_none_or(|supplied| &hash_password(supplied) != expected)
            {
                Err(SignalError::PasswordMismatch)
            } else {
                rec.client_device_id = Some(client_device_id.clone());
                rec.status = SessionStatus::Active;
                rec.last_activity_at = Utc::now();
                Ok(rec.dto())
            }
        };

        match &result {
            Ok(dto) => {
                info!(session_id = %session_id, client = %client_device_id, "client joined session");
                debug_assert_eq!(dto.status, SessionStatus::Active);
            }
            Err(_) => {
                let _ = self
                    .clients
                    .remove_if(client_device_id, |_, bound| bound == session_id);
            }
        }
        result
    }

    /// End a session. Idempotent: returns `None` when the session is
    /// already gone. The record is purged and both device indexes are
    /// released.
    pub fn end_session(&self, session_id: &SessionId, reason: EndReason) -> Option<EndedSession> {
        let (_, record) = self.sessions.remove(session_id)?;
        let mut rec = record.lock();
        rec.status = SessionStatus::Ended;
        let _ = self
            .hosts
            .remove_if(&rec.host_device_id, |_, bound| bound == session_id);
        if let Some(client) = &rec.client_device_id {
            let _ = self.clients.remove_if(client, |_, bound| bound == session_id);
        }
        info!(session_id = %session_id, %reason, "session ended");
        Some(EndedSession {
            id: rec.id.clone(),
            host_device_id: rec.host_device_id.clone(),
            client_device_id: rec.client_device_id.clone(),
            reason,
        })
    }

    /// Refresh a session's activity clock. No-op for unknown sessions.
    pub fn touch(&self, session_id: &SessionId) {
        if let Some(record) = self.sessions.get(session_id) {
            record.lock().last_activity_at = Utc::now();
        }
    }

    /// Current view of a session, if it is live.
    pub fn get(&self, session_id: &SessionId) -> Option<SessionDto> {
        self.sessions
            .get(session_id)
            .map(|record| record.lock().dto())
    }

    /// Live sessions the device participates in, as host or client.
    pub fn sessions_for_device(&self, device_id: &DeviceId) -> Vec<SessionId> {
        let mut ids = Vec::with_capacity(2);
        if let Some(hosted) = self.hosts.get(device_id) {
            ids.push(hosted.clone());
        }
        if let Some(joined) = self.clients.get(device_id) {
            if !ids.contains(&joined) {
                ids.push(joined.clone());
            }
        }
        ids
    }

    /// End every session idle longer than `max_idle`; returns the ended
    /// sessions so callers can notify participants.
    pub fn sweep_expired(&self, max_idle: Duration) -> Vec<EndedSession> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().lock().last_activity_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut ended = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(session) = self.end_session(&id, EndReason::IdleTimeout) {
                debug!(session_id = %session.id, "session expired");
                ended.push(session);
            }
        }
        ended
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, session_id: &SessionId, by: Duration) {
        if let Some(record) = self.sessions.get(session_id) {
            let mut rec = record.lock();
            rec.last_activity_at -= chrono::Duration::from_std(by).unwrap();
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
