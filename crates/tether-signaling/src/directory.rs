//! Persistence collaborator seam.
//!
//! The relay consults a [`DeviceDirectory`] exactly once per WebSocket
//! registration to resolve the connecting device's identity. Nothing on
//! the negotiation hot path touches it. Production deployments back this
//! with their user/device database; [`InMemoryDirectory`] serves tests
//! and single-node setups.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use tether_core::ids::DeviceId;

/// Errors from the directory backend.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The backend could not serve the lookup.
    #[error("directory backend unavailable: {0}")]
    Unavailable(String),
}

/// A known user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Stable user id.
    pub id: String,
    /// Login email.
    pub email: String,
    /// Display name.
    pub name: String,
}

/// A known device, owned by a user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Stable device id — the identity connections register under.
    pub id: DeviceId,
    /// Owning user.
    pub user_id: String,
    /// Device display name.
    pub name: String,
    /// Operating system tag (`linux`, `mac`, ...).
    pub os: String,
}

/// Lookup/create interface onto the external persistence layer.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Find a user by email, creating the record if missing.
    async fn find_or_create_user(
        &self,
        email: &str,
        name: &str,
    ) -> Result<UserRecord, DirectoryError>;

    /// Find a user's device by name, creating the record if missing.
    async fn find_or_create_device(
        &self,
        user_id: &str,
        name: &str,
        os: &str,
    ) -> Result<DeviceRecord, DirectoryError>;
}

/// Directory held entirely in memory.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: DashMap<String, UserRecord>,
    devices: DashMap<(String, String), DeviceRecord>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryDirectory {
    async fn find_or_create_user(
        &self,
        email: &str,
        name: &str,
    ) -> Result<UserRecord, DirectoryError> {
        let record = self
            .users
            .entry(email.to_string())
            .or_insert_with(|| {
                debug!(email, "creating user record");
                UserRecord {
                    id: Uuid::now_v7().to_string(),
                    email: email.to_string(),
                    name: name.to_string(),
                }
            })
            .clone();
        Ok(record)
    }

    async fn find_or_create_device(
        &self,
        user_id: &str,
        name: &str,
        os: &str,
    ) -> Result<DeviceRecord, DirectoryError> {
        let record = self
            .devices
            .entry((user_id.to_string(), name.to_string()))
            .or_insert_with(|| {
                debug!(user_id, name, os, "creating device record");
                DeviceRecord {
                    id: DeviceId::new(Uuid::now_v7().to_string()),
                    user_id: user_id.to_string(),
                    name: name.to_string(),
                    os: os.to_string(),
                }
            })
            .clone();
        Ok(record)
    }
}
