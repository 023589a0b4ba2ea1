//! Remote blob store: one encrypted document per owner
//!
//! The store is a dumb blob keyed by owner identity. Metadata queries return
//! only the timestamp and device tag so polling never transfers the payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceId;
use crate::session::OwnerId;

pub mod drive;
pub mod http;
pub mod memory;

pub use drive::DriveBlobClient;
pub use http::HttpBlobClient;
pub use memory::MemoryBlobClient;

/// Wire and storage representation of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    /// False for legacy unencrypted backups, whose payload is plain JSON.
    pub is_encrypted: bool,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
    /// Device that wrote the blob. Missing on blobs from older clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

impl EncryptedBlob {
    /// Decode the JSON a remote store holds for an owner.
    ///
    /// Encrypted blobs are parsed as they are. Anything without
    /// `isEncrypted: true` is a legacy unencrypted backup: either the
    /// `{isEncrypted: false, payload}` envelope or the bare document
    /// object, which becomes the plaintext payload.
    pub fn from_stored(data: serde_json::Value, updated_at: DateTime<Utc>) -> RemoteResult<Self> {
        let encrypted = data
            .get("isEncrypted")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if encrypted {
            let mut blob: Self = serde_json::from_value(data)
                .map_err(|e| RemoteError::Protocol(format!("encrypted blob: {e}")))?;
            blob.updated_at = updated_at;
            return Ok(blob);
        }

        let payload = match data.get("payload").and_then(serde_json::Value::as_str) {
            Some(payload) => payload.to_string(),
            None if data.is_object() => data.to_string(),
            None => {
                return Err(RemoteError::Protocol(
                    "stored data is neither a blob nor a document".to_string(),
                ))
            }
        };

        Ok(Self {
            is_encrypted: false,
            payload,
            updated_at,
            device_id: None,
        })
    }

    pub fn metadata(&self) -> RemoteMetadata {
        RemoteMetadata {
            updated_at: self.updated_at,
            device_id: self.device_id.clone(),
        }
    }
}

/// Freshness information for the remote copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetadata {
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("No remote copy: {0}")]
    NotFound(String),

    #[error("Remote rejected credentials: {0}")]
    AuthExpired(String),

    #[error("Remote unavailable: {0}")]
    Network(String),

    #[error("Unexpected remote response: {0}")]
    Protocol(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Access to the owner's single remote blob.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteBlobClient: Send + Sync {
    /// Timestamp and device tag of the remote copy, `None` if there is none.
    async fn get_metadata(&self, owner: &OwnerId) -> RemoteResult<Option<RemoteMetadata>>;

    /// The full blob. Fails with [`RemoteError::NotFound`] if absent.
    async fn fetch(&self, owner: &OwnerId) -> RemoteResult<EncryptedBlob>;

    /// Create or replace the owner's blob. Returns the metadata the store
    /// recorded for it.
    async fn upsert(&self, owner: &OwnerId, blob: &EncryptedBlob) -> RemoteResult<RemoteMetadata>;
}
