//! Error types for the sync engine

use journal_crypto::CryptoError;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Wrong passphrase or corrupted ciphertext.
    #[error("Wrong passphrase or corrupted data: {0}")]
    Decryption(String),

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Legacy data could not be migrated; the original keys are left untouched.
    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Passphrase required")]
    PassphraseRequired,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Encryption error: {0}")]
    Crypto(CryptoError),

    #[error("Sync engine has stopped")]
    EngineStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Failures that the next natural trigger (mutation, poll, user action) may fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SyncError::AuthExpired(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<CryptoError> for SyncError {
    fn from(err: CryptoError) -> Self {
        if err.is_authentication_failure() {
            SyncError::Decryption(err.to_string())
        } else {
            SyncError::Crypto(err)
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(msg) => SyncError::NotFound(msg),
            RemoteError::AuthExpired(msg) => SyncError::AuthExpired(msg),
            RemoteError::Network(msg) => SyncError::Network(msg),
            RemoteError::Protocol(msg) => SyncError::Deserialization(msg),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
