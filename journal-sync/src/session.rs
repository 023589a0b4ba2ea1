//! Session credentials: the signed-in owner and the volatile passphrase
//!
//! The passphrase only lives in memory. It zeroes on drop, prints as
//! `<redacted>`, and has no `Serialize` impl, so it cannot reach the local
//! store, the remote store, or the logs by accident.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// Authenticated identity owning exactly one remote blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> SyncResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SyncError::InvalidOperation(
                "owner id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User-supplied encryption passphrase.
pub struct Passphrase(SecretString);

impl Passphrase {
    pub fn new(passphrase: impl Into<String>) -> SyncResult<Self> {
        let passphrase = passphrase.into();
        if passphrase.is_empty() {
            return Err(SyncError::InvalidOperation(
                "passphrase must not be empty".to_string(),
            ));
        }
        Ok(Self(SecretString::new(passphrase)))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for Passphrase {
    fn clone(&self) -> Self {
        Self(SecretString::new(self.0.expose_secret().clone()))
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Who is signed in and whether the document key is available.
#[derive(Debug, Default)]
pub struct Session {
    owner: Option<OwnerId>,
    passphrase: Option<Passphrase>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign in as `owner`. Switching owners drops the previous passphrase.
    pub fn login(&mut self, owner: OwnerId) {
        if self.owner.as_ref() != Some(&owner) {
            self.passphrase = None;
        }
        self.owner = Some(owner);
    }

    /// Sign out, discarding owner and passphrase.
    pub fn logout(&mut self) {
        self.owner = None;
        self.passphrase = None;
    }

    pub fn unlock(&mut self, passphrase: Passphrase) {
        self.passphrase = Some(passphrase);
    }

    pub fn lock(&mut self) {
        self.passphrase = None;
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        self.owner.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_unlocked(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Owner and passphrase, or the reason sync cannot proceed.
    pub fn credentials(&self) -> SyncResult<(&OwnerId, &Passphrase)> {
        let owner = self.owner.as_ref().ok_or(SyncError::NotAuthenticated)?;
        let passphrase = self
            .passphrase
            .as_ref()
            .ok_or(SyncError::PassphraseRequired)?;
        Ok((owner, passphrase))
    }
}
