//! Observable engine state and user-facing notices

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::conflict::PendingConflict;
use crate::merge::MergeReport;

/// The single authoritative sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No local changes since the last successful sync.
    Clean,
    /// Local changes are waiting to be uploaded.
    Dirty,
    /// A network round trip is in flight.
    Syncing,
    /// Remote is newer than the watermark while local changes are pending.
    ConflictPending,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Syncing => "syncing",
            Self::ConflictPending => "conflict_pending",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to subscribers after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub dirty: bool,
    pub syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub conflict: Option<PendingConflict>,
    pub authenticated: bool,
    pub unlocked: bool,
    pub last_error: Option<String>,
    /// Legacy data found at startup could not be migrated. It is left in
    /// place and migration is retried on the next start.
    pub migration_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Clean,
            dirty: false,
            syncing: false,
            last_synced_at: None,
            conflict: None,
            authenticated: false,
            unlocked: false,
            last_error: None,
            migration_error: None,
        }
    }
}

/// One-off events for the UI: toasts, prompts, dialogs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncNotice {
    Uploaded { at: DateTime<Utc> },
    Downloaded { at: DateTime<Utc> },
    Merged { at: DateTime<Utc>, report: MergeReport },
    /// Remote changed while local is clean; downloading is optional.
    NewerRemoteAvailable { remote_time: DateTime<Utc> },
    ConflictDetected { conflict: PendingConflict },
    NoRemoteCopy,
    /// Authenticated but no passphrase; sync is blocked until unlock.
    PassphraseRequired,
    /// Decryption failed. The passphrase was discarded.
    PassphraseRejected,
    /// The remote rejected the session; the user was signed out.
    ReauthenticationRequired,
    SyncFailed { message: String },
    /// The downloaded blob was an unencrypted legacy backup.
    LegacyPlaintext,
    /// A request arrived mid-sync and will run afterwards.
    Deferred,
}
