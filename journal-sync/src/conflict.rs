//! Conflict detection and resolution strategies
//!
//! The watermark records when this device last reconciled with the remote
//! store. A remote copy counts as newer when its timestamp passes the
//! watermark and it was not written by this device. Client-stamped
//! watermarks get a clock-skew allowance; watermarks taken from the remote
//! store's own timestamps are compared strictly.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::device::DeviceId;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteMetadata;

/// Which clock produced a watermark timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkSource {
    /// Timestamp reported by the remote store.
    Server,
    /// Timestamp taken from this device's clock.
    Client,
}

/// Time of the last successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub at: DateTime<Utc>,
    pub source: WatermarkSource,
}

impl Watermark {
    pub fn server(at: DateTime<Utc>) -> Self {
        Self {
            at,
            source: WatermarkSource::Server,
        }
    }

    pub fn client(at: DateTime<Utc>) -> Self {
        Self {
            at,
            source: WatermarkSource::Client,
        }
    }

    /// Decode a persisted watermark. Accepts the JSON form written by
    /// [`encode`](Self::encode) and a bare RFC 3339 timestamp, which older
    /// clients stored from their own clock.
    pub fn decode(raw: &str) -> SyncResult<Self> {
        let raw = raw.trim();
        if raw.starts_with('{') {
            return serde_json::from_str(raw)
                .map_err(|e| SyncError::Deserialization(format!("watermark: {e}")));
        }

        let bare = raw.trim_matches('"');
        DateTime::parse_from_rfc3339(bare)
            .map(|at| Self::client(at.with_timezone(&Utc)))
            .map_err(|e| SyncError::Deserialization(format!("watermark '{bare}': {e}")))
    }

    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Strategy for resolving a pending conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionStrategy {
    /// Upload the local document without checking the remote copy
    ForceUpload,
    /// Discard local changes and take the remote document
    OverwriteLocal,
    /// Combine both documents, then force-upload the result
    Merge,
}

impl ConflictResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForceUpload => "force_upload",
            Self::OverwriteLocal => "overwrite_local",
            Self::Merge => "merge",
        }
    }
}

impl FromStr for ConflictResolutionStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "force_upload" | "force-upload" | "upload" => Ok(Self::ForceUpload),
            "overwrite_local" | "overwrite-local" | "download" => Ok(Self::OverwriteLocal),
            "merge" => Ok(Self::Merge),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown resolution strategy: {s}. Valid options: force_upload, overwrite_local, merge"
            ))),
        }
    }
}

impl fmt::Display for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine does when it enters `ConflictPending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Wait for the user to pick a strategy.
    #[default]
    Manual,
    /// Apply a strategy immediately.
    Auto(ConflictResolutionStrategy),
}

impl FromStr for ConflictPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" | "ask" => Ok(Self::Manual),
            other => other
                .parse()
                .map(Self::Auto)
                .map_err(|_| {
                    SyncError::Configuration(format!(
                        "Unknown conflict policy: {s}. Valid options: manual, force_upload, overwrite_local, merge"
                    ))
                }),
        }
    }
}

/// An unresolved conflict, kept until the user or policy picks a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConflict {
    /// Local watermark when the conflict was detected.
    pub local_time: Option<DateTime<Utc>>,
    pub remote_time: DateTime<Utc>,
    pub remote_device: Option<DeviceId>,
    pub detected_at: DateTime<Utc>,
}

/// Decides whether a remote copy is newer than what this device last synced.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    device_id: DeviceId,
    tolerance: Duration,
}

impl ConflictDetector {
    pub fn new(device_id: DeviceId, tolerance: std::time::Duration) -> Self {
        Self {
            device_id,
            tolerance: Duration::from_std(tolerance).unwrap_or_else(|_| Duration::zero()),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn is_own_upload(&self, remote: &RemoteMetadata) -> bool {
        remote.device_id.as_ref() == Some(&self.device_id)
    }

    /// True when `remote` was written by another device after `watermark`.
    pub fn remote_is_newer(&self, watermark: Option<&Watermark>, remote: &RemoteMetadata) -> bool {
        if self.is_own_upload(remote) {
            return false;
        }

        let Some(watermark) = watermark else {
            // never synced: any foreign copy is news
            return true;
        };

        let threshold = match watermark.source {
            WatermarkSource::Server => watermark.at,
            WatermarkSource::Client => watermark
                .at
                .checked_add_signed(self.tolerance)
                .unwrap_or(watermark.at),
        };

        remote.updated_at > threshold
    }
}
