//! Sync state machine
//!
//! A pure transition function: [`SyncMachine::handle`] takes an [`Event`]
//! and returns the [`Action`]s the driver must perform. It owns no timers,
//! sockets or storage, so every ordering rule can be tested directly.
//!
//! Network work is identified by a [`TaskId`]. Completions carrying an id
//! other than the one in flight (for example after a logout) are ignored.

use chrono::{DateTime, Utc};

use crate::config::SyncConfig;
use crate::conflict::{ConflictDetector, ConflictPolicy, ConflictResolutionStrategy, PendingConflict, Watermark};
use crate::error::{SyncError, SyncResult};
use crate::merge::MergeReport;
use crate::remote::RemoteMetadata;
use crate::status::{SyncNotice, SyncState, SyncStatus};

pub type TaskId = u64;

/// Policy switches the machine needs from [`SyncConfig`].
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    pub auto_sync: bool,
    pub conflict_policy: ConflictPolicy,
    pub initial_download: bool,
}

impl From<&SyncConfig> for MachineConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            auto_sync: config.auto_sync,
            conflict_policy: config.conflict_policy,
            initial_download: config.initial_download,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// Replace the local document with the remote one.
    Replace,
    /// Merge the remote document into the local one.
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTask {
    /// Metadata check ahead of an upload.
    PreUploadCheck,
    /// Periodic or on-focus freshness check.
    Poll,
    /// First check after unlock.
    InitialCheck,
    /// Metadata check ahead of a manual download over unsynced edits.
    PreDownloadCheck,
    /// Unconditional upload; `merged` is set when uploading a merge result.
    Upload { merged: Option<MergeReport> },
    Download(DownloadMode),
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Local generation the uploaded snapshot was taken at.
    pub generation: u64,
    pub metadata: RemoteMetadata,
}

/// Result of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReceipt {
    /// Local generation after the downloaded document was written. `None`
    /// when a local edit landed while the remote copy was in flight and the
    /// replace was skipped.
    pub generation: Option<u64>,
    pub metadata: RemoteMetadata,
    pub merge: Option<MergeReport>,
    pub legacy_plaintext: bool,
}

#[derive(Debug)]
pub enum Event {
    /// The local store was written at `generation`.
    LocalMutation { generation: u64 },
    /// The local document is newer than the watermark (found at startup
    /// or login).
    LocalAhead,
    DebounceElapsed,
    /// Manual upload.
    SyncRequested,
    /// Poll timer or window focus.
    PollRequested,
    /// Manual download.
    DownloadRequested,
    Resolve(ConflictResolutionStrategy),
    LoggedIn,
    LoggedOut,
    Unlocked,
    Locked,
    RemoteChecked {
        task: TaskId,
        result: SyncResult<Option<RemoteMetadata>>,
    },
    Uploaded {
        task: TaskId,
        result: SyncResult<UploadReceipt>,
    },
    Downloaded {
        task: TaskId,
        result: SyncResult<DownloadReceipt>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// (Re)start the debounce timer.
    ArmDebounce,
    CancelDebounce,
    CheckRemote { task: TaskId },
    Upload { task: TaskId },
    Download { task: TaskId, mode: DownloadMode },
    PersistWatermark(Watermark),
    DiscardPassphrase,
    ForceLogout,
    Notify(SyncNotice),
}

#[derive(Debug, Clone)]
struct InFlight {
    id: TaskId,
    task: SyncTask,
    /// Conflict being resolved; restored if the task fails.
    resolving: Option<PendingConflict>,
}

#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Syncing(InFlight),
    Conflict(PendingConflict),
}

/// Requests that arrived while a task was in flight.
#[derive(Debug, Default)]
struct Deferred {
    upload: bool,
    poll: bool,
    download: bool,
}

#[derive(Debug)]
pub struct SyncMachine {
    config: MachineConfig,
    detector: ConflictDetector,
    phase: Phase,
    dirty: bool,
    /// Highest generation reported by a local mutation.
    last_mutation: u64,
    /// Highest generation known to be reconciled with the remote.
    covered: u64,
    watermark: Option<Watermark>,
    authenticated: bool,
    unlocked: bool,
    deferred: Deferred,
    next_task: TaskId,
    last_error: Option<String>,
    migration_error: Option<String>,
}

impl SyncMachine {
    pub fn new(config: MachineConfig, detector: ConflictDetector, watermark: Option<Watermark>) -> Self {
        Self {
            config,
            detector,
            phase: Phase::Idle,
            dirty: false,
            last_mutation: 0,
            covered: 0,
            watermark,
            authenticated: false,
            unlocked: false,
            deferred: Deferred::default(),
            next_task: 0,
            last_error: None,
            migration_error: None,
        }
    }

    /// Legacy data could not be migrated at startup. Kept in the status
    /// until the engine is restarted.
    pub fn set_migration_error(&mut self, message: impl Into<String>) {
        self.migration_error = Some(message.into());
    }

    pub fn state(&self) -> SyncState {
        match self.phase {
            Phase::Syncing(_) => SyncState::Syncing,
            Phase::Conflict(_) => SyncState::ConflictPending,
            Phase::Idle if self.dirty => SyncState::Dirty,
            Phase::Idle => SyncState::Clean,
        }
    }

    pub fn watermark(&self) -> Option<&Watermark> {
        self.watermark.as_ref()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            state: self.state(),
            dirty: self.dirty,
            syncing: matches!(self.phase, Phase::Syncing(_)),
            last_synced_at: self.watermark.map(|w| w.at),
            conflict: match &self.phase {
                Phase::Conflict(conflict) => Some(conflict.clone()),
                _ => None,
            },
            authenticated: self.authenticated,
            unlocked: self.unlocked,
            last_error: self.last_error.clone(),
            migration_error: self.migration_error.clone(),
        }
    }

    pub fn handle(&mut self, event: Event, now: DateTime<Utc>) -> Vec<Action> {
        match event {
            Event::LocalMutation { generation } => self.on_local_mutation(generation),
            Event::LocalAhead => self.on_local_ahead(),
            Event::DebounceElapsed => self.on_debounce_elapsed(),
            Event::SyncRequested => self.on_sync_requested(),
            Event::PollRequested => self.on_poll_requested(),
            Event::DownloadRequested => self.on_download_requested(),
            Event::Resolve(strategy) => self.resolve(strategy),
            Event::LoggedIn => self.on_logged_in(),
            Event::LoggedOut => self.on_logged_out(),
            Event::Unlocked => self.on_unlocked(),
            Event::Locked => {
                self.unlocked = false;
                Vec::new()
            }
            Event::RemoteChecked { task, result } => self.on_remote_checked(task, result, now),
            Event::Uploaded { task, result } => self.on_uploaded(task, result),
            Event::Downloaded { task, result } => self.on_downloaded(task, result, now),
        }
    }

    fn on_local_mutation(&mut self, generation: u64) -> Vec<Action> {
        if generation <= self.covered {
            // already part of a reconciled snapshot
            return Vec::new();
        }

        self.last_mutation = self.last_mutation.max(generation);
        self.dirty = true;

        match self.phase {
            Phase::Idle if self.config.auto_sync => vec![Action::ArmDebounce],
            _ => Vec::new(),
        }
    }

    fn on_local_ahead(&mut self) -> Vec<Action> {
        self.dirty = true;
        match self.phase {
            Phase::Idle if self.config.auto_sync => vec![Action::ArmDebounce],
            _ => Vec::new(),
        }
    }

    fn on_debounce_elapsed(&mut self) -> Vec<Action> {
        if !self.dirty {
            return Vec::new();
        }

        match self.phase {
            // suppressed until the conflict is resolved
            Phase::Conflict(_) => Vec::new(),
            Phase::Syncing(_) => {
                self.deferred.upload = true;
                Vec::new()
            }
            Phase::Idle => {
                if !self.authenticated {
                    return Vec::new();
                }
                if !self.unlocked {
                    return vec![Action::Notify(SyncNotice::PassphraseRequired)];
                }
                self.start(SyncTask::PreUploadCheck, None)
            }
        }
    }

    fn on_sync_requested(&mut self) -> Vec<Action> {
        match &self.phase {
            Phase::Conflict(conflict) => vec![Action::Notify(SyncNotice::ConflictDetected {
                conflict: conflict.clone(),
            })],
            Phase::Syncing(_) => {
                self.deferred.upload = true;
                vec![Action::Notify(SyncNotice::Deferred)]
            }
            Phase::Idle => match self.blocked() {
                Some(notice) => vec![Action::Notify(notice)],
                None => self.start(SyncTask::PreUploadCheck, None),
            },
        }
    }

    fn on_poll_requested(&mut self) -> Vec<Action> {
        match self.phase {
            Phase::Idle if self.authenticated && self.unlocked => self.start(SyncTask::Poll, None),
            Phase::Syncing(_) => {
                self.deferred.poll = true;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_download_requested(&mut self) -> Vec<Action> {
        match self.phase {
            Phase::Conflict(_) => self.resolve(ConflictResolutionStrategy::OverwriteLocal),
            Phase::Syncing(_) => {
                self.deferred.download = true;
                vec![Action::Notify(SyncNotice::Deferred)]
            }
            Phase::Idle => match self.blocked() {
                Some(notice) => vec![Action::Notify(notice)],
                None if self.dirty => self.start(SyncTask::PreDownloadCheck, None),
                None => self.start(SyncTask::Download(DownloadMode::Replace), None),
            },
        }
    }

    fn resolve(&mut self, strategy: ConflictResolutionStrategy) -> Vec<Action> {
        let Phase::Conflict(conflict) = &self.phase else {
            tracing::debug!(strategy = strategy.as_str(), "No conflict to resolve");
            return Vec::new();
        };

        if let Some(notice) = self.blocked() {
            return vec![Action::Notify(notice)];
        }

        let conflict = conflict.clone();
        let task = match strategy {
            ConflictResolutionStrategy::ForceUpload => SyncTask::Upload { merged: None },
            ConflictResolutionStrategy::OverwriteLocal => SyncTask::Download(DownloadMode::Replace),
            ConflictResolutionStrategy::Merge => SyncTask::Download(DownloadMode::Merge),
        };

        tracing::info!(strategy = strategy.as_str(), "Resolving conflict");
        self.start(task, Some(conflict))
    }

    fn on_logged_in(&mut self) -> Vec<Action> {
        self.authenticated = true;
        if self.unlocked {
            self.after_unlock()
        } else {
            vec![Action::Notify(SyncNotice::PassphraseRequired)]
        }
    }

    fn on_unlocked(&mut self) -> Vec<Action> {
        self.unlocked = true;
        if self.authenticated {
            self.after_unlock()
        } else {
            Vec::new()
        }
    }

    fn after_unlock(&mut self) -> Vec<Action> {
        if !matches!(self.phase, Phase::Idle) {
            return Vec::new();
        }

        if self.watermark.is_none() && self.config.initial_download {
            self.start(SyncTask::InitialCheck, None)
        } else {
            self.start(SyncTask::Poll, None)
        }
    }

    fn on_logged_out(&mut self) -> Vec<Action> {
        self.sign_out();
        self.last_error = None;
        vec![Action::CancelDebounce]
    }

    /// Back to `Clean` with no session. Unsynced edits are found again by
    /// comparing the document with the watermark at the next login.
    fn sign_out(&mut self) {
        self.authenticated = false;
        self.unlocked = false;
        self.phase = Phase::Idle;
        self.dirty = false;
        self.covered = self.covered.max(self.last_mutation);
        self.deferred = Deferred::default();
    }

    fn on_remote_checked(
        &mut self,
        task: TaskId,
        result: SyncResult<Option<RemoteMetadata>>,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        let Some(in_flight) = self.take_in_flight(task) else {
            return Vec::new();
        };

        let metadata = match result {
            Ok(metadata) => metadata,
            Err(err) => return self.fail(in_flight, err),
        };
        let newer = metadata
            .as_ref()
            .filter(|remote| self.detector.remote_is_newer(self.watermark.as_ref(), remote));

        match in_flight.task {
            SyncTask::PreUploadCheck => match newer {
                Some(remote) => self.enter_conflict(remote, now),
                None => self.start(SyncTask::Upload { merged: None }, None),
            },
            SyncTask::Poll => {
                let mut actions = match newer {
                    Some(remote) if self.dirty => self.enter_conflict(remote, now),
                    Some(remote) => vec![Action::Notify(SyncNotice::NewerRemoteAvailable {
                        remote_time: remote.updated_at,
                    })],
                    None => Vec::new(),
                };
                actions.extend(self.after_idle());
                actions
            }
            SyncTask::InitialCheck => match newer {
                Some(remote) if self.dirty => self.enter_conflict(remote, now),
                Some(_) => self.start(SyncTask::Download(DownloadMode::Replace), None),
                None => self.after_idle(),
            },
            SyncTask::PreDownloadCheck => match metadata.as_ref() {
                Some(remote) => self.enter_conflict(remote, now),
                None => {
                    let mut actions = vec![Action::Notify(SyncNotice::NoRemoteCopy)];
                    actions.extend(self.after_idle());
                    actions
                }
            },
            SyncTask::Upload { .. } | SyncTask::Download(_) => self.fail(
                in_flight,
                SyncError::Internal("metadata result for a transfer task".to_string()),
            ),
        }
    }

    fn on_uploaded(&mut self, task: TaskId, result: SyncResult<UploadReceipt>) -> Vec<Action> {
        let Some(in_flight) = self.take_in_flight(task) else {
            return Vec::new();
        };

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(err) => return self.fail(in_flight, err),
        };

        self.covered = self.covered.max(receipt.generation);
        self.dirty = self.last_mutation > self.covered;
        self.last_error = None;

        let watermark = Watermark::server(receipt.metadata.updated_at);
        self.watermark = Some(watermark);

        let at = receipt.metadata.updated_at;
        let notice = match in_flight.task {
            SyncTask::Upload { merged: Some(report) } => SyncNotice::Merged { at, report },
            _ => SyncNotice::Uploaded { at },
        };

        let mut actions = vec![Action::PersistWatermark(watermark), Action::Notify(notice)];
        actions.extend(self.after_idle());
        actions
    }

    fn on_downloaded(
        &mut self,
        task: TaskId,
        result: SyncResult<DownloadReceipt>,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        let Some(in_flight) = self.take_in_flight(task) else {
            return Vec::new();
        };

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(err) => return self.fail(in_flight, err),
        };

        let Some(generation) = receipt.generation else {
            // the edit may still be on its way as a LocalMutation event
            tracing::info!("Local edit arrived during download, asking before overwriting it");
            self.dirty = true;
            self.last_error = None;
            return self.enter_conflict(&receipt.metadata, now);
        };

        self.covered = self.covered.max(generation);
        self.last_error = None;

        let watermark = Watermark::server(receipt.metadata.updated_at);
        self.watermark = Some(watermark);

        let mut actions = vec![Action::PersistWatermark(watermark)];
        if receipt.legacy_plaintext {
            actions.push(Action::Notify(SyncNotice::LegacyPlaintext));
        }

        if in_flight.task == SyncTask::Download(DownloadMode::Merge) {
            // the merge result still has to reach the remote
            self.dirty = true;
            let report = receipt.merge.unwrap_or_default();
            actions.extend(self.start(SyncTask::Upload { merged: Some(report) }, None));
        } else {
            self.dirty = self.last_mutation > self.covered;
            actions.push(Action::Notify(SyncNotice::Downloaded {
                at: receipt.metadata.updated_at,
            }));
            actions.extend(self.after_idle());
        }

        actions
    }

    fn enter_conflict(&mut self, remote: &RemoteMetadata, now: DateTime<Utc>) -> Vec<Action> {
        let conflict = PendingConflict {
            local_time: self.watermark.map(|w| w.at),
            remote_time: remote.updated_at,
            remote_device: remote.device_id.clone(),
            detected_at: now,
        };

        tracing::warn!(
            remote_updated_at = %remote.updated_at,
            local_watermark = ?conflict.local_time,
            "Remote copy changed since last sync"
        );

        self.phase = Phase::Conflict(conflict.clone());
        self.deferred = Deferred::default();

        let mut actions = vec![Action::Notify(SyncNotice::ConflictDetected { conflict })];
        if let ConflictPolicy::Auto(strategy) = self.config.conflict_policy {
            actions.extend(self.resolve(strategy));
        }
        actions
    }

    fn fail(&mut self, in_flight: InFlight, err: SyncError) -> Vec<Action> {
        let message = err.to_string();
        tracing::warn!(task = ?in_flight.task, error = %message, "Sync task failed");

        self.deferred = Deferred::default();
        self.phase = match in_flight.resolving {
            Some(conflict) => Phase::Conflict(conflict),
            None => Phase::Idle,
        };

        let actions = match err {
            SyncError::AuthExpired(_) => {
                self.sign_out();
                vec![
                    Action::CancelDebounce,
                    Action::ForceLogout,
                    Action::Notify(SyncNotice::ReauthenticationRequired),
                ]
            }
            SyncError::Decryption(_) => {
                self.unlocked = false;
                vec![
                    Action::DiscardPassphrase,
                    Action::Notify(SyncNotice::PassphraseRejected),
                ]
            }
            SyncError::PassphraseRequired => {
                self.unlocked = false;
                vec![Action::Notify(SyncNotice::PassphraseRequired)]
            }
            SyncError::NotFound(_) => vec![Action::Notify(SyncNotice::NoRemoteCopy)],
            _ => vec![Action::Notify(SyncNotice::SyncFailed {
                message: message.clone(),
            })],
        };

        self.last_error = Some(message);
        actions
    }

    /// Runs deferred requests once back in `Idle`, or re-arms the debounce
    /// for edits made while the task was in flight.
    fn after_idle(&mut self) -> Vec<Action> {
        if !matches!(self.phase, Phase::Idle) {
            return Vec::new();
        }

        let deferred = std::mem::take(&mut self.deferred);
        if self.authenticated && self.unlocked {
            if deferred.download {
                return self.on_download_requested();
            }
            if deferred.upload && self.dirty {
                return self.start(SyncTask::PreUploadCheck, None);
            }
            if deferred.poll {
                return self.start(SyncTask::Poll, None);
            }
        }

        if self.dirty && self.config.auto_sync {
            vec![Action::ArmDebounce]
        } else {
            Vec::new()
        }
    }

    fn start(&mut self, task: SyncTask, resolving: Option<PendingConflict>) -> Vec<Action> {
        self.next_task += 1;
        let id = self.next_task;

        let action = match task {
            SyncTask::PreUploadCheck
            | SyncTask::Poll
            | SyncTask::InitialCheck
            | SyncTask::PreDownloadCheck => Action::CheckRemote { task: id },
            SyncTask::Upload { .. } => Action::Upload { task: id },
            SyncTask::Download(mode) => Action::Download { task: id, mode },
        };

        tracing::debug!(task_id = id, ?task, "Starting sync task");
        self.phase = Phase::Syncing(InFlight { id, task, resolving });
        vec![action]
    }

    fn take_in_flight(&mut self, task: TaskId) -> Option<InFlight> {
        if !matches!(&self.phase, Phase::Syncing(in_flight) if in_flight.id == task) {
            tracing::debug!(task_id = task, "Ignoring stale task completion");
            return None;
        }

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Syncing(in_flight) => Some(in_flight),
            other => {
                self.phase = other;
                None
            }
        }
    }

    fn blocked(&self) -> Option<SyncNotice> {
        if !self.authenticated {
            Some(SyncNotice::SyncFailed {
                message: SyncError::NotAuthenticated.to_string(),
            })
        } else if !self.unlocked {
            Some(SyncNotice::PassphraseRequired)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use chrono::{Duration, TimeZone};

    const THIS_DEVICE: &str = "device-2";
    const OTHER_DEVICE: &str = "device-1";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn config() -> MachineConfig {
        MachineConfig {
            auto_sync: true,
            conflict_policy: ConflictPolicy::Manual,
            initial_download: true,
        }
    }

    fn machine_with(config: MachineConfig, watermark: Option<Watermark>) -> SyncMachine {
        let detector = ConflictDetector::new(
            DeviceId::from_string(THIS_DEVICE),
            std::time::Duration::from_secs(2),
        );
        SyncMachine::new(config, detector, watermark)
    }

    fn remote(at: DateTime<Utc>, device: &str) -> RemoteMetadata {
        RemoteMetadata {
            updated_at: at,
            device_id: Some(DeviceId::from_string(device)),
        }
    }

    fn task_of(actions: &[Action]) -> TaskId {
        actions
            .iter()
            .find_map(|action| match action {
                Action::CheckRemote { task }
                | Action::Upload { task }
                | Action::Download { task, .. } => Some(*task),
                _ => None,
            })
            .expect("no network action")
    }

    fn notices(actions: &[Action]) -> Vec<&SyncNotice> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Notify(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }

    /// Logged in, unlocked, first poll answered with "no newer copy".
    fn ready(config: MachineConfig, watermark: Option<Watermark>) -> SyncMachine {
        let mut machine = machine_with(config, watermark);
        assert!(notices(&machine.handle(Event::LoggedIn, t0()))
            .contains(&&SyncNotice::PassphraseRequired));
        let actions = machine.handle(Event::Unlocked, t0());
        let task = task_of(&actions);
        machine.handle(Event::RemoteChecked { task, result: Ok(None) }, t0());
        assert_eq!(machine.state(), SyncState::Clean);
        machine
    }

    fn dirty_and_checking(machine: &mut SyncMachine, generation: u64) -> TaskId {
        assert_eq!(
            machine.handle(Event::LocalMutation { generation }, t0()),
            vec![Action::ArmDebounce]
        );
        let actions = machine.handle(Event::DebounceElapsed, t0());
        assert_eq!(machine.state(), SyncState::Syncing);
        task_of(&actions)
    }

    fn upload_ok(generation: u64, at: DateTime<Utc>) -> SyncResult<UploadReceipt> {
        Ok(UploadReceipt {
            generation,
            metadata: remote(at, THIS_DEVICE),
        })
    }

    #[test]
    fn test_debounced_upload_cycle() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);

        let actions = machine.handle(Event::RemoteChecked { task: check, result: Ok(None) }, t0());
        let upload = task_of(&actions);
        assert_eq!(actions, vec![Action::Upload { task: upload }]);

        let at = t0() + Duration::seconds(10);
        let actions = machine.handle(Event::Uploaded { task: upload, result: upload_ok(1, at) }, t0());
        assert_eq!(
            actions,
            vec![
                Action::PersistWatermark(Watermark::server(at)),
                Action::Notify(SyncNotice::Uploaded { at }),
            ]
        );
        assert_eq!(machine.state(), SyncState::Clean);
        assert_eq!(machine.status().last_synced_at, Some(at));
    }

    #[test]
    fn test_one_ms_newer_remote_from_other_device_is_a_conflict() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);

        let newer = remote(t0() + Duration::milliseconds(1), OTHER_DEVICE);
        let actions = machine.handle(Event::RemoteChecked { task: check, result: Ok(Some(newer)) }, t0());

        assert!(matches!(
            notices(&actions).as_slice(),
            [SyncNotice::ConflictDetected { .. }]
        ));
        assert_eq!(machine.state(), SyncState::ConflictPending);
        assert!(machine.status().dirty);
    }

    #[test]
    fn test_one_ms_newer_remote_from_same_device_uploads() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);

        let own = remote(t0() + Duration::milliseconds(1), THIS_DEVICE);
        let actions = machine.handle(Event::RemoteChecked { task: check, result: Ok(Some(own)) }, t0());

        assert!(matches!(actions.as_slice(), [Action::Upload { .. }]));
    }

    #[test]
    fn test_failed_upload_keeps_dirty_without_retry_loop() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);
        let upload = task_of(&machine.handle(Event::RemoteChecked { task: check, result: Ok(None) }, t0()));

        let actions = machine.handle(
            Event::Uploaded {
                task: upload,
                result: Err(SyncError::Network("connection reset".into())),
            },
            t0(),
        );

        assert!(matches!(
            actions.as_slice(),
            [Action::Notify(SyncNotice::SyncFailed { .. })]
        ));
        assert_eq!(machine.state(), SyncState::Dirty);
        assert!(machine.status().last_error.is_some());
        assert_eq!(machine.status().last_synced_at, Some(t0()));
    }

    #[test]
    fn test_auth_expiry_forces_logout() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);

        let actions = machine.handle(
            Event::RemoteChecked {
                task: check,
                result: Err(SyncError::AuthExpired("401".into())),
            },
            t0(),
        );

        assert!(actions.contains(&Action::ForceLogout));
        assert!(actions.contains(&Action::Notify(SyncNotice::ReauthenticationRequired)));
        let status = machine.status();
        assert!(!status.authenticated);
        assert!(!status.unlocked);
        assert_eq!(status.state, SyncState::Clean);
        assert!(!status.dirty);
        assert!(status.last_error.is_some());
    }

    #[test]
    fn test_requests_during_sync_are_deferred_not_parallel() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);

        assert_eq!(
            machine.handle(Event::SyncRequested, t0()),
            vec![Action::Notify(SyncNotice::Deferred)]
        );
        assert!(machine.handle(Event::PollRequested, t0()).is_empty());
        assert!(machine.handle(Event::DebounceElapsed, t0()).is_empty());

        // an edit lands while the check is in flight
        assert!(machine.handle(Event::LocalMutation { generation: 2 }, t0()).is_empty());

        let upload = task_of(&machine.handle(Event::RemoteChecked { task: check, result: Ok(None) }, t0()));
        let actions = machine.handle(Event::Uploaded { task: upload, result: upload_ok(1, t0()) }, t0());

        // generation 2 was not in the snapshot: still dirty, deferred upload runs
        assert!(actions.iter().any(|a| matches!(a, Action::CheckRemote { .. })));
        assert_eq!(machine.state(), SyncState::Syncing);
        assert!(machine.status().dirty);
    }

    #[test]
    fn test_edit_during_upload_rearms_debounce() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);
        let upload = task_of(&machine.handle(Event::RemoteChecked { task: check, result: Ok(None) }, t0()));

        machine.handle(Event::LocalMutation { generation: 2 }, t0());
        let actions = machine.handle(Event::Uploaded { task: upload, result: upload_ok(1, t0()) }, t0());

        assert_eq!(actions.last(), Some(&Action::ArmDebounce));
        assert_eq!(machine.state(), SyncState::Dirty);
    }

    #[test]
    fn test_mutation_already_in_snapshot_is_ignored() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);
        let upload = task_of(&machine.handle(Event::RemoteChecked { task: check, result: Ok(None) }, t0()));

        // snapshot was taken at generation 3, events for 2 and 3 arrive late
        machine.handle(Event::Uploaded { task: upload, result: upload_ok(3, t0()) }, t0());
        assert!(machine.handle(Event::LocalMutation { generation: 2 }, t0()).is_empty());
        assert!(machine.handle(Event::LocalMutation { generation: 3 }, t0()).is_empty());
        assert_eq!(machine.state(), SyncState::Clean);
    }

    fn in_conflict(config: MachineConfig) -> SyncMachine {
        let mut machine = ready(config, Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);
        machine.handle(
            Event::RemoteChecked {
                task: check,
                result: Ok(Some(remote(t0() + Duration::seconds(30), OTHER_DEVICE))),
            },
            t0(),
        );
        assert_eq!(machine.state(), SyncState::ConflictPending);
        machine
    }

    #[test]
    fn test_debounce_suppressed_while_conflict_pending() {
        let mut machine = in_conflict(config());

        assert!(machine.handle(Event::LocalMutation { generation: 2 }, t0()).is_empty());
        assert!(machine.handle(Event::DebounceElapsed, t0()).is_empty());
        assert!(machine.handle(Event::PollRequested, t0()).is_empty());
        assert!(matches!(
            notices(&machine.handle(Event::SyncRequested, t0())).as_slice(),
            [SyncNotice::ConflictDetected { .. }]
        ));
        assert_eq!(machine.state(), SyncState::ConflictPending);
    }

    #[test]
    fn test_force_upload_resolution() {
        let mut machine = in_conflict(config());

        let actions = machine.handle(Event::Resolve(ConflictResolutionStrategy::ForceUpload), t0());
        let upload = task_of(&actions);
        assert_eq!(actions, vec![Action::Upload { task: upload }]);

        let at = t0() + Duration::minutes(1);
        machine.handle(Event::Uploaded { task: upload, result: upload_ok(1, at) }, t0());
        assert_eq!(machine.state(), SyncState::Clean);
        assert!(machine.status().conflict.is_none());
    }

    #[test]
    fn test_merge_resolution_downloads_then_uploads() {
        let mut machine = in_conflict(config());

        let actions = machine.handle(Event::Resolve(ConflictResolutionStrategy::Merge), t0());
        assert!(matches!(
            actions.as_slice(),
            [Action::Download { mode: DownloadMode::Merge, .. }]
        ));

        let remote_at = t0() + Duration::seconds(30);
        let report = MergeReport {
            local_wins: true,
            added_from_remote: 2,
            conflicting_entries: 0,
        };
        let actions = machine.handle(
            Event::Downloaded {
                task: task_of(&actions),
                result: Ok(DownloadReceipt {
                    generation: Some(2),
                    metadata: remote(remote_at, OTHER_DEVICE),
                    merge: Some(report),
                    legacy_plaintext: false,
                }),
            },
            t0(),
        );
        assert_eq!(actions[0], Action::PersistWatermark(Watermark::server(remote_at)));
        assert!(matches!(actions[1], Action::Upload { .. }));
        assert!(machine.status().dirty);

        let at = t0() + Duration::minutes(1);
        let actions = machine.handle(Event::Uploaded { task: task_of(&actions), result: upload_ok(2, at) }, t0());
        assert!(actions.contains(&Action::Notify(SyncNotice::Merged { at, report })));
        assert_eq!(machine.state(), SyncState::Clean);
    }

    #[test]
    fn test_wrong_passphrase_during_resolution_keeps_conflict() {
        let mut machine = in_conflict(config());

        let actions = machine.handle(Event::Resolve(ConflictResolutionStrategy::OverwriteLocal), t0());
        let actions = machine.handle(
            Event::Downloaded {
                task: task_of(&actions),
                result: Err(SyncError::Decryption("tag mismatch".into())),
            },
            t0(),
        );

        assert_eq!(
            actions,
            vec![
                Action::DiscardPassphrase,
                Action::Notify(SyncNotice::PassphraseRejected)
            ]
        );
        assert_eq!(machine.state(), SyncState::ConflictPending);
        assert!(!machine.status().unlocked);

        // resolution is blocked until the passphrase is re-entered
        assert_eq!(
            machine.handle(Event::Resolve(ConflictResolutionStrategy::OverwriteLocal), t0()),
            vec![Action::Notify(SyncNotice::PassphraseRequired)]
        );
    }

    #[test]
    fn test_auto_policy_resolves_immediately() {
        let policy = MachineConfig {
            conflict_policy: ConflictPolicy::Auto(ConflictResolutionStrategy::Merge),
            ..config()
        };
        let mut machine = ready(policy, Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);

        let actions = machine.handle(
            Event::RemoteChecked {
                task: check,
                result: Ok(Some(remote(t0() + Duration::seconds(30), OTHER_DEVICE))),
            },
            t0(),
        );

        assert!(matches!(
            actions.as_slice(),
            [
                Action::Notify(SyncNotice::ConflictDetected { .. }),
                Action::Download { mode: DownloadMode::Merge, .. }
            ]
        ));
    }

    #[test]
    fn test_poll_while_clean_only_notifies() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));

        let actions = machine.handle(Event::PollRequested, t0());
        let newer = t0() + Duration::seconds(30);
        let actions = machine.handle(
            Event::RemoteChecked {
                task: task_of(&actions),
                result: Ok(Some(remote(newer, OTHER_DEVICE))),
            },
            t0(),
        );

        assert_eq!(
            actions,
            vec![Action::Notify(SyncNotice::NewerRemoteAvailable { remote_time: newer })]
        );
        assert_eq!(machine.state(), SyncState::Clean);
    }

    #[test]
    fn test_poll_while_dirty_enters_conflict() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        machine.handle(Event::LocalMutation { generation: 1 }, t0());

        let actions = machine.handle(Event::PollRequested, t0());
        machine.handle(
            Event::RemoteChecked {
                task: task_of(&actions),
                result: Ok(Some(remote(t0() + Duration::seconds(30), OTHER_DEVICE))),
            },
            t0(),
        );
        assert_eq!(machine.state(), SyncState::ConflictPending);
    }

    #[test]
    fn test_initial_download_on_first_unlock() {
        let mut machine = machine_with(config(), None);
        machine.handle(Event::LoggedIn, t0());

        let actions = machine.handle(Event::Unlocked, t0());
        let actions = machine.handle(
            Event::RemoteChecked {
                task: task_of(&actions),
                result: Ok(Some(remote(t0(), OTHER_DEVICE))),
            },
            t0(),
        );
        assert!(matches!(
            actions.as_slice(),
            [Action::Download { mode: DownloadMode::Replace, .. }]
        ));

        let actions = machine.handle(
            Event::Downloaded {
                task: task_of(&actions),
                result: Ok(DownloadReceipt {
                    generation: Some(1),
                    metadata: remote(t0(), OTHER_DEVICE),
                    merge: None,
                    legacy_plaintext: true,
                }),
            },
            t0(),
        );
        assert!(actions.contains(&Action::Notify(SyncNotice::LegacyPlaintext)));
        assert!(actions.contains(&Action::Notify(SyncNotice::Downloaded { at: t0() })));
        assert_eq!(machine.state(), SyncState::Clean);
    }

    #[test]
    fn test_locked_session_prompts_instead_of_skipping() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        machine.handle(Event::Locked, t0());
        machine.handle(Event::LocalMutation { generation: 1 }, t0());

        assert_eq!(
            machine.handle(Event::DebounceElapsed, t0()),
            vec![Action::Notify(SyncNotice::PassphraseRequired)]
        );
        assert_eq!(machine.state(), SyncState::Dirty);
    }

    #[test]
    fn test_auto_sync_off_never_arms_debounce() {
        let manual = MachineConfig {
            auto_sync: false,
            ..config()
        };
        let mut machine = ready(manual, Some(Watermark::server(t0())));

        assert!(machine.handle(Event::LocalMutation { generation: 1 }, t0()).is_empty());
        assert!(matches!(
            machine.handle(Event::SyncRequested, t0()).as_slice(),
            [Action::CheckRemote { .. }]
        ));
    }

    #[test]
    fn test_manual_download_over_dirty_local_asks_first() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        machine.handle(Event::LocalMutation { generation: 1 }, t0());

        let actions = machine.handle(Event::DownloadRequested, t0());
        assert!(matches!(actions.as_slice(), [Action::CheckRemote { .. }]));

        machine.handle(
            Event::RemoteChecked {
                task: task_of(&actions),
                result: Ok(Some(remote(t0(), THIS_DEVICE))),
            },
            t0(),
        );
        assert_eq!(machine.state(), SyncState::ConflictPending);
    }

    #[test]
    fn test_stale_completion_after_logout_is_ignored() {
        let mut machine = ready(config(), Some(Watermark::server(t0())));
        let check = dirty_and_checking(&mut machine, 1);

        assert_eq!(machine.handle(Event::LoggedOut, t0()), vec![Action::CancelDebounce]);
        assert_eq!(machine.state(), SyncState::Clean);

        let actions = machine.handle(
            Event::RemoteChecked {
                task: check,
                result: Ok(Some(remote(t0() + Duration::seconds(30), OTHER_DEVICE))),
            },
            t0(),
        );
        assert!(actions.is_empty());
        assert_eq!(machine.state(), SyncState::Clean);
    }

    #[test]
    fn test_skipped_replace_enters_conflict_without_moving_watermark() {
        let mut machine = machine_with(config(), None);
        machine.handle(Event::LoggedIn, t0());
        let actions = machine.handle(Event::Unlocked, t0());
        let actions = machine.handle(
            Event::RemoteChecked {
                task: task_of(&actions),
                result: Ok(Some(remote(t0(), OTHER_DEVICE))),
            },
            t0(),
        );

        let actions = machine.handle(
            Event::Downloaded {
                task: task_of(&actions),
                result: Ok(DownloadReceipt {
                    generation: None,
                    metadata: remote(t0(), OTHER_DEVICE),
                    merge: None,
                    legacy_plaintext: false,
                }),
            },
            t0(),
        );

        assert!(matches!(
            actions.as_slice(),
            [Action::Notify(SyncNotice::ConflictDetected { .. })]
        ));
        assert_eq!(machine.state(), SyncState::ConflictPending);
        assert!(machine.status().dirty);
        assert!(machine.watermark().is_none());

        // the edit's own event arrives afterwards and keeps the conflict
        assert!(machine.handle(Event::LocalMutation { generation: 1 }, t0()).is_empty());
        assert_eq!(machine.state(), SyncState::ConflictPending);
    }

    #[test]
    fn test_migration_error_is_reported_in_status() {
        let mut machine = machine_with(config(), None);
        assert!(machine.status().migration_error.is_none());

        machine.set_migration_error("cj_todos: expected value");
        assert_eq!(
            machine.status().migration_error.as_deref(),
            Some("cj_todos: expected value")
        );
        machine.handle(Event::LoggedOut, t0());
        assert!(machine.status().migration_error.is_some());
    }

    #[test]
    fn test_local_ahead_marks_dirty() {
        let mut machine = machine_with(config(), Some(Watermark::server(t0())));
        assert_eq!(machine.handle(Event::LocalAhead, t0()), vec![Action::ArmDebounce]);
        assert_eq!(machine.state(), SyncState::Dirty);
    }
}
