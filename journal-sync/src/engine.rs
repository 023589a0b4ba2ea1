//! Sync engine
//!
//! Runs [`SyncMachine`] on a background task. The worker owns the session,
//! the debounce timer and the poll interval; network work is spawned as a
//! separate task per [`SyncTask`](crate::machine::SyncTask) and reports
//! back through a completion channel. The machine never has more than one
//! task in flight.
//!
//! Callers talk to the worker through a cloneable [`SyncHandle`].

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::codec::DocumentCodec;
use crate::config::SyncConfig;
use crate::conflict::{ConflictDetector, ConflictResolutionStrategy};
use crate::device::DeviceId;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::local_store::LocalDocumentStore;
use crate::machine::{
    Action, DownloadMode, DownloadReceipt, Event, MachineConfig, SyncMachine, UploadReceipt,
};
use crate::merge::merge_documents;
use crate::migration::run_migration;
use crate::remote::{RemoteBlobClient, RemoteMetadata};
use crate::session::{OwnerId, Passphrase, Session};
use crate::status::{SyncNotice, SyncStatus};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Login(OwnerId),
    Logout,
    Unlock(Passphrase),
    Lock,
    LocalChanged { generation: u64 },
    SyncNow,
    Poll,
    Download,
    Resolve(ConflictResolutionStrategy),
    Shutdown,
}

/// Cloneable front end of a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
    notices: broadcast::Sender<SyncNotice>,
    store: Arc<LocalDocumentStore>,
}

impl SyncHandle {
    pub fn login(&self, owner: OwnerId) -> SyncResult<()> {
        self.send(Command::Login(owner))
    }

    pub fn logout(&self) -> SyncResult<()> {
        self.send(Command::Logout)
    }

    pub fn unlock(&self, passphrase: Passphrase) -> SyncResult<()> {
        self.send(Command::Unlock(passphrase))
    }

    /// Forget the passphrase. Sync stays blocked until the next unlock.
    pub fn lock(&self) -> SyncResult<()> {
        self.send(Command::Lock)
    }

    /// Apply `f` to the local document and schedule a sync.
    ///
    /// The local write is committed before this returns, whether or not the
    /// engine is still running.
    pub async fn apply_local_change<F, R>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut Document) -> R,
    {
        let (generation, result) = self.store.update(f).await?;
        self.notify_local_change(generation);
        Ok(result)
    }

    /// Remove a class. Returns `false` when it did not exist.
    pub async fn delete_class(&self, class_id: &str) -> SyncResult<bool> {
        match self.store.delete_class(class_id).await? {
            Some(generation) => {
                self.notify_local_change(generation);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Report a write made directly on the [`LocalDocumentStore`].
    pub fn notify_local_change(&self, generation: u64) {
        if self.send(Command::LocalChanged { generation }).is_err() {
            tracing::warn!(generation, "Local change saved but sync engine is stopped");
        }
    }

    /// Upload now, checking the remote first.
    pub fn sync_now(&self) -> SyncResult<()> {
        self.send(Command::SyncNow)
    }

    /// The window regained focus: check the remote version.
    pub fn notify_focus(&self) -> SyncResult<()> {
        self.send(Command::Poll)
    }

    /// Replace local data with the remote copy. Asks for a resolution
    /// first when local changes are unsynced.
    pub fn download(&self) -> SyncResult<()> {
        self.send(Command::Download)
    }

    pub fn resolve(&self, strategy: ConflictResolutionStrategy) -> SyncResult<()> {
        self.send(Command::Resolve(strategy))
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub fn document_store(&self) -> &Arc<LocalDocumentStore> {
        &self.store
    }

    pub async fn document(&self) -> SyncResult<Document> {
        self.store.load().await
    }

    /// Stop the worker. In-flight network work is abandoned.
    pub fn shutdown(&self) -> SyncResult<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::EngineStopped)
    }
}

pub struct SyncEngine;

impl SyncEngine {
    /// Migrate legacy data, load persisted state and start the worker on the
    /// current runtime.
    pub async fn spawn(
        store: Arc<LocalDocumentStore>,
        remote: Arc<dyn RemoteBlobClient>,
        config: SyncConfig,
    ) -> SyncResult<(SyncHandle, JoinHandle<()>)> {
        config.validate()?;

        let migration = run_migration(store.storage().as_ref()).await;

        let device_id = store.device_id().await?;
        let watermark = store.load_watermark().await?;
        let detector = ConflictDetector::new(device_id.clone(), config.clock_skew_tolerance);
        let mut machine = SyncMachine::new(MachineConfig::from(&config), detector, watermark);

        if let Err(e) = migration {
            // legacy keys are left as they were and retried on the next start
            tracing::warn!(error = %e, "Legacy data migration failed");
            machine.set_migration_error(e.to_string());
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        let mut worker = Worker {
            store: Arc::clone(&store),
            remote,
            codec: DocumentCodec::new(config.kdf_iterations),
            device_id,
            session: Session::new(),
            machine,
            debounce: config.debounce,
            debounce_deadline: None,
            in_flight: None,
            completions: completion_tx,
            status: status_tx,
            notices: notice_tx.clone(),
        };

        if worker.local_is_ahead().await? {
            worker.dispatch(Event::LocalAhead).await;
        }

        tracing::info!(
            device_id = %worker.device_id,
            watermark = ?worker.machine.watermark(),
            state = %worker.machine.state(),
            "Sync engine started"
        );

        let join = tokio::spawn(worker.run(command_rx, completion_rx, config.poll_interval));

        let handle = SyncHandle {
            commands: command_tx,
            status: status_rx,
            notices: notice_tx,
            store,
        };

        Ok((handle, join))
    }
}

struct Worker {
    store: Arc<LocalDocumentStore>,
    remote: Arc<dyn RemoteBlobClient>,
    codec: DocumentCodec,
    device_id: DeviceId,
    session: Session,
    machine: SyncMachine,
    debounce: Duration,
    debounce_deadline: Option<Instant>,
    /// Network task currently running, aborted when the session ends.
    in_flight: Option<AbortHandle>,
    completions: mpsc::UnboundedSender<Event>,
    status: watch::Sender<SyncStatus>,
    notices: broadcast::Sender<SyncNotice>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Event>,
        poll_interval: Duration,
    ) {
        let mut poll = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.debounce_deadline;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = completions.recv() => self.dispatch(event).await,
                () = sleep_until(deadline) => {
                    self.debounce_deadline = None;
                    self.dispatch(Event::DebounceElapsed).await;
                }
                _ = poll.tick() => self.dispatch(Event::PollRequested).await,
            }
        }

        self.abort_in_flight();
        tracing::info!("Sync engine stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Login(owner) => {
                if self.session.owner().is_some_and(|current| current != &owner) {
                    self.abort_in_flight();
                    self.session.logout();
                    self.dispatch(Event::LoggedOut).await;
                }

                tracing::info!(owner = %owner, "Signed in");
                self.session.login(owner);

                match self.local_is_ahead().await {
                    Ok(true) => self.dispatch(Event::LocalAhead).await,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "Could not compare local document with watermark"),
                }
                self.dispatch(Event::LoggedIn).await;
            }
            Command::Logout => {
                self.abort_in_flight();
                self.session.logout();
                self.dispatch(Event::LoggedOut).await;
            }
            Command::Unlock(passphrase) => {
                self.session.unlock(passphrase);
                self.dispatch(Event::Unlocked).await;
            }
            Command::Lock => {
                self.session.lock();
                self.dispatch(Event::Locked).await;
            }
            Command::LocalChanged { generation } => {
                self.dispatch(Event::LocalMutation { generation }).await;
            }
            Command::SyncNow => self.dispatch(Event::SyncRequested).await,
            Command::Poll => self.dispatch(Event::PollRequested).await,
            Command::Download => self.dispatch(Event::DownloadRequested).await,
            Command::Resolve(strategy) => self.dispatch(Event::Resolve(strategy)).await,
            Command::Shutdown => {}
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            for action in self.machine.handle(event, Utc::now()) {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push_back(follow_up);
                }
            }
        }

        self.status.send_replace(self.machine.status());
    }

    /// Perform one action. Returns an event to feed back immediately when
    /// the action could not even be started.
    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::ArmDebounce => {
                self.debounce_deadline = Some(Instant::now() + self.debounce);
            }
            Action::CancelDebounce => {
                self.debounce_deadline = None;
            }
            Action::CheckRemote { task } => {
                let transfer = match self.transfer() {
                    Ok(transfer) => transfer,
                    Err(e) => return Some(Event::RemoteChecked { task, result: Err(e) }),
                };
                self.spawn_task(async move {
                    Event::RemoteChecked {
                        task,
                        result: transfer.check().await,
                    }
                });
            }
            Action::Upload { task } => {
                let transfer = match self.transfer() {
                    Ok(transfer) => transfer,
                    Err(e) => return Some(Event::Uploaded { task, result: Err(e) }),
                };
                self.spawn_task(async move {
                    Event::Uploaded {
                        task,
                        result: transfer.upload().await,
                    }
                });
            }
            Action::Download { task, mode } => {
                let transfer = match self.transfer() {
                    Ok(transfer) => transfer,
                    Err(e) => return Some(Event::Downloaded { task, result: Err(e) }),
                };
                let last_synced_at = self.machine.watermark().map(|w| w.at);
                let expected = self.store.generation();
                self.spawn_task(async move {
                    Event::Downloaded {
                        task,
                        result: transfer.download(mode, last_synced_at, expected).await,
                    }
                });
            }
            Action::PersistWatermark(watermark) => {
                if let Err(e) = self.store.save_watermark(&watermark).await {
                    tracing::error!(error = %e, "Failed to persist sync watermark");
                }
            }
            Action::DiscardPassphrase => {
                tracing::warn!("Passphrase rejected, discarding it");
                self.session.lock();
            }
            Action::ForceLogout => {
                tracing::warn!("Remote rejected credentials, signing out");
                self.session.logout();
            }
            Action::Notify(notice) => {
                tracing::debug!(?notice, "Sync notice");
                // no subscribers is fine
                let _ = self.notices.send(notice);
            }
        }

        None
    }

    fn spawn_task<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = Event> + Send + 'static,
    {
        let completions = self.completions.clone();
        let handle = tokio::spawn(async move {
            let event = task.await;
            // receiver is gone once the worker stopped
            let _ = completions.send(event);
        });
        self.in_flight = Some(handle.abort_handle());
    }

    fn abort_in_flight(&mut self) {
        if let Some(task) = self.in_flight.take() {
            if !task.is_finished() {
                tracing::debug!("Abandoning in-flight sync task");
                task.abort();
            }
        }
    }

    fn transfer(&self) -> SyncResult<Transfer> {
        let (owner, passphrase) = self.session.credentials()?;
        Ok(Transfer {
            store: Arc::clone(&self.store),
            remote: Arc::clone(&self.remote),
            codec: self.codec,
            device_id: self.device_id.clone(),
            owner: owner.clone(),
            passphrase: passphrase.clone(),
        })
    }

    /// Whether the persisted document carries edits newer than the last
    /// sync.
    async fn local_is_ahead(&self) -> SyncResult<bool> {
        let document = self.store.load().await?;
        Ok(match (document.updated_at, self.machine.watermark()) {
            (Some(updated_at), Some(watermark)) => updated_at > watermark.at,
            (_, None) => !document.is_empty(),
            (None, Some(_)) => false,
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Everything one network task needs, detached from the worker.
struct Transfer {
    store: Arc<LocalDocumentStore>,
    remote: Arc<dyn RemoteBlobClient>,
    codec: DocumentCodec,
    device_id: DeviceId,
    owner: OwnerId,
    passphrase: Passphrase,
}

impl Transfer {
    async fn check(&self) -> SyncResult<Option<RemoteMetadata>> {
        Ok(self.remote.get_metadata(&self.owner).await?)
    }

    async fn upload(&self) -> SyncResult<UploadReceipt> {
        let (document, generation) = self.store.snapshot().await?;

        let codec = self.codec;
        let passphrase = self.passphrase.clone();
        let device_id = self.device_id.clone();
        let blob = tokio::task::spawn_blocking(move || {
            codec.seal(&document, &passphrase, &device_id, Utc::now())
        })
        .await
        .map_err(|e| SyncError::Internal(format!("encryption task: {e}")))??;

        let metadata = self.remote.upsert(&self.owner, &blob).await?;
        tracing::info!(generation, updated_at = %metadata.updated_at, "Uploaded journal");

        Ok(UploadReceipt { generation, metadata })
    }

    /// Fetch and decrypt the remote copy, then write it locally. A replace
    /// only happens if the store is still at generation `expected`.
    async fn download(
        &self,
        mode: DownloadMode,
        last_synced_at: Option<DateTime<Utc>>,
        expected: u64,
    ) -> SyncResult<DownloadReceipt> {
        let blob = self.remote.fetch(&self.owner).await?;
        let metadata = blob.metadata();

        let codec = self.codec;
        let passphrase = self.passphrase.clone();
        let opened = tokio::task::spawn_blocking(move || codec.open(&blob, &passphrase))
            .await
            .map_err(|e| SyncError::Internal(format!("decryption task: {e}")))??;

        let (generation, merge) = match mode {
            DownloadMode::Replace => (
                self.store.replace_if_unchanged(opened.document, expected).await?,
                None,
            ),
            DownloadMode::Merge => {
                let remote_document = opened.document;
                let remote_updated_at = metadata.updated_at;
                let (generation, report) = self
                    .store
                    .rewrite(|local| {
                        let outcome =
                            merge_documents(&local, &remote_document, last_synced_at, remote_updated_at);
                        (outcome.document, outcome.report)
                    })
                    .await?;
                (Some(generation), Some(report))
            }
        };

        tracing::info!(
            ?generation,
            ?mode,
            updated_at = %metadata.updated_at,
            legacy_plaintext = opened.legacy_plaintext,
            "Downloaded journal"
        );

        Ok(DownloadReceipt {
            generation,
            metadata,
            merge,
            legacy_plaintext: opened.legacy_plaintext,
        })
    }
}
