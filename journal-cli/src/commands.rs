//! Subcommand implementations

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use journal_sync::{
    run_migration, ConflictPolicy, ConflictResolutionStrategy, DeviceId, DocumentSummary,
    DriveBlobClient, DriveConfig, HttpBlobClient, KeyValueStore, LocalDocumentStore,
    MemoryBlobClient, MigrationOutcome, OwnerId, Passphrase, RemoteBlobClient, RemoteConfig,
    SqliteStorage, SyncConfig, SyncEngine, SyncHandle, SyncNotice, SyncState, SyncStatus, Watermark,
};

use super::{Cli, RemoteKind};

const READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Push { force: bool },
    Pull { force: bool },
    Merge,
}

impl Operation {
    /// How to settle a conflict met while running this operation.
    fn conflict_strategy(self) -> Option<ConflictResolutionStrategy> {
        match self {
            Self::Push { force: true } => Some(ConflictResolutionStrategy::ForceUpload),
            Self::Pull { force: true } => Some(ConflictResolutionStrategy::OverwriteLocal),
            Self::Merge => Some(ConflictResolutionStrategy::Merge),
            Self::Push { force: false } | Self::Pull { force: false } => None,
        }
    }

    fn start(self, handle: &SyncHandle) -> journal_sync::SyncResult<()> {
        match self {
            Self::Push { .. } | Self::Merge => handle.sync_now(),
            Self::Pull { .. } => handle.download(),
        }
    }

    fn hint(self) -> &'static str {
        match self {
            Self::Push { .. } => "rerun with `push --force` to overwrite it, or use `merge`",
            Self::Pull { .. } => "rerun with `pull --force` to discard local changes, or use `merge`",
            Self::Merge => "",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalStatus {
    device_id: DeviceId,
    watermark: Option<Watermark>,
    summary: DocumentSummary,
    schema_version: u32,
}

pub async fn show_status(storage: Arc<SqliteStorage>, json: bool) -> Result<()> {
    let store = LocalDocumentStore::new(storage);
    let document = store.load().await?;
    let status = LocalStatus {
        device_id: store.device_id().await?,
        watermark: store.load_watermark().await?,
        summary: document.summary(),
        schema_version: document.schema_version,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("device:        {}", status.device_id);
    match status.watermark {
        Some(watermark) => println!("last synced:   {} ({:?})", watermark.at, watermark.source),
        None => println!("last synced:   never"),
    }
    match document.updated_at {
        Some(at) => println!("last edited:   {at}"),
        None => println!("last edited:   never"),
    }
    println!(
        "contents:      {} classes, {} students, {} daily records, {} todos",
        status.summary.classes, status.summary.students, status.summary.records, status.summary.todos
    );
    Ok(())
}

pub async fn migrate(storage: &dyn KeyValueStore) -> Result<()> {
    match run_migration(storage).await? {
        MigrationOutcome::AlreadyCurrent => println!("already on the current layout"),
        MigrationOutcome::NothingToMigrate => println!("no legacy data found"),
        MigrationOutcome::Migrated {
            students,
            records,
            todos,
        } => println!("migrated {students} students, {records} daily records, {todos} todos"),
    }
    Ok(())
}

/// Run one push, pull or merge to completion.
pub async fn run_operation(cli: &Cli, storage: Arc<SqliteStorage>, operation: Operation) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let policy = config.conflict_policy;
    let (handle, join) = start_engine(cli, storage, config).await?;
    let mut notices = handle.notices();

    let result = drive(cli, &handle, &mut notices, operation, policy).await;

    handle.shutdown().ok();
    join.await.ok();
    result
}

async fn drive(
    cli: &Cli,
    handle: &SyncHandle,
    notices: &mut broadcast::Receiver<SyncNotice>,
    operation: Operation,
    policy: ConflictPolicy,
) -> Result<()> {
    sign_in(cli, handle)?;
    let status = wait_until_ready(handle).await?;
    warn_unmigrated(&status);

    // outcome of the check that runs on unlock
    loop {
        match notices.try_recv() {
            Ok(notice) => report(&notice),
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    if !status.authenticated || !status.unlocked {
        bail!(
            "could not start sync: {}",
            status.last_error.as_deref().unwrap_or("signed out")
        );
    }

    if status.state == SyncState::ConflictPending {
        resolve_or_bail(handle, operation, policy)?;
    } else {
        operation.start(handle)?;
    }

    loop {
        let notice = next_outcome(notices).await?;
        match notice {
            SyncNotice::Uploaded { .. } | SyncNotice::Downloaded { .. } | SyncNotice::Merged { .. } => {
                return Ok(())
            }
            SyncNotice::ConflictDetected { .. } => resolve_or_bail(handle, operation, policy)?,
            SyncNotice::NoRemoteCopy if !matches!(operation, Operation::Pull { .. }) => return Ok(()),
            other => bail!("{}", describe(&other)),
        }
    }
}

/// Run the engine in the foreground, reporting notices until Ctrl-C.
pub async fn watch(cli: &Cli, storage: Arc<SqliteStorage>) -> Result<()> {
    let config = SyncConfig::from_env()?;
    tracing::info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        "Watching for remote changes"
    );

    let (handle, join) = start_engine(cli, storage, config).await?;
    let mut notices = handle.notices();
    warn_unmigrated(&handle.status());
    sign_in(cli, &handle)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Ok(notice) => report(&notice),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed sync notices"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().ok();
    join.await.ok();
    Ok(())
}

async fn start_engine(
    cli: &Cli,
    storage: Arc<SqliteStorage>,
    config: SyncConfig,
) -> Result<(SyncHandle, tokio::task::JoinHandle<()>)> {
    let remote: Arc<dyn RemoteBlobClient> = match cli.remote {
        RemoteKind::Http => {
            let client = HttpBlobClient::new(RemoteConfig::from_env()?)?;
            client.set_access_token(cli.access_token.clone());
            Arc::new(client)
        }
        RemoteKind::Drive => {
            let client = DriveBlobClient::new(DriveConfig::from_env()?)?;
            client.set_access_token(cli.access_token.clone());
            Arc::new(client)
        }
        RemoteKind::Memory => {
            tracing::warn!("Using an in-memory remote; nothing is kept after exit");
            Arc::new(MemoryBlobClient::new())
        }
    };

    let store = Arc::new(LocalDocumentStore::new(storage));
    Ok(SyncEngine::spawn(store, remote, config).await?)
}

fn sign_in(cli: &Cli, handle: &SyncHandle) -> Result<()> {
    let owner = cli
        .owner
        .as_deref()
        .ok_or_else(|| anyhow!("no account given; set JOURNAL_OWNER or pass --owner"))?;
    let passphrase = cli
        .passphrase
        .as_deref()
        .ok_or_else(|| anyhow!("no passphrase given; set JOURNAL_PASSPHRASE"))?;

    handle.login(OwnerId::new(owner)?)?;
    handle.unlock(Passphrase::new(passphrase)?)?;
    Ok(())
}

/// Wait for the remote check that follows unlock.
async fn wait_until_ready(handle: &SyncHandle) -> Result<SyncStatus> {
    let mut rx = handle.subscribe();
    let status = tokio::time::timeout(
        READY_TIMEOUT,
        rx.wait_for(|s| !s.syncing && (s.unlocked || s.last_error.is_some())),
    )
    .await
    .context("timed out waiting for the remote")??
    .clone();
    Ok(status)
}

fn resolve_or_bail(handle: &SyncHandle, operation: Operation, policy: ConflictPolicy) -> Result<()> {
    if let Some(strategy) = operation.conflict_strategy() {
        println!("resolving conflict: {strategy}");
        handle.resolve(strategy)?;
        return Ok(());
    }

    if let ConflictPolicy::Auto(strategy) = policy {
        // the engine already started resolving
        println!("resolving conflict: {strategy}");
        return Ok(());
    }

    bail!("the remote copy changed on another device; {}", operation.hint())
}

async fn next_outcome(notices: &mut broadcast::Receiver<SyncNotice>) -> Result<SyncNotice> {
    loop {
        match notices.recv().await {
            Ok(notice) => {
                report(&notice);
                if is_outcome(&notice) {
                    return Ok(notice);
                }
            }
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed sync notices"),
            Err(RecvError::Closed) => bail!("sync engine stopped"),
        }
    }
}

fn is_outcome(notice: &SyncNotice) -> bool {
    !matches!(
        notice,
        SyncNotice::NewerRemoteAvailable { .. } | SyncNotice::LegacyPlaintext | SyncNotice::Deferred
    )
}

fn warn_unmigrated(status: &SyncStatus) {
    if let Some(error) = &status.migration_error {
        eprintln!("warning: legacy data was left unmigrated ({error}); fix it and run `migrate`");
    }
}

fn report(notice: &SyncNotice) {
    println!("{}", describe(notice));
}

fn describe(notice: &SyncNotice) -> String {
    match notice {
        SyncNotice::Uploaded { at } => format!("uploaded ({at})"),
        SyncNotice::Downloaded { at } => format!("downloaded remote copy from {at}"),
        SyncNotice::Merged { at, report } => format!(
            "merged: {} items added from remote, {} conflicting entries, {} side won ({at})",
            report.added_from_remote,
            report.conflicting_entries,
            if report.local_wins { "local" } else { "remote" }
        ),
        SyncNotice::NewerRemoteAvailable { remote_time } => {
            format!("a newer remote copy from {remote_time} is available; run `pull` to fetch it")
        }
        SyncNotice::ConflictDetected { conflict } => format!(
            "conflict: remote copy changed at {}{}",
            conflict.remote_time,
            conflict
                .remote_device
                .as_ref()
                .map(|device| format!(" on device {device}"))
                .unwrap_or_default()
        ),
        SyncNotice::NoRemoteCopy => "no remote copy exists yet".to_string(),
        SyncNotice::PassphraseRequired => "passphrase required".to_string(),
        SyncNotice::PassphraseRejected => "wrong passphrase".to_string(),
        SyncNotice::ReauthenticationRequired => "session expired; sign in again".to_string(),
        SyncNotice::SyncFailed { message } => format!("sync failed: {message}"),
        SyncNotice::LegacyPlaintext => {
            "remote copy was an unencrypted backup; it will be encrypted on next upload".to_string()
        }
        SyncNotice::Deferred => "sync already running; queued".to_string(),
    }
}
