//! Offline-first encrypted synchronization engine for Class Journal
//!
//! Provides:
//! - A local document store over SQLite (or memory) that always accepts writes
//! - Legacy single-class data migration into the versioned document
//! - Passphrase-based encryption of the whole journal before it leaves the device
//! - A debounced, serialized sync state machine with conflict detection
//! - Three conflict resolutions: force upload, overwrite local, merge
//! - PostgREST and Google Drive remotes, and an in-memory remote for tests
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use journal_sync::{
//!     LocalDocumentStore, MemoryBlobClient, MemoryStorage, OwnerId, Passphrase, SyncConfig,
//!     SyncEngine,
//! };
//!
//! # async fn run() -> journal_sync::SyncResult<()> {
//! let store = Arc::new(LocalDocumentStore::new(Arc::new(MemoryStorage::new())));
//! let (handle, _worker) =
//!     SyncEngine::spawn(store, Arc::new(MemoryBlobClient::new()), SyncConfig::default()).await?;
//!
//! handle.login(OwnerId::new("teacher-1")?)?;
//! handle.unlock(Passphrase::new("correct horse")?)?;
//! handle.apply_local_change(|doc| doc.add_class("2-3")).await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::indexing_slicing, clippy::panic))]

pub mod codec;
pub mod config;
pub mod conflict;
pub mod device;
pub mod document;
pub mod engine;
pub mod error;
pub mod local_store;
pub mod machine;
pub mod merge;
pub mod migration;
pub mod remote;
pub mod session;
pub mod status;
pub mod storage;

pub use codec::{DocumentCodec, OpenedBlob};
pub use config::{DriveConfig, LocalStoreConfig, RemoteConfig, SyncConfig};
pub use conflict::{
    ConflictDetector, ConflictPolicy, ConflictResolutionStrategy, PendingConflict, Watermark,
    WatermarkSource,
};
pub use device::DeviceId;
pub use document::{DailyRecord, Document, DocumentSummary, SCHEMA_VERSION};
pub use engine::{SyncEngine, SyncHandle};
pub use error::{SyncError, SyncResult};
pub use local_store::LocalDocumentStore;
pub use merge::{merge_documents, MergeOutcome, MergeReport};
pub use migration::{run_migration, MigrationOutcome};
pub use remote::{
    DriveBlobClient, EncryptedBlob, HttpBlobClient, MemoryBlobClient, RemoteBlobClient, RemoteError,
    RemoteMetadata,
};
pub use session::{OwnerId, Passphrase, Session};
pub use status::{SyncNotice, SyncState, SyncStatus};
pub use storage::{KeyValueStore, MemoryStorage, SqliteStorage};
