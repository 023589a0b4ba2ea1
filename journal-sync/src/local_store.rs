//! Local document store
//!
//! Holds the whole journal as one JSON value under a single versioned key,
//! plus the sync watermark and the device identity. Local storage is
//! authoritative: remote failures never touch it.
//!
//! Every write bumps a process-local generation counter. The sync engine
//! compares the generation an upload was taken at with the latest mutation
//! it has seen to decide whether `dirty` may be cleared.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::conflict::Watermark;
use crate::device::DeviceId;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::storage::KeyValueStore;

/// Storage keys, shared with the desktop app's localStorage layout.
pub mod keys {
    /// Current document, schema version 2.
    pub const DOCUMENT: &str = "cj_journal_v2";
    pub const WATERMARK: &str = "cj_sync_watermark";
    pub const DEVICE_ID: &str = "cj_device_id";
    /// Set while legacy data failed to migrate; holds the last error.
    pub const MIGRATION_PENDING: &str = "cj_migration_pending";

    /// Flat single-class layout written by older versions.
    pub const LEGACY_RECORDS: &str = "cj_daily_records";
    pub const LEGACY_STUDENTS: &str = "cj_students";
    pub const LEGACY_TODOS: &str = "cj_todos";
}

pub struct LocalDocumentStore {
    storage: Arc<dyn KeyValueStore>,
    /// Serializes read-modify-write cycles on the document key.
    write_lock: Mutex<()>,
    generation: AtomicU64,
}

impl LocalDocumentStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStore> {
        &self.storage
    }

    /// Generation of the most recent write.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Current document; empty when nothing was saved yet.
    pub async fn load(&self) -> SyncResult<Document> {
        match self.storage.get(keys::DOCUMENT).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| SyncError::Deserialization(format!("local document: {e}"))),
            None => Ok(Document::default()),
        }
    }

    /// Write `document` as-is and return the new generation.
    pub async fn save(&self, document: &Document) -> SyncResult<u64> {
        let _guard = self.write_lock.lock().await;
        self.write(document).await
    }

    /// Apply a local mutation: load, run `f`, stamp `updatedAt`, save.
    /// Returns the new generation together with `f`'s result.
    pub async fn update<F, R>(&self, f: F) -> SyncResult<(u64, R)>
    where
        F: FnOnce(&mut Document) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        let result = f(&mut document);
        document.updated_at = Some(Utc::now());
        let generation = self.write(&document).await?;
        Ok((generation, result))
    }

    /// Replace the document wholesale, keeping its own `updatedAt`, but only
    /// if nothing was written since generation `expected`. Returns `None`,
    /// leaving the document alone, when a newer write exists.
    pub async fn replace_if_unchanged(&self, document: Document, expected: u64) -> SyncResult<Option<u64>> {
        let _guard = self.write_lock.lock().await;
        let current = self.generation();
        if current != expected {
            tracing::debug!(expected, current, "Document changed since download started");
            return Ok(None);
        }
        self.write(&document).await.map(Some)
    }

    /// Compute a new document from the current one under the write lock.
    /// Used by merge so that edits made while the remote copy was in flight
    /// are part of the merge input.
    pub async fn rewrite<F, R>(&self, f: F) -> SyncResult<(u64, R)>
    where
        F: FnOnce(Document) -> (Document, R),
    {
        let _guard = self.write_lock.lock().await;
        let current = self.load().await?;
        let (next, result) = f(current);
        let generation = self.write(&next).await?;
        Ok((generation, result))
    }

    /// Consistent document and generation pair for upload.
    pub async fn snapshot(&self) -> SyncResult<(Document, u64)> {
        let _guard = self.write_lock.lock().await;
        let document = self.load().await?;
        Ok((document, self.generation()))
    }

    /// Remove a class and its data. Returns the new generation, or `None`
    /// when the class did not exist.
    pub async fn delete_class(&self, class_id: &str) -> SyncResult<Option<u64>> {
        let (generation, removed) = self.update(|doc| doc.delete_class(class_id)).await?;
        Ok(removed.then_some(generation))
    }

    pub async fn load_watermark(&self) -> SyncResult<Option<Watermark>> {
        match self.storage.get(keys::WATERMARK).await? {
            Some(raw) => Watermark::decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn save_watermark(&self, watermark: &Watermark) -> SyncResult<()> {
        self.storage
            .set(keys::WATERMARK, &watermark.encode()?)
            .await
    }

    /// This installation's device id, generated and persisted on first use.
    pub async fn device_id(&self) -> SyncResult<DeviceId> {
        if let Some(id) = self.storage.get(keys::DEVICE_ID).await? {
            if !id.trim().is_empty() {
                return Ok(DeviceId::from_string(id.trim()));
            }
        }

        let id = DeviceId::generate();
        self.storage.set(keys::DEVICE_ID, id.as_str()).await?;
        tracing::info!(device_id = %id, "Generated new device id");
        Ok(id)
    }

    async fn write(&self, document: &Document) -> SyncResult<u64> {
        let raw = serde_json::to_string(document)?;
        self.storage.set(keys::DOCUMENT, &raw).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(generation, bytes = raw.len(), "Saved local document");
        Ok(generation)
    }
}
