//! In-process remote store
//!
//! Clones share one underlying map, so several engines holding clones of
//! the same client behave like devices talking to one server.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{EncryptedBlob, RemoteBlobClient, RemoteError, RemoteMetadata, RemoteResult};
use crate::session::OwnerId;

#[derive(Default)]
struct Inner {
    blobs: HashMap<OwnerId, EncryptedBlob>,
    failures: VecDeque<RemoteError>,
    upserts: usize,
}

#[derive(Clone, Default)]
pub struct MemoryBlobClient {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBlobClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current blob for `owner`, bypassing failure injection.
    pub fn blob(&self, owner: &OwnerId) -> Option<EncryptedBlob> {
        self.inner.lock().blobs.get(owner).cloned()
    }

    /// Store a blob directly, as if another client had uploaded it.
    pub fn put_blob(&self, owner: &OwnerId, blob: EncryptedBlob) {
        self.inner.lock().blobs.insert(owner.clone(), blob);
    }

    /// Make the next remote call fail with `error`. Failures queue up and
    /// are consumed one per call.
    pub fn fail_next(&self, error: RemoteError) {
        self.inner.lock().failures.push_back(error);
    }

    /// Number of successful upserts so far.
    pub fn upsert_count(&self) -> usize {
        self.inner.lock().upserts
    }

    fn take_failure(&self) -> RemoteResult<()> {
        match self.inner.lock().failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteBlobClient for MemoryBlobClient {
    async fn get_metadata(&self, owner: &OwnerId) -> RemoteResult<Option<RemoteMetadata>> {
        self.take_failure()?;
        Ok(self.inner.lock().blobs.get(owner).map(EncryptedBlob::metadata))
    }

    async fn fetch(&self, owner: &OwnerId) -> RemoteResult<EncryptedBlob> {
        self.take_failure()?;
        self.inner
            .lock()
            .blobs
            .get(owner)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(owner.to_string()))
    }

    async fn upsert(&self, owner: &OwnerId, blob: &EncryptedBlob) -> RemoteResult<RemoteMetadata> {
        self.take_failure()?;
        let mut inner = self.inner.lock();
        inner.blobs.insert(owner.clone(), blob.clone());
        inner.upserts += 1;
        Ok(blob.metadata())
    }
}
