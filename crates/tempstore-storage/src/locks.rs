//! Upload/collection interlock
//!
//! An upload holds a shared lock on its digest from blob commit until the
//! version row is written; the sweeper takes the exclusive lock before it
//! re-checks and deletes an unreferenced blob. Either the upload commits
//! its row first and the blob is kept, or the blob is gone before the
//! upload commits and the upload writes it again.
//!
//! Locks are striped by the first digest byte, so unrelated digests may
//! share a stripe. That only costs some waiting.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::blobs::Digest;

const DEFAULT_STRIPES: usize = 64;

#[derive(Debug)]
pub struct UploadLocks {
    stripes: Vec<RwLock<()>>,
}

impl Default for UploadLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl UploadLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Shared lock held by an upload across blob commit and row upsert
    pub async fn upload(&self, digest: &Digest) -> RwLockReadGuard<'_, ()> {
        self.stripe(digest).read().await
    }

    /// Exclusive lock held by the sweeper while deleting a blob
    pub async fn collect(&self, digest: &Digest) -> RwLockWriteGuard<'_, ()> {
        self.stripe(digest).write().await
    }

    fn stripe(&self, digest: &Digest) -> &RwLock<()> {
        &self.stripes[digest.as_bytes()[0] as usize % self.stripes.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_uploads_share_collection_excludes() {
        let locks = UploadLocks::default();
        let digest = Digest::of(b"content");

        let first = locks.upload(&digest).await;
        let second = locks.upload(&digest).await;

        // Collection must wait while uploads are in flight
        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.collect(&digest)).await;
        assert!(blocked.is_err());

        drop(first);
        drop(second);

        let guard = tokio::time::timeout(Duration::from_millis(50), locks.collect(&digest)).await;
        assert!(guard.is_ok());
    }
}
