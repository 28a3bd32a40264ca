//! Storage handles combining blobs and version metadata
//!
//! [`Storage`] is opened once at startup and cloned into the artifact
//! service and the sweeper. It owns:
//! - the content-addressed [`BlobStore`]
//! - the redb-backed [`VersionStore`]
//! - the [`UploadLocks`] shared between uploads and blob collection
//!
//! ```text
//! <base_dir>/
//!   blobs/.staging/      in-progress uploads
//!   blobs/ab/cd/abcd...  committed blobs
//!   tempstore.redb       version metadata
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::blobs::{BlobStore, BlobStoreConfig};
use crate::error::StorageError;
use crate::locks::UploadLocks;
use crate::structured::{RedbStorage, RedbStorageConfig, VersionStore};

/// Configuration for the combined storage
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory for all storage
    pub base_dir: PathBuf,
    /// redb configuration
    pub redb: RedbStorageConfig,
    /// Blob store configuration
    pub blobs: BlobStoreConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::with_base_dir("./data")
    }
}

impl StorageConfig {
    /// Create a configuration with a custom base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            base_dir: base_dir.clone(),
            redb: RedbStorageConfig {
                db_path: base_dir.join("tempstore.redb"),
            },
            blobs: BlobStoreConfig {
                base_dir: base_dir.join("blobs"),
                ..Default::default()
            },
        }
    }

    /// Set the maximum accepted blob size
    pub fn with_max_blob_size(mut self, max_blob_size: u64) -> Self {
        self.blobs.max_blob_size = max_blob_size;
        self
    }
}

/// Shared handles to the content and metadata stores
#[derive(Debug, Clone)]
pub struct Storage {
    blobs: Arc<BlobStore>,
    versions: VersionStore,
    locks: Arc<UploadLocks>,
}

impl Storage {
    /// Open the stores, creating directories and tables as needed.
    ///
    /// Safe to run against an already initialized location.
    #[instrument(skip(config), fields(base_dir = %config.base_dir.display()))]
    pub async fn open(config: StorageConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.base_dir).await?;

        let redb = Arc::new(RedbStorage::open(config.redb.clone())?);
        let versions = VersionStore::new(redb);

        let blobs = Arc::new(BlobStore::new(config.blobs.clone()).await?);

        info!("Storage initialized");

        Ok(Self {
            blobs,
            versions,
            locks: Arc::new(UploadLocks::default()),
        })
    }

    /// Get the blob store
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Get the version store
    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    pub(crate) fn locks(&self) -> &UploadLocks {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig::with_base_dir(temp_dir.path().join("data"));

        let digest = {
            let storage = Storage::open(config.clone()).await.unwrap();
            storage.blobs().store(b"persisted").await.unwrap()
        };

        let storage = Storage::open(config).await.unwrap();
        assert!(storage.blobs().exists(&digest).await.unwrap());
        assert!(storage.versions().all().unwrap().is_empty());
        assert!(temp_dir.path().join("data").join("tempstore.redb").exists());
    }
}
