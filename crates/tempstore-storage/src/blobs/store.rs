//! Blob store implementation
//!
//! File-based content-addressed storage using BLAKE3 hashing.
//!
//! Uploads are streamed into a uniquely named file under `.staging/`,
//! hashed on the way, fsynced and then renamed into their sharded
//! location. A rename is atomic, so readers only ever see complete blobs
//! and concurrent writers of the same content cannot corrupt each other.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::digest::{Digest, HashingWriter};
use crate::error::StorageError;

const STAGING_DIR: &str = ".staging";

/// Configuration for the blob store
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// Base directory for blob storage
    pub base_dir: PathBuf,
    /// Number of subdirectory levels (for sharding)
    pub shard_depth: u8,
    /// Maximum blob size (bytes)
    pub max_blob_size: u64,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/blobs"),
            shard_depth: 2,                        // e.g., ab/cd/abcdef...
            max_blob_size: 4 * 1024 * 1024 * 1024, // 4GB
        }
    }
}

/// A blob physically present in the store
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub digest: Digest,
    pub size: u64,
    /// Last modification time of the blob file
    pub modified: DateTime<Utc>,
}

/// Upload that has been hashed and written to a staging file but not yet
/// committed. Dropping it removes the staging file.
#[derive(Debug)]
pub struct StagedBlob {
    digest: Digest,
    size: u64,
    temp_path: PathBuf,
    committed: bool,
}

impl StagedBlob {
    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if !self.committed
            && let Err(e) = std::fs::remove_file(&self.temp_path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.temp_path.display(), error = %e, "Failed to remove staging file");
        }
    }
}

/// Streaming reader over a committed blob
#[derive(Debug)]
pub struct BlobReader {
    digest: Digest,
    size: u64,
    file: File,
}

impl BlobReader {
    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the remaining content into memory
    pub async fn into_bytes(mut self) -> Result<Bytes, StorageError> {
        let mut data = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut data).await?;
        Ok(Bytes::from(data))
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

/// Content-addressed blob store
#[derive(Debug)]
pub struct BlobStore {
    config: BlobStoreConfig,
}

impl BlobStore {
    /// Create a new blob store
    ///
    /// Creates the base and staging directories; safe to call on an
    /// existing store.
    pub async fn new(config: BlobStoreConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(config.base_dir.join(STAGING_DIR)).await?;

        info!(path = %config.base_dir.display(), "Blob store initialized");

        Ok(Self { config })
    }

    /// Check if a blob exists
    pub async fn exists(&self, digest: &Digest) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.blob_path(digest)).await?)
    }

    /// Stream `reader` into a staging file, hashing it on the way.
    ///
    /// Fails with `CapacityExceeded` once more than `max_blob_size` bytes
    /// have been read; the partial staging file is removed.
    #[instrument(skip(self, reader))]
    pub async fn stage<R>(&self, reader: R) -> Result<StagedBlob, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let temp_path = self
            .staging_dir()
            .join(format!("{}.tmp", Uuid::new_v4().simple()));

        let file = File::create_new(&temp_path).await?;

        // The guard owns the temp file from here on, so every early return
        // below cleans it up.
        let mut staged = StagedBlob {
            digest: Digest::new([0u8; 32]),
            size: 0,
            temp_path,
            committed: false,
        };

        let limit = self.config.max_blob_size;
        let mut writer = HashingWriter::new(file);
        let mut limited = reader.take(limit.saturating_add(1));
        tokio::io::copy(&mut limited, &mut writer).await?;

        if writer.written() > limit {
            debug!(limit, "Upload exceeds maximum blob size");
            return Err(StorageError::CapacityExceeded);
        }

        writer.flush().await?;
        staged.digest = writer.digest();
        staged.size = writer.written();

        let file = writer.into_inner();
        file.sync_all().await?;

        debug!(hash = %staged.digest.short(), size = staged.size, "Staged blob");
        Ok(staged)
    }

    /// Move a staged blob to its content-addressed location.
    ///
    /// If a blob with the same digest is already present the staging file
    /// is discarded instead; the content is identical by construction.
    #[instrument(skip(self, staged), fields(hash = %staged.digest.short()))]
    pub async fn commit(&self, mut staged: StagedBlob) -> Result<Digest, StorageError> {
        let digest = staged.digest;
        let path = self.blob_path(&digest);

        if fs::try_exists(&path).await? {
            debug!("Blob already exists");
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Atomic rename
        fs::rename(&staged.temp_path, &path).await?;
        staged.committed = true;

        debug!(size = staged.size, "Stored blob");
        Ok(digest)
    }

    /// Write a blob under a digest the caller already knows.
    ///
    /// No-op if the blob exists. The content is still hashed and must
    /// match `digest`, otherwise nothing is committed.
    pub async fn write<R>(&self, digest: &Digest, reader: R) -> Result<(), StorageError>
    where
        R: AsyncRead + Unpin,
    {
        if self.exists(digest).await? {
            debug!(hash = %digest.short(), "Blob already exists");
            return Ok(());
        }

        let staged = self.stage(reader).await?;
        if staged.digest() != *digest {
            return Err(StorageError::invalid(format!(
                "content hashes to {} but was written as {}",
                staged.digest(),
                digest
            )));
        }

        self.commit(staged).await?;
        Ok(())
    }

    /// Store in-memory content and return its digest
    pub async fn store(&self, data: &[u8]) -> Result<Digest, StorageError> {
        let staged = self.stage(data).await?;
        self.commit(staged).await
    }

    /// Open a blob for streaming
    #[instrument(skip(self), fields(hash = %digest.short()))]
    pub async fn read(&self, digest: &Digest) -> Result<BlobReader, StorageError> {
        let path = self.blob_path(digest);

        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StorageError::not_found(format!("blob {}", digest))
            } else {
                StorageError::Io(e.to_string())
            }
        })?;
        let size = file.metadata().await?.len();

        Ok(BlobReader {
            digest: *digest,
            size,
            file,
        })
    }

    /// Load a blob into memory and verify its hash
    pub async fn load(&self, digest: &Digest) -> Result<Bytes, StorageError> {
        let data = self.read(digest).await?.into_bytes().await?;

        // Verify hash
        let actual = Digest::of(&data);
        if actual != *digest {
            warn!(
                expected = %digest,
                actual = %actual,
                "Blob hash mismatch"
            );
            return Err(StorageError::corrupt(format!("blob {} hash mismatch", digest)));
        }

        Ok(data)
    }

    /// Delete a blob; `NotFound` if it is not present
    #[instrument(skip(self), fields(hash = %digest.short()))]
    pub async fn delete(&self, digest: &Digest) -> Result<(), StorageError> {
        let path = self.blob_path(digest);

        match fs::remove_file(&path).await {
            Ok(_) => {
                debug!("Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::not_found(format!("blob {}", digest)))
            }
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    /// Get the file path for a digest
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hash_hex = digest.to_hex();

        let mut path = self.config.base_dir.clone();

        // Add shard directories
        for i in 0..self.config.shard_depth as usize {
            let start = i * 2;
            let end = start + 2;
            if end <= hash_hex.len() {
                path.push(&hash_hex[start..end]);
            }
        }

        // Add the full hash as filename
        path.push(&hash_hex);
        path
    }

    fn staging_dir(&self) -> PathBuf {
        self.config.base_dir.join(STAGING_DIR)
    }

    /// List all committed blobs
    pub async fn list_all(&self) -> Result<Vec<BlobInfo>, StorageError> {
        let mut blobs = Vec::new();
        self.collect_blobs(&self.config.base_dir, &mut blobs).await?;
        Ok(blobs)
    }

    /// Recursively collect blobs, skipping the staging area
    fn collect_blobs<'a>(
        &'a self,
        dir: &'a Path,
        blobs: &'a mut Vec<BlobInfo>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = fs::read_dir(dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if entry.file_name() != STAGING_DIR {
                        self.collect_blobs(&path, blobs).await?;
                    }
                } else if let Some(name) = path.file_name().and_then(|n| n.to_str())
                    && let Ok(digest) = Digest::from_hex(name)
                {
                    // The blob may have been collected since read_dir
                    let metadata = match entry.metadata().await {
                        Ok(metadata) => metadata,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };

                    blobs.push(BlobInfo {
                        digest,
                        size: metadata.len(),
                        modified: metadata.modified()?.into(),
                    });
                }
            }

            Ok(())
        })
    }

    /// Remove staging files abandoned before `older_than`.
    ///
    /// Staging files normally disappear with their `StagedBlob`; this
    /// catches the ones left behind by a crash.
    pub async fn purge_staging(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut entries = fs::read_dir(self.staging_dir()).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let modified: DateTime<Utc> = match entry.metadata().await {
                Ok(metadata) => metadata.modified()?.into(),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if modified >= older_than {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(_) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed > 0 {
            info!(removed, "Purged abandoned staging files");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store() -> (BlobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = BlobStoreConfig {
            base_dir: temp_dir.path().join("blobs"),
            ..Default::default()
        };
        let store = BlobStore::new(config).await.unwrap();
        (store, temp_dir)
    }

    async fn staging_entries(store: &BlobStore) -> usize {
        let mut entries = fs::read_dir(store.staging_dir()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let (store, _temp) = create_test_store().await;

        let data = b"Hello, blob storage!";
        let digest = store.store(data).await.unwrap();

        assert_eq!(digest, Digest::of(data));

        let loaded = store.load(&digest).await.unwrap();
        assert_eq!(&loaded[..], data);
    }

    #[tokio::test]
    async fn test_content_addressing() {
        let (store, _temp) = create_test_store().await;

        let data = b"Duplicate content";

        let d1 = store.store(data).await.unwrap();
        let d2 = store.store(data).await.unwrap();
        assert_eq!(d1, d2);

        // Only one file should exist, and no staging leftovers
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].size, data.len() as u64);
        assert_eq!(staging_entries(&store).await, 0);
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let (store, _temp) = create_test_store().await;

        let digest = store.store(b"Delete me").await.unwrap();
        assert!(store.exists(&digest).await.unwrap());

        store.delete(&digest).await.unwrap();
        assert!(!store.exists(&digest).await.unwrap());

        // Delete again should report NotFound
        let err = store.delete(&digest).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (store, _temp) = create_test_store().await;
        let err = store.read(&Digest::of(b"never stored")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_hash_verification() {
        let (store, temp) = create_test_store().await;

        let digest = store.store(b"Original data").await.unwrap();
        let hex = digest.to_hex();

        let path = temp
            .path()
            .join("blobs")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex);

        fs::write(&path, b"Corrupted!").await.unwrap();

        let result = store.load(&digest).await;
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_write_with_known_digest() {
        let (store, _temp) = create_test_store().await;
        let data = b"known content";
        let digest = Digest::of(data);

        store.write(&digest, &data[..]).await.unwrap();
        // Second write is a no-op
        store.write(&digest, &data[..]).await.unwrap();
        assert_eq!(store.list_all().await.unwrap().len(), 1);

        // Mismatching content is refused and nothing is left behind
        let wrong = Digest::of(b"something else");
        let err = store.write(&wrong, &data[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        assert!(!store.exists(&wrong).await.unwrap());
        assert_eq!(staging_entries(&store).await, 0);
    }

    #[tokio::test]
    async fn test_dropped_stage_leaves_nothing() {
        let (store, _temp) = create_test_store().await;

        let staged = store.stage(&b"abandoned upload"[..]).await.unwrap();
        let digest = staged.digest();
        assert_eq!(staging_entries(&store).await, 1);

        drop(staged);

        assert_eq!(staging_entries(&store).await, 0);
        assert!(!store.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_max_blob_size() {
        let temp_dir = TempDir::new().unwrap();
        let config = BlobStoreConfig {
            base_dir: temp_dir.path().join("blobs"),
            max_blob_size: 16,
            ..Default::default()
        };
        let store = BlobStore::new(config).await.unwrap();

        assert!(store.store(&[1u8; 16]).await.is_ok());

        let err = store.store(&[2u8; 17]).await.unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded));
        assert_eq!(staging_entries(&store).await, 0);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_streaming_read() {
        let (store, _temp) = create_test_store().await;
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let digest = store.store(&data).await.unwrap();

        let mut reader = store.read(&digest).await.unwrap();
        assert_eq!(reader.size(), data.len() as u64);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_purge_staging() {
        let (store, _temp) = create_test_store().await;

        // Simulate a crash leftover
        let leftover = store.staging_dir().join("deadbeef.tmp");
        fs::write(&leftover, b"partial").await.unwrap();

        // Too recent
        let removed = store
            .purge_staging(Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = store
            .purge_staging(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_list_ignores_staging_and_foreign_files() {
        let (store, temp) = create_test_store().await;

        store.store(b"one").await.unwrap();
        store.store(b"two").await.unwrap();
        let _staged = store.stage(&b"in flight"[..]).await.unwrap();
        fs::write(temp.path().join("blobs").join("README"), b"hi")
            .await
            .unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().map(|b| b.size).sum::<u64>(), 6);
    }
}
