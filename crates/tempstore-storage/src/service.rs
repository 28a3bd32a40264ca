//! Artifact service
//!
//! Orchestrates uploads, downloads and starring on top of [`Storage`].
//!
//! ## Upload flow
//!
//! ```text
//! put(project, version, stream)
//!   ├─ stage: hash + write to .staging/ in one pass
//!   ├─ take the digest's upload lock
//!   ├─ commit blob (atomic rename, or discard if already present)
//!   └─ upsert version row
//! ```
//!
//! The blob is durable before any row references it, so a crash between
//! the two steps leaves at worst an unreferenced blob for the sweeper.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, instrument};

use crate::blobs::{BlobReader, Digest};
use crate::error::StorageError;
use crate::expiry::describe_version;
use crate::naming::validate_identity;
use crate::storage::Storage;
use crate::structured::{OverwritePolicy, UpsertOutcome, VersionRecord};

/// Default retention window for unstarred versions
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Configuration for the artifact service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Re-upload behaviour for existing versions
    pub overwrite_policy: OverwritePolicy,
    /// Retention window, used to describe upcoming expiry
    pub retention: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            overwrite_policy: OverwritePolicy::default(),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }
}

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub digest: Digest,
    pub size: u64,
    pub outcome: UpsertOutcome,
}

/// Listing entry for one version
#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub project: String,
    pub version: String,
    pub digest: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub starred: bool,
    /// `None` for starred versions and retention past the calendar range
    pub expires_at: Option<DateTime<Utc>>,
    pub expiry: String,
}

impl VersionSummary {
    fn new(record: &VersionRecord, retention: Duration, now: DateTime<Utc>) -> Self {
        Self {
            project: record.project.clone(),
            version: record.version.clone(),
            digest: record.digest.to_hex(),
            size: record.size,
            created_at: record.created_at(),
            starred: record.starred,
            expires_at: (!record.starred)
                .then(|| record.created_at().checked_add_signed(retention))
                .flatten(),
            expiry: describe_version(record, retention, now),
        }
    }
}

/// Upload, download and pinning of artifacts
#[derive(Debug, Clone)]
pub struct ArtifactService {
    storage: Storage,
    config: ServiceConfig,
}

impl ArtifactService {
    pub fn new(storage: Storage, config: ServiceConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Upload an artifact for `(project, version)` and return its digest
    pub async fn put<R>(
        &self,
        project: &str,
        version: &str,
        reader: R,
    ) -> Result<PutReceipt, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        self.put_at(project, version, reader, Utc::now()).await
    }

    /// Upload with an explicit upload time
    #[instrument(skip(self, reader, now))]
    pub async fn put_at<R>(
        &self,
        project: &str,
        version: &str,
        reader: R,
        now: DateTime<Utc>,
    ) -> Result<PutReceipt, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        validate_identity(project, version)?;

        let blobs = self.storage.blobs();
        let versions = self.storage.versions();

        let staged = blobs.stage(reader).await?;
        let digest = staged.digest();
        let size = staged.size();

        let _upload = self.storage.locks().upload(&digest).await;

        // Refuse early so a rejected upload does not leave a blob behind;
        // upsert re-checks inside its transaction.
        if self.config.overwrite_policy == OverwritePolicy::Reject {
            match versions.get(project, version) {
                Ok(existing) if existing.digest != digest => {
                    return Err(StorageError::conflict(format!(
                        "{project}/{version} already exists with different content"
                    )));
                }
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }

        blobs.commit(staged).await?;
        let outcome =
            versions.upsert(project, version, digest, size, now, self.config.overwrite_policy)?;

        info!(
            hash = %digest.short(),
            size,
            outcome = outcome.as_str(),
            "Stored artifact"
        );

        Ok(PutReceipt {
            digest,
            size,
            outcome,
        })
    }

    /// Open the artifact stored for `(project, version)`.
    ///
    /// `NotFound` if the version does not exist; `Corrupt` if it exists but
    /// its blob is gone.
    #[instrument(skip(self))]
    pub async fn get(
        &self,
        project: &str,
        version: &str,
    ) -> Result<(VersionRecord, BlobReader), StorageError> {
        let record = self.storage.versions().get(project, version)?;
        self.open_record(record).await
    }

    /// Open the blob behind `record`, a row read without any lock held.
    ///
    /// A sweep or re-upload may remove the blob after the row was read, so a
    /// missing blob is checked against the current row before it counts as
    /// corruption.
    async fn open_record(
        &self,
        record: VersionRecord,
    ) -> Result<(VersionRecord, BlobReader), StorageError> {
        let blobs = self.storage.blobs();

        match blobs.read(&record.digest).await {
            Ok(reader) => {
                debug!(hash = %record.digest.short(), "Opened artifact");
                return Ok((record, reader));
            }
            Err(e) if !e.is_not_found() => return Err(e),
            Err(_) => {}
        }

        let current = match self.storage.versions().get(&record.project, &record.version) {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                debug!(hash = %record.digest.short(), "Version expired while opening");
                return Err(StorageError::not_found(format!(
                    "{}/{}",
                    record.project, record.version
                )));
            }
            Err(e) => return Err(e),
        };

        if current.digest != record.digest {
            debug!(
                previous = %record.digest.short(),
                hash = %current.digest.short(),
                "Version replaced while opening"
            );
            match blobs.read(&current.digest).await {
                Ok(reader) => return Ok((current, reader)),
                Err(e) if !e.is_not_found() => return Err(e),
                Err(_) => {}
            }
        }

        error!(hash = %current.digest, "Version references a missing blob");
        Err(StorageError::corrupt(format!(
            "{}/{} references missing blob {}",
            current.project, current.version, current.digest
        )))
    }

    /// Version metadata without opening the blob
    pub fn stat(&self, project: &str, version: &str) -> Result<VersionRecord, StorageError> {
        self.storage.versions().get(project, version)
    }

    /// Pin a version so the sweeper never expires it
    pub fn star(&self, project: &str, version: &str) -> Result<VersionRecord, StorageError> {
        let record = self.storage.versions().set_star(project, version, true)?;
        info!(project, version, "Starred version");
        Ok(record)
    }

    /// Unpin a version; its normal retention applies again
    pub fn unstar(&self, project: &str, version: &str) -> Result<VersionRecord, StorageError> {
        let record = self.storage.versions().set_star(project, version, false)?;
        info!(project, version, "Unstarred version");
        Ok(record)
    }

    /// All project names, alphabetically
    pub fn list_projects(&self) -> Result<Vec<String>, StorageError> {
        self.storage.versions().list_projects()
    }

    /// Versions of a project, newest first
    pub fn list_versions(&self, project: &str) -> Result<Vec<VersionSummary>, StorageError> {
        self.list_versions_at(project, Utc::now())
    }

    pub fn list_versions_at(
        &self,
        project: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<VersionSummary>, StorageError> {
        let records = self.storage.versions().list_versions(project)?;
        Ok(records
            .iter()
            .map(|record| VersionSummary::new(record, self.config.retention, now))
            .collect())
    }

    /// Summary of a single version
    pub fn summary(&self, project: &str, version: &str) -> Result<VersionSummary, StorageError> {
        let record = self.stat(project, version)?;
        Ok(VersionSummary::new(&record, self.config.retention, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use tempfile::TempDir;

    async fn create_test_service(policy: OverwritePolicy) -> (ArtifactService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(StorageConfig::with_base_dir(temp_dir.path()))
            .await
            .unwrap();
        let config = ServiceConfig {
            overwrite_policy: policy,
            ..Default::default()
        };
        (ArtifactService::new(storage, config), temp_dir)
    }

    async fn read_back(service: &ArtifactService, project: &str, version: &str) -> Vec<u8> {
        let (_, reader) = service.get(project, version).await.unwrap();
        reader.into_bytes().await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;
        let data: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 256) as u8).collect();

        let receipt = service.put("svc", "1.0", &data[..]).await.unwrap();
        assert_eq!(receipt.digest, Digest::of(&data));
        assert_eq!(receipt.size, data.len() as u64);
        assert_eq!(receipt.outcome, UpsertOutcome::Created);

        assert_eq!(read_back(&service, "svc", "1.0").await, data);
    }

    #[tokio::test]
    async fn test_identical_reupload_is_idempotent() {
        let (service, _temp) = create_test_service(OverwritePolicy::Reject).await;

        service.put("svc", "1.0", &b"bytesA"[..]).await.unwrap();
        let receipt = service.put("svc", "1.0", &b"bytesA"[..]).await.unwrap();
        assert_eq!(receipt.outcome, UpsertOutcome::Unchanged);

        assert_eq!(service.storage().versions().all().unwrap().len(), 1);
        assert_eq!(service.storage().blobs().list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_policy_leaves_no_blob() {
        let (service, _temp) = create_test_service(OverwritePolicy::Reject).await;

        service.put("svc", "1.0", &b"bytesA"[..]).await.unwrap();
        let err = service.put("svc", "1.0", &b"bytesB"[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        assert_eq!(read_back(&service, "svc", "1.0").await, b"bytesA");
        let blobs = service.storage().blobs();
        assert!(!blobs.exists(&Digest::of(b"bytesB")).await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_policy_replaces_content() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;

        service.put("svc", "1.0", &b"bytesA"[..]).await.unwrap();
        service.star("svc", "1.0").unwrap();
        let receipt = service.put("svc", "1.0", &b"bytesB"[..]).await.unwrap();
        assert_eq!(
            receipt.outcome,
            UpsertOutcome::Replaced {
                previous: Digest::of(b"bytesA")
            }
        );

        assert_eq!(read_back(&service, "svc", "1.0").await, b"bytesB");
        assert!(service.stat("svc", "1.0").unwrap().starred);
    }

    #[tokio::test]
    async fn test_get_missing_version() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;
        let err = service.get("svc", "1.0").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_blob_is_corrupt() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;

        let receipt = service.put("svc", "1.0", &b"bytesA"[..]).await.unwrap();
        service.storage().blobs().delete(&receipt.digest).await.unwrap();

        let err = service.get("svc", "1.0").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_version_expired_while_opening_is_not_found() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;

        let receipt = service.put("svc", "1.0", &b"bytesA"[..]).await.unwrap();
        let stale = service.stat("svc", "1.0").unwrap();

        // What a sweep does between the row read and the blob open
        service.storage().versions().delete("svc", "1.0").unwrap();
        service.storage().blobs().delete(&receipt.digest).await.unwrap();

        let err = service.open_record(stale).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_version_replaced_while_opening_reads_new_content() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;

        let first = service.put("svc", "1.0", &b"bytesA"[..]).await.unwrap();
        let stale = service.stat("svc", "1.0").unwrap();

        service.put("svc", "1.0", &b"bytesB"[..]).await.unwrap();
        service.storage().blobs().delete(&first.digest).await.unwrap();

        let (record, reader) = service.open_record(stale).await.unwrap();
        assert_eq!(record.digest, Digest::of(b"bytesB"));
        assert_eq!(&reader.into_bytes().await.unwrap()[..], b"bytesB");
    }

    #[tokio::test]
    async fn test_invalid_names_stage_nothing() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;

        let err = service.put("..", "1.0", &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        assert!(service.storage().blobs().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_star_unstar() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;

        service.put("svc", "1.0", &b"bytesA"[..]).await.unwrap();
        assert!(service.star("svc", "1.0").unwrap().starred);
        assert!(service.star("svc", "1.0").unwrap().starred);
        assert!(!service.unstar("svc", "1.0").unwrap().starred);

        assert!(service.star("svc", "2.0").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_versions_describes_expiry() {
        let (service, _temp) = create_test_service(OverwritePolicy::Overwrite).await;
        let now = Utc::now();

        service
            .put_at("svc", "1.0", &b"old"[..], now - Duration::days(29))
            .await
            .unwrap();
        service.put_at("svc", "2.0", &b"new"[..], now).await.unwrap();
        service.put_at("svc", "pinned", &b"pin"[..], now - Duration::days(90)).await.unwrap();
        service.star("svc", "pinned").unwrap();

        let versions = service.list_versions_at("svc", now).unwrap();
        let described: Vec<_> = versions
            .iter()
            .map(|v| (v.version.as_str(), v.expiry.as_str()))
            .collect();
        assert_eq!(
            described,
            vec![
                ("2.0", "expires in 30 days"),
                ("1.0", "expires in 1 day"),
                ("pinned", "starred"),
            ]
        );
        assert!(versions[2].expires_at.is_none());

        assert_eq!(service.list_projects().unwrap(), vec!["svc"]);
    }
}
