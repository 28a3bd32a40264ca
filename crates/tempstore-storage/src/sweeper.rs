//! Retention sweeper
//!
//! Two-phase batch that reclaims storage:
//!
//! 1. **Expire metadata**: delete every unstarred version uploaded before
//!    `now - retention`. Each row is re-checked inside its delete
//!    transaction, so a concurrent star keeps the row.
//! 2. **Collect blobs**: take the set of referenced digests *after* phase 1,
//!    then delete every blob outside it. Blobs younger than the grace
//!    window are skipped, and each deletion happens under the digest's
//!    exclusive upload lock after a fresh reference check.
//!
//! Failures on individual rows or blobs are logged and counted; the batch
//! carries on. Every step is idempotent, so an interrupted sweep is simply
//! run again.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::blobs::BlobInfo;
use crate::error::StorageError;
use crate::service::DEFAULT_RETENTION_DAYS;
use crate::storage::Storage;

/// Default minimum age before an unreferenced blob may be collected
pub const DEFAULT_BLOB_GRACE_SECS: i64 = 60;

/// Default idle time before a staging file counts as abandoned
pub const DEFAULT_STAGING_GRACE_SECS: i64 = 3600;

/// Configuration for the sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Unstarred versions older than this are expired
    pub retention: Duration,
    /// Unreferenced blobs younger than this are left for a later run
    pub blob_grace: Duration,
    /// Staging files idle for longer than this are removed
    pub staging_grace: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            blob_grace: Duration::seconds(DEFAULT_BLOB_GRACE_SECS),
            staging_grace: Duration::seconds(DEFAULT_STAGING_GRACE_SECS),
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Version rows deleted in phase 1
    pub rows_expired: usize,
    /// Version rows that could not be deleted
    pub row_failures: usize,
    /// Blobs deleted in phase 2
    pub blobs_deleted: usize,
    /// Bytes freed by deleted blobs
    pub bytes_freed: u64,
    /// Blobs kept because a version references them
    pub blobs_retained: usize,
    /// Unreferenced blobs kept because they are within the grace window
    pub blobs_skipped: usize,
    /// Blobs that could not be deleted
    pub blob_failures: usize,
    /// Abandoned staging files removed
    pub staging_purged: usize,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} version(s) expired, {} blob(s) collected ({} bytes), {} retained, {} too recent, {} failure(s)",
            self.rows_expired,
            self.blobs_deleted,
            self.bytes_freed,
            self.blobs_retained,
            self.blobs_skipped,
            self.row_failures + self.blob_failures,
        )
    }
}

/// Expires old versions and garbage-collects orphaned blobs
#[derive(Debug, Clone)]
pub struct Sweeper {
    storage: Storage,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(storage: Storage, config: SweeperConfig) -> Self {
        Self { storage, config }
    }

    /// Run both phases against the current time
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        self.sweep_at(Utc::now()).await
    }

    /// Run both phases as if the current time were `now`.
    ///
    /// Only listing failures abort the sweep; per-item failures are counted
    /// in the report.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
        let expiry_cutoff = cutoff(now, self.config.retention, "retention")?;
        let grace_cutoff = cutoff(now, self.config.blob_grace, "blob grace")?;
        let staging_cutoff = cutoff(now, self.config.staging_grace, "staging grace")?;

        let mut report = SweepReport::default();

        self.expire_versions(expiry_cutoff, &mut report)?;
        self.collect_blobs(grace_cutoff, &mut report).await?;

        match self.storage.blobs().purge_staging(staging_cutoff).await {
            Ok(purged) => report.staging_purged = purged,
            Err(e) => warn!(error = %e, "Failed to purge staging area"),
        }

        info!(
            rows_expired = report.rows_expired,
            blobs_deleted = report.blobs_deleted,
            bytes_freed = report.bytes_freed,
            blobs_retained = report.blobs_retained,
            blobs_skipped = report.blobs_skipped,
            failures = report.row_failures + report.blob_failures,
            "Sweep complete"
        );

        Ok(report)
    }

    /// Phase 1: delete unstarred versions created before `cutoff`
    fn expire_versions(
        &self,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), StorageError> {
        let versions = self.storage.versions();

        for record in versions.list_expired(cutoff)? {
            match versions.delete_if_expired(&record.project, &record.version, cutoff) {
                Ok(true) => {
                    debug!(
                        project = %record.project,
                        version = %record.version,
                        "Expired version"
                    );
                    report.rows_expired += 1;
                }
                // Starred or re-uploaded since listing
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        project = %record.project,
                        version = %record.version,
                        error = %e,
                        "Failed to expire version"
                    );
                    report.row_failures += 1;
                }
            }
        }

        Ok(())
    }

    /// Phase 2: delete blobs no version references
    async fn collect_blobs(
        &self,
        grace_cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), StorageError> {
        let referenced = self.storage.versions().list_all_digests()?;

        for blob in self.storage.blobs().list_all().await? {
            if referenced.contains(&blob.digest) {
                report.blobs_retained += 1;
                continue;
            }
            if blob.modified >= grace_cutoff {
                debug!(hash = %blob.digest.short(), "Unreferenced blob within grace window");
                report.blobs_skipped += 1;
                continue;
            }

            self.collect_blob(&blob, report).await;
        }

        Ok(())
    }

    async fn collect_blob(&self, blob: &BlobInfo, report: &mut SweepReport) {
        let _collect = self.storage.locks().collect(&blob.digest).await;

        // An upload may have referenced the blob since the snapshot
        match self.storage.versions().is_referenced(&blob.digest) {
            Ok(true) => {
                report.blobs_retained += 1;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(hash = %blob.digest.short(), error = %e, "Failed to check blob references");
                report.blob_failures += 1;
                return;
            }
        }

        match self.storage.blobs().delete(&blob.digest).await {
            Ok(()) => {
                report.blobs_deleted += 1;
                report.bytes_freed += blob.size;
            }
            // Already collected by an earlier, interrupted run
            Err(e) if e.is_not_found() => {
                debug!(hash = %blob.digest.short(), "Blob already gone");
            }
            Err(e) => {
                warn!(hash = %blob.digest.short(), error = %e, "Failed to delete blob");
                report.blob_failures += 1;
            }
        }
    }
}

/// `now - window`, or `Invalid` when the window reaches past the
/// representable range
fn cutoff(now: DateTime<Utc>, window: Duration, name: &str) -> Result<DateTime<Utc>, StorageError> {
    now.checked_sub_signed(window).ok_or_else(|| {
        StorageError::invalid(format!("{name} of {} days is out of range", window.num_days()))
    })
}
