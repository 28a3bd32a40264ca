//! Version metadata storage
//!
//! One row per uploaded `(project, version)`, binding the identity to a
//! blob digest, an upload time and a star flag. Every mutation runs in a
//! single redb write transaction. redb admits one writer at a time, so
//! concurrent upserts, star flips and deletions of the same row serialize.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, Table};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::tables::{DIGEST_REFS, RedbStorage, VERSIONS};
use crate::blobs::Digest;
use crate::error::StorageError;
use crate::naming::validate_identity;

const KEY_SEPARATOR: u8 = 0x00;
const EMPTY: &[u8] = &[];

/// Metadata about one uploaded version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub project: String,
    pub version: String,
    /// Blob holding the artifact content
    pub digest: Digest,
    /// Artifact size in bytes
    pub size: u64,
    /// When the current content was uploaded (Unix millis)
    pub created_at_millis: i64,
    /// Starred versions are never expired
    pub starred: bool,
}

impl VersionRecord {
    /// Create a new, unstarred version record
    pub fn new(
        project: impl Into<String>,
        version: impl Into<String>,
        digest: Digest,
        size: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            project: project.into(),
            version: version.into(),
            digest,
            size,
            created_at_millis: created_at.timestamp_millis(),
            starred: false,
        }
    }

    /// Upload time
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.created_at_millis).unwrap_or_default()
    }

    /// Whether the sweeper may delete this row at `cutoff`
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        !self.starred && self.created_at_millis < cutoff.timestamp_millis()
    }

    fn key(&self) -> Vec<u8> {
        version_key(&self.project, &self.version)
    }
}

/// What to do when a version is uploaded again with different content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Point the version at the new content and restart its retention
    #[default]
    Overwrite,
    /// Refuse with `Conflict`
    Reject,
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new version row was created
    Created,
    /// The version already referenced this exact content
    Unchanged,
    /// The version now references new content
    Replaced { previous: Digest },
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Unchanged => "unchanged",
            UpsertOutcome::Replaced { .. } => "replaced",
        }
    }
}

/// Version metadata store
#[derive(Debug, Clone)]
pub struct VersionStore {
    storage: Arc<RedbStorage>,
}

impl VersionStore {
    /// Create a new version store
    pub fn new(storage: Arc<RedbStorage>) -> Self {
        Self { storage }
    }

    /// Create or update the row for `(project, version)`.
    ///
    /// Identical content leaves the row untouched. Different content is
    /// handled according to `policy`; an overwrite keeps the star flag and
    /// resets the upload time.
    #[instrument(skip(self, now), fields(hash = %digest.short()))]
    pub fn upsert(
        &self,
        project: &str,
        version: &str,
        digest: Digest,
        size: u64,
        now: DateTime<Utc>,
        policy: OverwritePolicy,
    ) -> Result<UpsertOutcome, StorageError> {
        validate_identity(project, version)?;
        let key = version_key(project, version);

        let write_txn = self.storage.db().begin_write()?;
        let outcome = {
            let mut versions = write_txn.open_table(VERSIONS)?;
            let mut refs = write_txn.open_table(DIGEST_REFS)?;

            match read_record(&versions, &key)? {
                None => {
                    let record = VersionRecord::new(project, version, digest, size, now);
                    write_record(&mut versions, &mut refs, &record)?;
                    UpsertOutcome::Created
                }
                Some(existing) if existing.digest == digest => UpsertOutcome::Unchanged,
                Some(existing) => {
                    if policy == OverwritePolicy::Reject {
                        return Err(StorageError::conflict(format!(
                            "{project}/{version} already exists with different content"
                        )));
                    }

                    refs.remove(ref_key(&existing.digest, &key).as_slice())?;

                    let mut record = VersionRecord::new(project, version, digest, size, now);
                    record.starred = existing.starred;
                    write_record(&mut versions, &mut refs, &record)?;
                    UpsertOutcome::Replaced {
                        previous: existing.digest,
                    }
                }
            }
        };
        write_txn.commit()?;

        debug!(project, version, outcome = outcome.as_str(), "Upserted version");
        Ok(outcome)
    }

    /// Get a version record
    pub fn get(&self, project: &str, version: &str) -> Result<VersionRecord, StorageError> {
        validate_identity(project, version)?;
        match self.storage.get(VERSIONS, &version_key(project, version))? {
            Some(value) => decode(&value),
            None => Err(StorageError::not_found(format!("{project}/{version}"))),
        }
    }

    /// Set or clear the star flag. Setting the current value is a no-op.
    #[instrument(skip(self))]
    pub fn set_star(
        &self,
        project: &str,
        version: &str,
        starred: bool,
    ) -> Result<VersionRecord, StorageError> {
        validate_identity(project, version)?;
        let key = version_key(project, version);

        let write_txn = self.storage.db().begin_write()?;
        let record = {
            let mut versions = write_txn.open_table(VERSIONS)?;

            let mut record = read_record(&versions, &key)?
                .ok_or_else(|| StorageError::not_found(format!("{project}/{version}")))?;

            if record.starred != starred {
                record.starred = starred;
                let value = encode(&record)?;
                versions.insert(key.as_slice(), value.as_slice())?;
            }
            record
        };
        write_txn.commit()?;

        debug!(starred, "Updated star");
        Ok(record)
    }

    /// Delete a version row unconditionally
    pub fn delete(&self, project: &str, version: &str) -> Result<VersionRecord, StorageError> {
        validate_identity(project, version)?;
        let key = version_key(project, version);

        let write_txn = self.storage.db().begin_write()?;
        let record = {
            let mut versions = write_txn.open_table(VERSIONS)?;
            let mut refs = write_txn.open_table(DIGEST_REFS)?;

            let record = read_record(&versions, &key)?
                .ok_or_else(|| StorageError::not_found(format!("{project}/{version}")))?;
            remove_record(&mut versions, &mut refs, &record)?;
            record
        };
        write_txn.commit()?;

        debug!(project, version, "Deleted version");
        Ok(record)
    }

    /// Delete a version row only if it is still expired at `cutoff`.
    ///
    /// The check and the delete share one write transaction, so a star or
    /// re-upload that committed first wins and the row survives. Returns
    /// whether a row was deleted.
    pub fn delete_if_expired(
        &self,
        project: &str,
        version: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let key = version_key(project, version);

        let write_txn = self.storage.db().begin_write()?;
        let deleted = {
            let mut versions = write_txn.open_table(VERSIONS)?;
            let mut refs = write_txn.open_table(DIGEST_REFS)?;

            match read_record(&versions, &key)? {
                Some(record) if record.is_expired(cutoff) => {
                    remove_record(&mut versions, &mut refs, &record)?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;

        Ok(deleted)
    }

    /// All unstarred versions uploaded before `cutoff`
    pub fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<VersionRecord>, StorageError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|record| record.is_expired(cutoff))
            .collect())
    }

    /// Every digest referenced by at least one live version
    pub fn list_all_digests(&self) -> Result<HashSet<Digest>, StorageError> {
        let entries = self.storage.scan_prefix(DIGEST_REFS, &[])?;

        let mut digests = HashSet::new();
        for (key, _) in entries {
            digests.insert(digest_of_ref_key(&key)?);
        }
        Ok(digests)
    }

    /// Whether any live version references `digest`
    pub fn is_referenced(&self, digest: &Digest) -> Result<bool, StorageError> {
        self.storage.has_prefix(DIGEST_REFS, digest.as_bytes())
    }

    /// All project names, alphabetically
    pub fn list_projects(&self) -> Result<Vec<String>, StorageError> {
        let entries = self.storage.scan_prefix(VERSIONS, &[])?;

        let mut projects: Vec<String> = Vec::new();
        for (key, _) in entries {
            let end = key
                .iter()
                .position(|b| *b == KEY_SEPARATOR)
                .ok_or_else(|| StorageError::deserialization("malformed version key"))?;
            let project = String::from_utf8_lossy(&key[..end]);
            // Keys are sorted, so duplicates are adjacent
            if projects.last().map(String::as_str) != Some(&*project) {
                projects.push(project.into_owned());
            }
        }
        Ok(projects)
    }

    /// All versions of a project, newest first
    pub fn list_versions(&self, project: &str) -> Result<Vec<VersionRecord>, StorageError> {
        crate::naming::validate_name("project", project)?;

        let mut prefix = project.as_bytes().to_vec();
        prefix.push(KEY_SEPARATOR);

        let entries = self.storage.scan_prefix(VERSIONS, &prefix)?;
        if entries.is_empty() {
            return Err(StorageError::not_found(format!("project {project}")));
        }

        let mut records = entries
            .iter()
            .map(|(_, value)| decode(value))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| {
            b.created_at_millis
                .cmp(&a.created_at_millis)
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(records)
    }

    /// All version records
    pub fn all(&self) -> Result<Vec<VersionRecord>, StorageError> {
        self.storage
            .scan_prefix(VERSIONS, &[])?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }
}

type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

fn version_key(project: &str, version: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(project.len() + 1 + version.len());
    key.extend_from_slice(project.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(version.as_bytes());
    key
}

fn ref_key(digest: &Digest, version_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + version_key.len());
    key.extend_from_slice(digest.as_bytes());
    key.extend_from_slice(version_key);
    key
}

fn digest_of_ref_key(key: &[u8]) -> Result<Digest, StorageError> {
    let hash: [u8; 32] = key
        .get(..32)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| StorageError::deserialization("malformed digest reference"))?;
    Ok(Digest::new(hash))
}

fn encode(record: &VersionRecord) -> Result<Vec<u8>, StorageError> {
    postcard::to_allocvec(record).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode(value: &[u8]) -> Result<VersionRecord, StorageError> {
    postcard::from_bytes(value).map_err(|e| StorageError::Deserialization(e.to_string()))
}

fn read_record(
    versions: &BytesTable<'_>,
    key: &[u8],
) -> Result<Option<VersionRecord>, StorageError> {
    versions
        .get(key)?
        .map(|value| decode(value.value()))
        .transpose()
}

fn write_record(
    versions: &mut BytesTable<'_>,
    refs: &mut BytesTable<'_>,
    record: &VersionRecord,
) -> Result<(), StorageError> {
    let key = record.key();
    let value = encode(record)?;
    versions.insert(key.as_slice(), value.as_slice())?;
    refs.insert(ref_key(&record.digest, &key).as_slice(), EMPTY)?;
    Ok(())
}

fn remove_record(
    versions: &mut BytesTable<'_>,
    refs: &mut BytesTable<'_>,
    record: &VersionRecord,
) -> Result<(), StorageError> {
    let key = record.key();
    versions.remove(key.as_slice())?;
    refs.remove(ref_key(&record.digest, &key).as_slice())?;
    Ok(())
}
