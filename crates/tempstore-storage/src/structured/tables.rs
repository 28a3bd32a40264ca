//! redb table definitions and storage manager
//!
//! Defines all tables used for version metadata.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, instrument};

use crate::error::StorageError;

/// Type alias for scan results to simplify complex type
pub type ScanResults = Vec<(Vec<u8>, Vec<u8>)>;

// Table definitions
// Key: project bytes ++ 0x00 ++ version bytes, Value: serialized VersionRecord
pub const VERSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("versions");

// Key: digest (32 bytes) ++ version key, Value: empty
// Reverse index answering "is this blob still referenced?"
pub const DIGEST_REFS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("digest_refs");

/// Configuration for redb storage
#[derive(Debug, Clone)]
pub struct RedbStorageConfig {
    /// Path to the database file
    pub db_path: PathBuf,
}

impl Default for RedbStorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/tempstore.redb"),
        }
    }
}

/// Main redb storage manager
pub struct RedbStorage {
    db: Arc<Database>,
    config: RedbStorageConfig,
}

impl fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbStorage")
            .field("db_path", &self.config.db_path)
            .finish_non_exhaustive()
    }
}

impl RedbStorage {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbStorageConfig) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&config.db_path)?;

        info!("Opened redb database");

        let storage = Self {
            db: Arc::new(db),
            config,
        };

        // Initialize tables
        storage.init_tables()?;

        Ok(storage)
    }

    /// Create tables that do not exist yet
    fn init_tables(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;

        write_txn.open_table(VERSIONS)?;
        write_txn.open_table(DIGEST_REFS)?;

        write_txn.commit()?;

        debug!("Initialized redb tables");
        Ok(())
    }

    /// Get a reference to the database
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Get a value from a table
    pub fn get(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let value = table.get(key)?.map(|v| v.value().to_vec());

        Ok(value)
    }

    /// Iterate over all entries in a table with a prefix
    pub fn scan_prefix(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        prefix: &[u8],
    ) -> Result<ScanResults, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let mut results = Vec::new();

        // Use range to get all keys >= prefix
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key_bytes = key.value();

            // Stop when we're past the prefix
            if !key_bytes.starts_with(prefix) {
                break;
            }

            results.push((key_bytes.to_vec(), value.value().to_vec()));
        }

        Ok(results)
    }

    /// Whether any key in the table starts with `prefix`
    pub fn has_prefix(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        prefix: &[u8],
    ) -> Result<bool, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let found = match table.range(prefix..)?.next() {
            Some(entry) => entry?.0.value().starts_with(prefix),
            None => false,
        };
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (RedbStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = RedbStorageConfig {
            db_path: temp_dir.path().join("db").join("test.redb"),
        };
        let storage = RedbStorage::open(config).unwrap();
        (storage, temp_dir)
    }

    fn put(storage: &RedbStorage, key: &[u8], value: &[u8]) {
        let write_txn = storage.db().begin_write().unwrap();
        {
            let mut table = write_txn.open_table(VERSIONS).unwrap();
            table.insert(key, value).unwrap();
        }
        write_txn.commit().unwrap();
    }

    #[test]
    fn test_get() {
        let (storage, _temp) = create_test_storage();

        put(&storage, b"svc\x001.0", b"row");

        let retrieved = storage.get(VERSIONS, b"svc\x001.0").unwrap();
        assert_eq!(retrieved, Some(b"row".to_vec()));
        assert!(storage.get(VERSIONS, b"svc\x002.0").unwrap().is_none());
    }

    #[test]
    fn test_scan_prefix() {
        let (storage, _temp) = create_test_storage();

        put(&storage, b"api\x001.0", b"a");
        put(&storage, b"api\x001.1", b"b");
        put(&storage, b"api-gateway\x001.0", b"c");
        put(&storage, b"web\x002.0", b"d");

        // The separator keeps "api" from matching "api-gateway"
        assert_eq!(storage.scan_prefix(VERSIONS, b"api\x00").unwrap().len(), 2);
        assert_eq!(storage.scan_prefix(VERSIONS, b"web\x00").unwrap().len(), 1);
        assert_eq!(storage.scan_prefix(VERSIONS, &[]).unwrap().len(), 4);

        assert!(storage.has_prefix(VERSIONS, b"api-gateway\x00").unwrap());
        assert!(!storage.has_prefix(VERSIONS, b"zzz\x00").unwrap());
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let config = RedbStorageConfig {
            db_path: temp_dir.path().join("test.redb"),
        };

        {
            let storage = RedbStorage::open(config.clone()).unwrap();
            put(&storage, b"svc\x001.0", b"row");
        }

        let storage = RedbStorage::open(config).unwrap();
        assert!(storage.get(VERSIONS, b"svc\x001.0").unwrap().is_some());
    }
}
