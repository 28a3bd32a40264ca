//! Server configuration
//!
//! Loaded from an optional TOML file; every field has a default, so an
//! empty file (or none at all) gives a working local setup.
//!
//! ```toml
//! data_dir = "/var/lib/tempstore"
//! bind_addr = "0.0.0.0:8080"
//! retention_days = 30
//! overwrite_policy = "reject"
//! sweep_interval_secs = 3600
//! admin_token = "secret"
//! ```

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tempstore_storage::service::DEFAULT_RETENTION_DAYS;
use tempstore_storage::sweeper::DEFAULT_BLOB_GRACE_SECS;
use tempstore_storage::{OverwritePolicy, ServiceConfig, StorageConfig, SweeperConfig};
use thiserror::Error;

/// Longest accepted retention window, about a century
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Longest accepted blob grace window (one week)
pub const MAX_BLOB_GRACE_SECS: i64 = 7 * 24 * 3600;

/// Longest accepted sweep interval (one year)
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 365 * 24 * 3600;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempstoreConfig {
    /// Root of the blob store and metadata database
    pub data_dir: PathBuf,
    /// Listen address for `serve`
    pub bind_addr: String,
    /// Unstarred versions are expired after this many days
    pub retention_days: i64,
    /// Minimum age of an unreferenced blob before it is collected
    pub blob_grace_secs: i64,
    /// Largest accepted upload in bytes
    pub max_blob_size: u64,
    pub overwrite_policy: OverwritePolicy,
    /// Run the sweeper periodically while serving
    pub sweep_interval_secs: Option<u64>,
    /// Bearer token required for star, unstar and cleanup over HTTP
    pub admin_token: Option<String>,
    /// Default log filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for TempstoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8080".to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            blob_grace_secs: DEFAULT_BLOB_GRACE_SECS,
            max_blob_size: 4 * 1024 * 1024 * 1024,
            overwrite_policy: OverwritePolicy::default(),
            sweep_interval_secs: None,
            admin_token: None,
            log_level: "info".to_string(),
        }
    }
}

impl TempstoreConfig {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            return Err(ConfigError::Invalid(format!(
                "retention_days must be between 1 and {MAX_RETENTION_DAYS}, got {}",
                self.retention_days
            )));
        }
        if !(0..=MAX_BLOB_GRACE_SECS).contains(&self.blob_grace_secs) {
            return Err(ConfigError::Invalid(format!(
                "blob_grace_secs must be between 0 and {MAX_BLOB_GRACE_SECS}, got {}",
                self.blob_grace_secs
            )));
        }
        if self.max_blob_size == 0 {
            return Err(ConfigError::Invalid("max_blob_size must be positive".into()));
        }
        if let Some(secs) = self.sweep_interval_secs
            && !(1..=MAX_SWEEP_INTERVAL_SECS).contains(&secs)
        {
            return Err(ConfigError::Invalid(format!(
                "sweep_interval_secs must be between 1 and {MAX_SWEEP_INTERVAL_SECS}, got {secs}"
            )));
        }
        if self.admin_token.as_deref() == Some("") {
            return Err(ConfigError::Invalid("admin_token must not be empty".into()));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::days(self.retention_days)
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::with_base_dir(&self.data_dir).with_max_blob_size(self.max_blob_size)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            overwrite_policy: self.overwrite_policy,
            retention: self.retention(),
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            retention: self.retention(),
            blob_grace: Duration::seconds(self.blob_grace_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = TempstoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retention(), Duration::days(30));
        assert_eq!(config.sweeper_config().blob_grace, Duration::seconds(60));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tempstore.toml");
        std::fs::write(
            &path,
            "retention_days = 7\noverwrite_policy = \"reject\"\nadmin_token = \"s3cret\"\n",
        )
        .unwrap();

        let config = TempstoreConfig::from_file(&path).unwrap();
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.overwrite_policy, OverwritePolicy::Reject);
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.service_config().retention, Duration::days(7));
    }

    #[test]
    fn test_rejects_bad_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tempstore.toml");

        std::fs::write(&path, "retention_days = 0\n").unwrap();
        assert!(matches!(
            TempstoreConfig::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "overwrite_policy = \"sometimes\"\n").unwrap();
        assert!(matches!(
            TempstoreConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_windows() {
        let config = TempstoreConfig {
            retention_days: 100_000_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = TempstoreConfig {
            retention_days: MAX_RETENTION_DAYS,
            ..Default::default()
        };
        config.validate().unwrap();

        let config = TempstoreConfig {
            blob_grace_secs: i64::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = TempstoreConfig {
            sweep_interval_secs: Some(u64::MAX),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = TempstoreConfig::from_file("/nonexistent/tempstore.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
