//! # Tempstore Storage
//!
//! Artifact lifecycle and content-addressed storage engine for Tempstore.
//!
//! Artifacts are uploaded under a `(project, version)` identity, kept for a
//! retention window, and optionally starred to keep them forever.
//!
//! ## Features
//!
//! - **BlobStore**: content-addressed, write-once blob files keyed by BLAKE3 digest
//! - **VersionStore**: transactional version metadata in redb
//! - **ArtifactService**: upload, download, star and listing
//! - **Sweeper**: expires old versions and collects orphaned blobs
//!
//! ## Example
//!
//! ```rust,ignore
//! use tempstore_storage::{ArtifactService, ServiceConfig, Storage, StorageConfig, Sweeper, SweeperConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = Storage::open(StorageConfig::with_base_dir("./data")).await.unwrap();
//!     let service = ArtifactService::new(storage.clone(), ServiceConfig::default());
//!
//!     let receipt = service.put("svc", "1.0", &b"artifact bytes"[..]).await.unwrap();
//!     service.star("svc", "1.0").unwrap();
//!
//!     let sweeper = Sweeper::new(storage, SweeperConfig::default());
//!     let report = sweeper.sweep().await.unwrap();
//!     println!("{receipt:?}: {report}");
//! }
//! ```

pub mod blobs;
pub mod error;
pub mod expiry;
mod locks;
pub mod naming;
pub mod service;
pub mod storage;
pub mod structured;
pub mod sweeper;

// Re-exports
pub use blobs::{BlobInfo, BlobReader, BlobStore, BlobStoreConfig, Digest};
pub use error::StorageError;
pub use service::{ArtifactService, PutReceipt, ServiceConfig, VersionSummary};
pub use storage::{Storage, StorageConfig};
pub use structured::{OverwritePolicy, UpsertOutcome, VersionRecord, VersionStore};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig};
