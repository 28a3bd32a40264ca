//! Structured storage using redb
//!
//! This module provides queryable, mutable storage for version metadata:
//! - One row per `(project, version)` with digest, upload time and star flag
//! - A digest → version reverse index used by blob garbage collection
//!
//! Unlike the blob store, rows are updated and deleted in place.

mod tables;
pub mod version_store;

pub use tables::{RedbStorage, RedbStorageConfig};
pub use version_store::{OverwritePolicy, UpsertOutcome, VersionRecord, VersionStore};
