//! Content-addressed blob storage
//!
//! This module provides the content store: immutable artifact bytes keyed
//! by their digest, written once and shared by every version that uploads
//! the same content.
//!
//! Uses BLAKE3 for hashing and file-based storage.

mod digest;
mod store;

pub use digest::{Digest, HashingWriter};
pub use store::{BlobInfo, BlobReader, BlobStore, BlobStoreConfig, StagedBlob};
