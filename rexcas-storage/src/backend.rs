//! Storage traits
//!
//! Defines the interfaces the cache and the loopback store persist through.

use crate::filemeta::CacheEntry;
use bytes::Bytes;
use rexcas_core::error::Result;
use rexcas_core::Digest;
use std::path::{Path, PathBuf};

/// Blob store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of blobs stored
    pub blob_count: u64,

    /// Total bytes used by blobs
    pub bytes_used: u64,

    /// Number of read operations
    pub reads: u64,

    /// Number of write operations
    pub writes: u64,
}

/// Content-addressed blob storage
///
/// Implementations must be Send + Sync for use behind async RPC handlers.
pub trait BlobStore: Send + Sync {
    /// Store a blob. Storing an existing digest again is a no-op.
    fn put(&self, digest: Digest, data: Bytes) -> Result<()>;

    /// Retrieve a blob
    fn get(&self, digest: &Digest) -> Result<Option<Bytes>>;

    /// Check if a blob exists
    fn contains(&self, digest: &Digest) -> Result<bool>;

    /// Get store statistics
    fn stats(&self) -> Result<StoreStats>;

    /// Flush any pending writes
    fn flush(&self) -> Result<()>;
}

/// Persistence for file metadata cache entries, keyed by absolute path
pub trait CacheStore: Send + Sync {
    /// Load every persisted entry
    fn load_entries(&self) -> Result<Vec<(PathBuf, CacheEntry)>>;

    /// Insert or overwrite an entry
    fn put_entry(&self, path: &Path, entry: &CacheEntry) -> Result<()>;

    /// Remove an entry; returns whether one existed
    fn remove_entry(&self, path: &Path) -> Result<bool>;

    /// Remove every entry
    fn clear_entries(&self) -> Result<()>;

    /// Flush any pending writes
    fn flush(&self) -> Result<()>;
}
