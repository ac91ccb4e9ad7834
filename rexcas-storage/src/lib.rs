//! rexcas Storage
//!
//! Local state for the transfer engine:
//! - `FileMetadataCache` answering "what is this file's digest" without
//!   rehashing unchanged files
//! - `CacheStore` / `BlobStore` traits for persistence
//! - `MemoryBlobStore` for testing
//! - `SledStore` persisting cache entries and blobs on disk

pub mod backend;
pub mod filemeta;
pub mod memory;
pub mod sled_backend;

pub use backend::{BlobStore, CacheStore, StoreStats};
pub use filemeta::{CacheEntry, CacheStats, FileMetadataCache, MetadataCache, NoopCache, Validator};
pub use memory::MemoryBlobStore;
pub use sled_backend::SledStore;

/// On-disk store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the store directory
    pub path: std::path::PathBuf,

    /// Sled page cache size in bytes
    pub cache_capacity: u64,

    /// Background flush interval in milliseconds (None = flush only on demand)
    pub flush_every_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("./rexcas_data"),
            cache_capacity: 64 * 1024 * 1024, // 64 MB
            flush_every_ms: Some(500),
        }
    }
}

impl StoreConfig {
    /// Create a new store config with the given path
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set cache size
    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Set flush interval
    pub fn with_flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
}
