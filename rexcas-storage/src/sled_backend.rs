//! Sled-backed persistent store
//!
//! Holds two namespaces: `file_digests` for file metadata cache entries and
//! `blobs` for the loopback CAS. Values are bincode-encoded.

use crate::backend::{BlobStore, CacheStore, StoreStats};
use crate::filemeta::CacheEntry;
use crate::StoreConfig;
use bytes::Bytes;
use rexcas_core::error::{CasError, Result};
use rexcas_core::Digest;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const FILE_DIGESTS_TREE: &str = "file_digests";
const BLOBS_TREE: &str = "blobs";

/// Cache entry as persisted; the path travels with the value so keys can
/// stay raw OS bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    path: PathBuf,
    entry: CacheEntry,
}

/// Sled-based store for cache entries and blobs
pub struct SledStore {
    db: sled::Db,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl SledStore {
    /// Open or create a store at `path` with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(&StoreConfig::new(path.as_ref()))
    }

    /// Open or create a store
    pub fn with_config(config: &StoreConfig) -> Result<Self> {
        info!(path = ?config.path, "Opening Sled store");

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .flush_every_ms(config.flush_every_ms)
            .open()
            .map_err(|e| CasError::Storage(format!("Failed to open Sled: {}", e)))?;

        Ok(Self::from_db(db))
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| CasError::Storage(format!("Failed to open Sled: {}", e)))?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        Self {
            db,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Get a tree (namespace) for storing data
    fn tree(&self, name: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| CasError::Storage(e.to_string()))
    }

    /// Store a serializable value
    fn put_value<K: AsRef<[u8]>, V: Serialize>(&self, tree: &sled::Tree, key: K, value: &V) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        tree.insert(key, encoded)
            .map_err(|e| CasError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a deserializable value
    fn get_value<K: AsRef<[u8]>, V: DeserializeOwned>(&self, tree: &sled::Tree, key: K) -> Result<Option<V>> {
        match tree.get(key).map_err(|e| CasError::Storage(e.to_string()))? {
            Some(bytes) => {
                let value: V = bincode::deserialize(&bytes)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Look up one persisted cache entry
    pub fn get_entry(&self, path: &Path) -> Result<Option<CacheEntry>> {
        let tree = self.tree(FILE_DIGESTS_TREE)?;
        let persisted: Option<PersistedEntry> = self.get_value(&tree, path_key(path))?;
        Ok(persisted.map(|p| p.entry))
    }

    /// Get database size estimate
    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

fn path_key(path: &Path) -> &[u8] {
    path.as_os_str().as_encoded_bytes()
}

fn blob_key(digest: &Digest) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(digest.hash_bytes());
    key[32..].copy_from_slice(&digest.size().to_be_bytes());
    key
}

// ===== File Digest Cache =====

impl CacheStore for SledStore {
    fn load_entries(&self) -> Result<Vec<(PathBuf, CacheEntry)>> {
        let tree = self.tree(FILE_DIGESTS_TREE)?;
        let mut entries = Vec::with_capacity(tree.len());

        for item in tree.iter() {
            let (_, value) = item.map_err(|e| CasError::Storage(e.to_string()))?;
            let persisted: PersistedEntry = bincode::deserialize(&value)?;
            entries.push((persisted.path, persisted.entry));
        }

        debug!(count = entries.len(), "Loaded persisted file digests");
        Ok(entries)
    }

    fn put_entry(&self, path: &Path, entry: &CacheEntry) -> Result<()> {
        let tree = self.tree(FILE_DIGESTS_TREE)?;
        let persisted = PersistedEntry {
            path: path.to_path_buf(),
            entry: *entry,
        };
        self.put_value(&tree, path_key(path), &persisted)
    }

    fn remove_entry(&self, path: &Path) -> Result<bool> {
        let tree = self.tree(FILE_DIGESTS_TREE)?;
        let removed = tree
            .remove(path_key(path))
            .map_err(|e| CasError::Storage(e.to_string()))?;
        Ok(removed.is_some())
    }

    fn clear_entries(&self) -> Result<()> {
        let tree = self.tree(FILE_DIGESTS_TREE)?;
        tree.clear().map_err(|e| CasError::Storage(e.to_string()))
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| CasError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ===== Blob Storage =====

impl BlobStore for SledStore {
    fn put(&self, digest: Digest, data: Bytes) -> Result<()> {
        let tree = self.tree(BLOBS_TREE)?;
        let previous = tree
            .insert(blob_key(&digest), data.as_ref())
            .map_err(|e| CasError::Storage(e.to_string()))?;
        if previous.is_none() {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn get(&self, digest: &Digest) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tree = self.tree(BLOBS_TREE)?;
        let value = tree
            .get(blob_key(digest))
            .map_err(|e| CasError::Storage(e.to_string()))?;
        Ok(value.map(|v| Bytes::copy_from_slice(&v)))
    }

    fn contains(&self, digest: &Digest) -> Result<bool> {
        let tree = self.tree(BLOBS_TREE)?;
        tree.contains_key(blob_key(digest))
            .map_err(|e| CasError::Storage(e.to_string()))
    }

    fn stats(&self) -> Result<StoreStats> {
        let tree = self.tree(BLOBS_TREE)?;
        let mut bytes_used = 0u64;
        for item in tree.iter() {
            let (_, value) = item.map_err(|e| CasError::Storage(e.to_string()))?;
            bytes_used += value.len() as u64;
        }
        Ok(StoreStats {
            blob_count: tree.len() as u64,
            bytes_used,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        CacheStore::flush(self)
    }
}
