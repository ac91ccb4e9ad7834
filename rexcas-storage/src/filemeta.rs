//! File metadata cache
//!
//! Maps a local path to its last known digest plus a [`Validator`]
//! (size, modification time, mode). A cached digest is served only while the
//! file's current validator matches the stored one; anything else is a miss
//! and the file is hashed again.
//!
//! Concurrent misses on the same path may both hash the file. The last
//! writer wins, which is harmless because hashing is idempotent.

use crate::backend::CacheStore;
use parking_lot::RwLock;
use rexcas_core::error::{CasError, Result};
use rexcas_core::Digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Filesystem signature a cache entry is valid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Validator {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    /// Permission bits (and file type bits on unix)
    pub mode: u32,
}

impl Validator {
    /// Observe the current signature of `path`, following symlinks
    pub fn observe(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| CasError::unreadable(path, e))?;
        if !meta.is_file() {
            return Err(CasError::unreadable(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        Ok(Self::from_metadata(&meta))
    }

    #[cfg(unix)]
    pub fn from_metadata(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            size: meta.len(),
            mtime_secs: meta.mtime(),
            mtime_nanos: meta.mtime_nsec() as u32,
            mode: meta.mode(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &Metadata) -> Self {
        use std::time::UNIX_EPOCH;
        let (mtime_secs, mtime_nanos) = match meta.modified().map(|t| t.duration_since(UNIX_EPOCH)) {
            Ok(Ok(d)) => (d.as_secs() as i64, d.subsec_nanos()),
            Ok(Err(e)) => (-(e.duration().as_secs() as i64), e.duration().subsec_nanos()),
            Err(_) => (0, 0),
        };
        Self {
            size: meta.len(),
            mtime_secs,
            mtime_nanos,
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
        }
    }

    /// Any execute bit set
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Cached identity of a local file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub digest: Digest,
    pub validator: Validator,
}

impl CacheEntry {
    pub fn is_executable(&self) -> bool {
        self.validator.is_executable()
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Number of times a file was actually hashed
    pub computes: u64,
    pub entries: u64,
}

/// Anything that can answer "what is this file's digest"
pub trait MetadataCache: Send + Sync {
    /// Digest and signature of `path`, from cache when still valid
    fn compute_or_get_entry(&self, path: &Path) -> Result<CacheEntry>;

    fn compute_or_get(&self, path: &Path) -> Result<Digest> {
        self.compute_or_get_entry(path).map(|e| e.digest)
    }
}

/// Hash `path`, failing if it changed while being read
fn hash_file(path: &Path) -> Result<CacheEntry> {
    let before = Validator::observe(path)?;
    let digest = Digest::from_file(path)?;
    let after = Validator::observe(path)?;

    if before != after || digest.size() != before.size {
        return Err(CasError::unreadable(
            path,
            io::Error::new(io::ErrorKind::Interrupted, "file changed while hashing"),
        ));
    }
    Ok(CacheEntry {
        digest,
        validator: before,
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| CasError::unreadable(path, e))
}

/// Validated, optionally persisted file digest cache
pub struct FileMetadataCache {
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    store: Option<Arc<dyn CacheStore>>,
    hits: AtomicU64,
    misses: AtomicU64,
    computes: AtomicU64,
}

impl FileMetadataCache {
    /// Create an in-memory cache
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            computes: AtomicU64::new(0),
        }
    }

    /// Create a cache persisted through `store`, preloading its entries.
    ///
    /// Loaded entries are still validated on every lookup.
    pub fn with_store(store: Arc<dyn CacheStore>) -> Result<Self> {
        let loaded = store.load_entries()?;
        debug!(count = loaded.len(), "Preloaded file metadata cache");

        let mut cache = Self::new();
        cache.entries = RwLock::new(loaded.into_iter().collect());
        cache.store = Some(store);
        Ok(cache)
    }

    /// Cached digest of `path` if its current signature still matches.
    ///
    /// A file that cannot be observed is a miss.
    pub fn get(&self, path: &Path) -> Option<Digest> {
        let path = absolute(path).ok()?;
        let current = Validator::observe(&path).ok()?;
        self.lookup(&path, &current).map(|e| e.digest)
    }

    fn lookup(&self, path: &Path, current: &Validator) -> Option<CacheEntry> {
        let entry = *self.entries.read().get(path)?;
        if entry.validator == *current {
            Some(entry)
        } else {
            trace!(path = ?path, "Cached validator is stale");
            None
        }
    }

    /// Insert or overwrite the entry for `path`
    pub fn put(&self, path: &Path, digest: Digest, validator: Validator) {
        let path = match absolute(path) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = ?path, error = %e, "Cannot cache entry for unresolvable path");
                return;
            }
        };
        let entry = CacheEntry { digest, validator };
        self.entries.write().insert(path.clone(), entry);

        if let Some(store) = &self.store {
            if let Err(e) = store.put_entry(&path, &entry) {
                warn!(path = ?path, error = %e, "Failed to persist cache entry");
            }
        }
    }

    /// Drop the entry for `path`; returns whether there was one
    pub fn evict(&self, path: &Path) -> bool {
        let Ok(path) = absolute(path) else {
            return false;
        };
        let removed = self.entries.write().remove(&path).is_some();

        if let Some(store) = &self.store {
            if let Err(e) = store.remove_entry(&path) {
                warn!(path = ?path, error = %e, "Failed to evict persisted cache entry");
            }
        }
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.write().clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_entries() {
                warn!(error = %e, "Failed to clear persisted cache entries");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computes: self.computes.load(Ordering::Relaxed),
            entries: self.len() as u64,
        }
    }

    /// Flush the backing store, if any
    pub fn flush(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.flush(),
            None => Ok(()),
        }
    }
}

impl Default for FileMetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCache for FileMetadataCache {
    fn compute_or_get_entry(&self, path: &Path) -> Result<CacheEntry> {
        let path = absolute(path)?;
        let current = Validator::observe(&path)?;

        if let Some(entry) = self.lookup(&path, &current) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // No lock held while hashing
        let entry = hash_file(&path)?;
        self.computes.fetch_add(1, Ordering::Relaxed);
        trace!(path = ?path, digest = %entry.digest, "Hashed file");

        self.put(&path, entry.digest, entry.validator);
        Ok(entry)
    }
}

/// Cache that never caches: every call hashes the file
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl MetadataCache for NoopCache {
    fn compute_or_get_entry(&self, path: &Path) -> Result<CacheEntry> {
        hash_file(path)
    }
}
