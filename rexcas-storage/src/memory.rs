//! In-memory blob store
//!
//! Used for testing and the loopback CAS. Not persistent.

use crate::backend::{BlobStore, StoreStats};
use bytes::Bytes;
use parking_lot::RwLock;
use rexcas_core::error::{CasError, Result};
use rexcas_core::Digest;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory blob store
pub struct MemoryBlobStore {
    /// Blob storage
    blobs: RwLock<HashMap<Digest, Bytes>>,

    /// Maximum capacity (0 = unlimited)
    max_capacity: u64,

    /// Current bytes used
    bytes_used: AtomicU64,

    /// Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBlobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create with a maximum capacity
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            max_capacity: max_bytes,
            bytes_used: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Clear all stored blobs
    pub fn clear(&self) {
        let mut blobs = self.blobs.write();
        blobs.clear();
        self.bytes_used.store(0, Ordering::SeqCst);
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, digest: Digest, data: Bytes) -> Result<()> {
        let data_len = data.len() as u64;
        let mut blobs = self.blobs.write();

        if blobs.contains_key(&digest) {
            return Ok(());
        }

        // Check capacity
        if self.max_capacity > 0 {
            let current = self.bytes_used.load(Ordering::SeqCst);
            if current + data_len > self.max_capacity {
                return Err(CasError::Storage(format!(
                    "store full: {} of {} bytes used",
                    current, self.max_capacity
                )));
            }
        }

        blobs.insert(digest, data);
        self.bytes_used.fetch_add(data_len, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn get(&self, digest: &Digest) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let blobs = self.blobs.read();
        Ok(blobs.get(digest).cloned())
    }

    fn contains(&self, digest: &Digest) -> Result<bool> {
        let blobs = self.blobs.read();
        Ok(blobs.contains_key(digest))
    }

    fn stats(&self) -> Result<StoreStats> {
        let blobs = self.blobs.read();
        Ok(StoreStats {
            blob_count: blobs.len() as u64,
            bytes_used: self.bytes_used.load(Ordering::SeqCst),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        // No-op for in-memory storage
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"hello world");
        let digest = Digest::from_content(&data);

        store.put(digest, data.clone()).unwrap();
        let retrieved = store.get(&digest).unwrap().unwrap();
        assert_eq!(retrieved, data);
        assert!(store.contains(&digest).unwrap());
        assert!(!store.contains(&Digest::from_content(b"other")).unwrap());
    }

    #[test]
    fn test_duplicate_put_is_noop() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"same");
        let digest = Digest::from_content(&data);

        store.put(digest, data.clone()).unwrap();
        store.put(digest, data).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.bytes_used, 4);
        assert_eq!(stats.writes, 1);
    }

    #[test]
    fn test_capacity_limit() {
        let store = MemoryBlobStore::with_capacity(100);

        let first = Bytes::from(vec![1u8; 50]);
        let second = Bytes::from(vec![2u8; 50]);
        store.put(Digest::from_content(&first), first).unwrap();
        store.put(Digest::from_content(&second), second).unwrap();

        // This should fail (would exceed 100)
        let third = Bytes::from(vec![3u8; 1]);
        let result = store.put(Digest::from_content(&third), third);
        assert!(matches!(result, Err(CasError::Storage(_))));
    }

    #[test]
    fn test_stats_and_clear() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from(vec![0u8; 100]);
        let digest = Digest::from_content(&data);

        store.put(digest, data).unwrap();
        store.get(&digest).unwrap();
        store.get(&digest).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.bytes_used, 100);
        assert_eq!(stats.reads, 2);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.stats().unwrap().bytes_used, 0);
    }
}
