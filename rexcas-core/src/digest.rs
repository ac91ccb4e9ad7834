//! Content digests
//!
//! A digest identifies a blob by its Blake3 hash and its byte length.
//! The canonical text form is `<hex hash>/<size>`, which is what gets logged,
//! persisted and exchanged with the remote store.

use crate::error::{CasError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Length of the raw hash in bytes
pub const HASH_LEN: usize = 32;

/// Length of the hex-encoded hash in the canonical text form
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

/// Content identity of a blob or serialized directory node.
///
/// Ordering is by hash, then by size, so sorted digest lists are stable
/// across processes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    hash: [u8; HASH_LEN],
    size: u64,
}

impl Digest {
    /// Create a digest from its raw parts
    pub fn new(hash: [u8; HASH_LEN], size: u64) -> Self {
        Self { hash, size }
    }

    /// Compute the digest of in-memory content
    pub fn from_content(data: &[u8]) -> Self {
        Self {
            hash: *blake3::hash(data).as_bytes(),
            size: data.len() as u64,
        }
    }

    /// The digest of the empty blob
    pub fn empty() -> Self {
        Self::from_content(&[])
    }

    /// Hash a file on disk.
    ///
    /// Large files are memory-mapped and hashed on the rayon pool.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut hasher = blake3::Hasher::new();
        hasher
            .update_mmap_rayon(path)
            .map_err(|e| CasError::unreadable(path, e))?;
        Ok(Self {
            hash: *hasher.finalize().as_bytes(),
            size: hasher.count(),
        })
    }

    /// Hash everything a reader yields
    pub fn from_reader(reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(reader)?;
        Ok(Self {
            hash: *hasher.finalize().as_bytes(),
            size: hasher.count(),
        })
    }

    /// Parse the canonical `<hash>/<size>` form
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = |reason: &str| CasError::MalformedDigest {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (hash_part, size_part) = s
            .split_once('/')
            .ok_or_else(|| malformed("expected <hash>/<size>"))?;

        if hash_part.len() != HASH_HEX_LEN {
            return Err(malformed(&format!(
                "hash must be {} hex characters, got {}",
                HASH_HEX_LEN,
                hash_part.len()
            )));
        }
        let hash = blake3::Hash::from_hex(hash_part).map_err(|e| malformed(&e.to_string()))?;

        if size_part.is_empty() || !size_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("size must be a non-negative integer"));
        }
        let size = size_part
            .parse::<u64>()
            .map_err(|e| malformed(&e.to_string()))?;

        Ok(Self {
            hash: *hash.as_bytes(),
            size,
        })
    }

    /// Get the raw hash bytes
    pub fn hash_bytes(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    /// Hex-encoded hash
    pub fn hash_hex(&self) -> String {
        blake3::Hash::from_bytes(self.hash).to_hex().to_string()
    }

    /// Blob size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Zero-size digests denote the empty blob, which is always present.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Check that `data` has this digest
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::from_content(data) == *self
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}/{})", &self.hash_hex()[..16], self.size)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash_hex(), self.size)
    }
}

impl FromStr for Digest {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_digest_text_roundtrip() {
        let digest = Digest::from_content(b"hello world");
        let text = digest.to_string();
        assert_eq!(text.len(), HASH_HEX_LEN + 1 + 2);
        assert!(text.ends_with("/11"));

        let parsed: Digest = text.parse().unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn test_same_content_same_digest() {
        assert_eq!(
            Digest::from_content(b"abc"),
            Digest::from_content(b"abc")
        );
        assert_ne!(
            Digest::from_content(b"abc"),
            Digest::from_content(b"abd")
        );
    }

    #[test]
    fn test_empty_digest() {
        let empty = Digest::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.size(), 0);
        assert_eq!(empty, Digest::from_content(b""));
        assert!(!Digest::from_content(b"x").is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let hex = Digest::from_content(b"x").hash_hex();
        for bad in [
            "",
            "nohash",
            &format!("{}", hex),
            &format!("{}/", hex),
            &format!("{}/-1", hex),
            &format!("{}/+1", hex),
            &format!("{}/12a", hex),
            &format!("{}/1", &hex[..10]),
            &format!("{}zz/1", &hex[..62]),
        ] {
            let result = Digest::parse(bad);
            assert!(
                matches!(result, Err(CasError::MalformedDigest { .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_ordering_hash_then_size() {
        let a = Digest::new([1u8; HASH_LEN], 100);
        let b = Digest::new([1u8; HASH_LEN], 200);
        let c = Digest::new([2u8; HASH_LEN], 1);
        let mut digests = vec![c, b, a];
        digests.sort();
        assert_eq!(digests, vec![a, b, c]);
    }

    #[test]
    fn test_from_file_matches_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let from_file = Digest::from_file(file.path()).unwrap();
        assert_eq!(from_file, Digest::from_content(&data));

        let from_reader = Digest::from_reader(&data[..]).unwrap();
        assert_eq!(from_reader, from_file);
    }

    #[test]
    fn test_from_file_missing() {
        let result = Digest::from_file("/nonexistent/rexcas/file");
        assert!(matches!(result, Err(CasError::FileUnreadable { .. })));
    }

    #[test]
    fn test_bincode_roundtrip_preserves_identity() {
        let digest = Digest::from_content(b"persist me");
        let bytes = bincode::serialize(&digest).unwrap();
        let back: Digest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, digest);
    }
}
