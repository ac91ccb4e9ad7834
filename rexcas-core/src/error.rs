//! Error types for rexcas
//!
//! Provides a unified error type for digest, chunking and tree operations.

use crate::digest::Digest;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for rexcas core operations
pub type Result<T> = std::result::Result<T, CasError>;

/// Unified error type for rexcas core
#[derive(Error, Debug)]
pub enum CasError {
    // ===== Digest Errors =====
    #[error("Malformed digest {input:?}: {reason}")]
    MalformedDigest { input: String, reason: String },

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    // ===== Configuration Errors =====
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Chunk Errors =====
    #[error("Cannot seek to offset {offset}: {reason}")]
    Seek { offset: u64, reason: String },

    #[error("Chunker exhausted after {total_size} bytes")]
    ChunkerExhausted { total_size: u64 },

    #[error("Out-of-order chunk: expected offset {expected}, got {actual}")]
    OutOfOrderChunk { expected: u64, actual: u64 },

    #[error("Incomplete blob: expected {expected} bytes, got {actual}")]
    IncompleteBlob { expected: u64, actual: u64 },

    #[error("Chunk overruns blob: {end} bytes written past declared size {expected}")]
    BlobOverflow { end: u64, expected: u64 },

    // ===== Local File Errors =====
    #[error("File unreadable: {path}: {source}")]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ===== Tree Errors =====
    #[error("Directory node not found: {0}")]
    MissingNode(Digest),

    #[error("Directory tree deeper than {max} levels")]
    TreeTooDeep { max: usize },

    #[error("Duplicate entry name {0:?} in directory node")]
    DuplicateName(String),

    #[error("Invalid entry name {0:?}")]
    InvalidName(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CasError {
    /// Wrap an I/O error with the path it happened on.
    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CasError::FileUnreadable {
            path: path.into(),
            source,
        }
    }
}

impl From<bincode::Error> for CasError {
    fn from(err: bincode::Error) -> Self {
        CasError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CasError::OutOfOrderChunk {
            expected: 1024,
            actual: 2048,
        };
        assert_eq!(
            err.to_string(),
            "Out-of-order chunk: expected offset 1024, got 2048"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CasError = io_err.into();
        assert!(matches!(err, CasError::Io(_)));
    }

    #[test]
    fn test_unreadable_keeps_path() {
        let err = CasError::unreadable(
            "/tmp/gone",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/tmp/gone"));
    }
}
