//! rexcas Core Library
//!
//! Core abstractions for the rexcas content-addressable storage client.
//! This crate provides:
//! - Content digests (Blake3 hash + byte length) with a stable `<hash>/<size>` form
//! - Restartable fixed-size chunking of blobs and ordered reassembly
//! - Merkle directory nodes and deterministic tree flattening
//! - Common error handling

pub mod chunker;
pub mod digest;
pub mod error;
pub mod tree;

pub use chunker::{roundtrip, BlobSource, Chunk, Chunker, ChunkerConfig, Reassembler};
pub use digest::{Digest, HASH_HEX_LEN};
pub use error::{CasError, Result};
pub use tree::{
    flatten, flatten_with_prefix, index_nodes, render_listing, DirectoryEntry, DirectoryNode, EntryKind,
    FileEntry, FlatEntry, NodeResolver, SymlinkEntry,
};

/// Chunk size constants
pub const MIN_CHUNK_SIZE: usize = 1;
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024; // 64 MiB

/// Blobs at or below this size are read in one piece instead of streamed.
pub const DEFAULT_INLINE_THRESHOLD: u64 = 64 * 1024; // 64 KiB

/// Maximum directory nesting accepted when resolving a tree.
pub const DEFAULT_MAX_TREE_DEPTH: usize = 128;
