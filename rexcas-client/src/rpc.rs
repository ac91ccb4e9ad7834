//! The remote CAS boundary
//!
//! [`CasRpc`] mirrors the content-addressable storage and byte-stream
//! services. Implementations report failures as [`tonic::Status`]; the
//! dispatcher owns retries, timeouts and concurrency, so implementations
//! should make a single attempt per call.

use bytes::Bytes;
use futures::Stream;
use rexcas_core::{Chunk, Digest, DirectoryNode};
use std::pin::Pin;
use tonic::Status;

/// Raw bytes of a streamed read
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// Chunks of a streamed write, in offset order
pub type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// Per-digest outcome inside a batch response
pub type BlobResult<T> = (Digest, Result<T, Status>);

#[async_trait::async_trait]
pub trait CasRpc: Send + Sync {
    /// Return the subset of `digests` the store does not hold
    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, Status>;

    /// Upload several small blobs in one request
    async fn batch_update_blobs(
        &self,
        blobs: Vec<(Digest, Bytes)>,
    ) -> Result<Vec<BlobResult<()>>, Status>;

    /// Download several small blobs in one request
    async fn batch_read_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<BlobResult<Bytes>>, Status>;

    /// Stream one blob to the store.
    ///
    /// The first chunk may start past zero when resuming a write whose
    /// prefix was already committed. Returns the committed size.
    async fn write_blob(&self, digest: Digest, chunks: ChunkStream) -> Result<u64, Status>;

    /// Bytes of an interrupted write the store has already committed
    async fn query_write_status(&self, digest: Digest) -> Result<u64, Status>;

    /// Stream one blob from the store starting at `offset`
    async fn read_blob(&self, digest: Digest, offset: u64) -> Result<ByteStream, Status>;

    /// Every directory node reachable from `root`, in no particular order
    async fn get_tree(&self, root: Digest) -> Result<Vec<DirectoryNode>, Status>;
}
