//! In-process loopback CAS
//!
//! Serves the [`CasRpc`] surface straight from a [`BlobStore`]. Integration
//! tests and the CLI use it in place of a remote server.

use crate::rpc::{BlobResult, ByteStream, CasRpc, ChunkStream};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use rexcas_core::{CasError, Digest, DirectoryNode, DEFAULT_CHUNK_SIZE};
use rexcas_storage::BlobStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tonic::Status;
use tracing::{debug, warn};

/// Largest batch request the loopback accepts
pub const DEFAULT_LOCAL_MAX_BATCH_SIZE: u64 = 4 * 1024 * 1024;

fn storage_status(e: CasError) -> Status {
    Status::internal(e.to_string())
}

pub struct LocalCas {
    store: Arc<dyn BlobStore>,
    /// Committed prefixes of interrupted streamed writes
    partial: Mutex<HashMap<Digest, BytesMut>>,
    max_batch_size: u64,
    read_chunk_size: usize,
}

impl LocalCas {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            partial: Mutex::new(HashMap::new()),
            max_batch_size: DEFAULT_LOCAL_MAX_BATCH_SIZE,
            read_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: u64) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Size of the pieces streamed reads are split into
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    fn contains(&self, digest: &Digest) -> Result<bool, Status> {
        if digest.is_empty() {
            return Ok(true);
        }
        self.store.contains(digest).map_err(storage_status)
    }

    fn load(&self, digest: &Digest) -> Result<Bytes, Status> {
        if digest.is_empty() {
            return Ok(Bytes::new());
        }
        self.store
            .get(digest)
            .map_err(storage_status)?
            .ok_or_else(|| Status::not_found(format!("blob {} not found", digest)))
    }

    fn store_verified(&self, digest: Digest, data: Bytes) -> Result<(), Status> {
        let actual = Digest::from_content(&data);
        if actual != digest {
            return Err(Status::invalid_argument(format!(
                "content digest {} does not match {}",
                actual, digest
            )));
        }
        self.store.put(digest, data).map_err(storage_status)
    }

    fn load_node(&self, digest: &Digest) -> Result<Option<DirectoryNode>, Status> {
        if !self.contains(digest)? {
            return Ok(None);
        }
        let bytes = self.load(digest)?;
        DirectoryNode::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| Status::data_loss(format!("node {} is not a directory: {}", digest, e)))
    }
}

#[async_trait::async_trait]
impl CasRpc for LocalCas {
    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, Status> {
        let mut missing = Vec::new();
        for digest in digests {
            if !self.contains(&digest)? {
                missing.push(digest);
            }
        }
        Ok(missing)
    }

    async fn batch_update_blobs(
        &self,
        blobs: Vec<(Digest, Bytes)>,
    ) -> Result<Vec<BlobResult<()>>, Status> {
        let total: u64 = blobs.iter().map(|(_, data)| data.len() as u64).sum();
        if total > self.max_batch_size {
            return Err(Status::invalid_argument(format!(
                "batch of {} bytes exceeds limit of {}",
                total, self.max_batch_size
            )));
        }

        Ok(blobs
            .into_iter()
            .map(|(digest, data)| (digest, self.store_verified(digest, data)))
            .collect())
    }

    async fn batch_read_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<BlobResult<Bytes>>, Status> {
        let total: u64 = digests.iter().map(Digest::size).sum();
        if total > self.max_batch_size {
            return Err(Status::invalid_argument(format!(
                "batch of {} bytes exceeds limit of {}",
                total, self.max_batch_size
            )));
        }

        Ok(digests
            .into_iter()
            .map(|digest| (digest, self.load(&digest)))
            .collect())
    }

    async fn write_blob(&self, digest: Digest, mut chunks: ChunkStream) -> Result<u64, Status> {
        if self.contains(&digest)? {
            // Already stored: drain nothing, report it complete
            self.partial.lock().remove(&digest);
            return Ok(digest.size());
        }

        while let Some(chunk) = chunks.next().await {
            let mut partial = self.partial.lock();
            let buffer = partial.entry(digest).or_default();
            let committed = buffer.len() as u64;

            if chunk.offset > committed {
                return Err(Status::invalid_argument(format!(
                    "write at offset {} leaves a gap after {} committed bytes",
                    chunk.offset, committed
                )));
            }
            // Overlap with what is already committed is skipped
            let skip = (committed - chunk.offset) as usize;
            if skip < chunk.len() {
                buffer.extend_from_slice(&chunk.data[skip..]);
            }
            if buffer.len() as u64 > digest.size() {
                partial.remove(&digest);
                return Err(Status::invalid_argument(format!(
                    "write exceeds declared size {}",
                    digest.size()
                )));
            }
        }

        let finished = self.partial.lock().remove(&digest);
        let data = match finished {
            Some(buffer) if buffer.len() as u64 == digest.size() => buffer.freeze(),
            Some(buffer) => {
                let committed = buffer.len() as u64;
                // Keep the prefix so the writer can resume
                self.partial.lock().insert(digest, buffer);
                debug!(digest = %digest, committed, "Write stream ended early");
                return Ok(committed);
            }
            None => Bytes::new(),
        };

        if let Err(status) = self.store_verified(digest, data) {
            warn!(digest = %digest, "Rejected streamed write");
            return Err(status);
        }
        Ok(digest.size())
    }

    async fn query_write_status(&self, digest: Digest) -> Result<u64, Status> {
        if self.contains(&digest)? {
            return Ok(digest.size());
        }
        Ok(self
            .partial
            .lock()
            .get(&digest)
            .map(|buffer| buffer.len() as u64)
            .unwrap_or(0))
    }

    async fn read_blob(&self, digest: Digest, offset: u64) -> Result<ByteStream, Status> {
        if offset > digest.size() {
            return Err(Status::out_of_range(format!(
                "offset {} beyond blob size {}",
                offset,
                digest.size()
            )));
        }
        let data = self.load(&digest)?.slice(offset as usize..);

        let chunk_size = self.read_chunk_size;
        let pieces: Vec<Result<Bytes, Status>> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(pieces)))
    }

    async fn get_tree(&self, root: Digest) -> Result<Vec<DirectoryNode>, Status> {
        let root_node = self
            .load_node(&root)?
            .ok_or_else(|| Status::not_found(format!("tree root {} not found", root)))?;

        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root_node]);
        let mut nodes = Vec::new();

        while let Some(node) = queue.pop_front() {
            for child in &node.directories {
                if !seen.insert(child.digest) {
                    continue;
                }
                match self.load_node(&child.digest)? {
                    Some(child_node) => queue.push_back(child_node),
                    None => debug!(digest = %child.digest, "Tree references a missing node"),
                }
            }
            nodes.push(node);
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexcas_core::Chunk;
    use rexcas_storage::MemoryBlobStore;

    fn local() -> LocalCas {
        LocalCas::new(Arc::new(MemoryBlobStore::new()))
    }

    fn chunks(items: Vec<Chunk>) -> ChunkStream {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn test_batch_roundtrip_and_missing() {
        let cas = local();
        let a = Bytes::from_static(b"alpha");
        let b = Bytes::from_static(b"beta");
        let da = Digest::from_content(&a);
        let db = Digest::from_content(&b);

        let missing = cas.find_missing_blobs(vec![da, db, Digest::empty()]).await.unwrap();
        assert_eq!(missing, vec![da, db]);

        let results = cas.batch_update_blobs(vec![(da, a.clone())]).await.unwrap();
        assert!(results[0].1.is_ok());
        assert_eq!(cas.find_missing_blobs(vec![da, db]).await.unwrap(), vec![db]);

        let read = cas.batch_read_blobs(vec![da, db]).await.unwrap();
        assert_eq!(read[0].1.as_ref().unwrap(), &a);
        assert_eq!(read[1].1.as_ref().unwrap_err().code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_rejects_wrong_content() {
        let cas = local();
        let digest = Digest::from_content(b"expected");
        let results = cas
            .batch_update_blobs(vec![(digest, Bytes::from_static(b"something else"))])
            .await
            .unwrap();
        assert_eq!(
            results[0].1.as_ref().unwrap_err().code(),
            tonic::Code::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_interrupted_write_resumes() {
        let cas = local();
        let data = Bytes::from(vec![7u8; 100]);
        let digest = Digest::from_content(&data);

        let committed = cas
            .write_blob(digest, chunks(vec![Chunk::new(0, data.slice(0..40))]))
            .await
            .unwrap();
        assert_eq!(committed, 40);
        assert_eq!(cas.query_write_status(digest).await.unwrap(), 40);

        // Overlapping resume is accepted
        let committed = cas
            .write_blob(
                digest,
                chunks(vec![
                    Chunk::new(30, data.slice(30..70)),
                    Chunk::new(70, data.slice(70..100)),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(committed, 100);
        assert_eq!(cas.query_write_status(digest).await.unwrap(), 100);
        assert_eq!(cas.store().get(&digest).unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn test_write_gap_rejected() {
        let cas = local();
        let data = Bytes::from(vec![1u8; 10]);
        let digest = Digest::from_content(&data);
        let err = cas
            .write_blob(digest, chunks(vec![Chunk::new(5, data.slice(5..))]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_read_from_offset() {
        let cas = local().with_read_chunk_size(3);
        let data = Bytes::from_static(b"0123456789");
        let digest = Digest::from_content(&data);
        cas.batch_update_blobs(vec![(digest, data)]).await.unwrap();

        let pieces: Vec<Bytes> = cas
            .read_blob(digest, 4)
            .await
            .unwrap()
            .map(|piece| piece.unwrap())
            .collect()
            .await;
        assert_eq!(pieces.concat(), b"456789");
        assert_eq!(pieces.len(), 2);

        let err = match cas.read_blob(digest, 11).await {
            Err(status) => status,
            Ok(_) => panic!("read past end accepted"),
        };
        assert_eq!(err.code(), tonic::Code::OutOfRange);
    }

    #[tokio::test]
    async fn test_get_tree_collects_reachable_nodes() {
        let cas = local();
        let file = Digest::from_content(b"file");
        let leaf = DirectoryNode::new().with_file("f", file, false);
        let leaf_digest = leaf.digest().unwrap();
        let root = DirectoryNode::new()
            .with_directory("a", leaf_digest)
            .with_directory("b", leaf_digest);
        let root_digest = root.digest().unwrap();

        cas.batch_update_blobs(vec![
            (leaf_digest, Bytes::from(leaf.to_bytes().unwrap())),
            (root_digest, Bytes::from(root.to_bytes().unwrap())),
        ])
        .await
        .unwrap();

        let nodes = cas.get_tree(root_digest).await.unwrap();
        assert_eq!(nodes.len(), 2);

        let err = cas.get_tree(file).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
