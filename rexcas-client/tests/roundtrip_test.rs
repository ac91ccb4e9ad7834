//! Upload and download through the loopback store
//!
//! Run with: cargo test -p rexcas-client --test roundtrip_test

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use rexcas_client::rpc::{BlobResult, ByteStream, CasRpc, ChunkStream};
use rexcas_client::{
    BatchDispatcher, ClientConfig, Downloader, LocalCas, RetryPolicy, TransferError,
    TransferRequest, UploadItem, Uploader,
};
use rexcas_core::{CasError, Digest, DirectoryNode, EntryKind};
use rexcas_storage::{
    CacheEntry, FileMetadataCache, MemoryBlobStore, MetadataCache, SledStore,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tonic::Status;

/// Generate test data of the given size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Small sizes so modest files take the streaming path
fn streaming_config() -> ClientConfig {
    ClientConfig {
        concurrency_limit: 8,
        max_batch_size: 8 * 1024,
        large_blob_threshold: 4 * 1024,
        chunk_size: 1024,
        inline_threshold: 512,
        retry: RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            multiplier: 2.0,
            retry_budget: 50,
        },
        ..Default::default()
    }
}

fn write_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

#[cfg(unix)]
fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Source tree used by the directory tests:
/// a.txt, b/ (empty), c -> a.txt, sub/big.bin (streamed, executable),
/// sub/dup.txt (same content as a.txt)
fn build_source_tree(root: &Path) {
    write_file(&root.join("a.txt"), b"0123456789");
    std::fs::create_dir_all(root.join("b")).unwrap();
    write_file(&root.join("sub/big.bin"), &generate_data(10_000));
    write_file(&root.join("sub/dup.txt"), b"0123456789");

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink("a.txt", root.join("c")).unwrap();
        set_executable(&root.join("sub/big.bin"));
    }
}

#[tokio::test]
async fn test_directory_roundtrip_sled() {
    let store = Arc::new(SledStore::open_temporary().unwrap());
    let cas = Arc::new(LocalCas::new(store).with_read_chunk_size(1000));
    let dispatcher = BatchDispatcher::new(cas, streaming_config()).unwrap();
    let cache: Arc<dyn MetadataCache> = Arc::new(FileMetadataCache::new());

    let src = TempDir::new().unwrap();
    build_source_tree(src.path());

    let uploader = Uploader::new(dispatcher.clone(), cache.clone()).with_hash_concurrency(2);
    let outcome = uploader.upload_path(src.path()).await.unwrap();
    assert!(outcome.report.is_success(), "{}", outcome.report.summary());
    assert_eq!(outcome.files, 3);
    assert_eq!(outcome.directories, 3);

    let downloader = Downloader::new(dispatcher.clone());
    let entries = downloader.flat_tree(outcome.root).await.unwrap();
    let paths: Vec<&str> = entries.keys().map(String::as_str).collect();
    #[cfg(unix)]
    assert_eq!(paths, vec!["a.txt", "b", "c", "sub/big.bin", "sub/dup.txt"]);
    #[cfg(not(unix))]
    assert_eq!(paths, vec!["a.txt", "b", "sub/big.bin", "sub/dup.txt"]);

    assert!(matches!(entries["b"].kind, EntryKind::EmptyDirectory { .. }));
    assert_eq!(
        entries["a.txt"].digest(),
        Some(Digest::from_content(b"0123456789"))
    );

    let listing = downloader.tree_listing(outcome.root).await.unwrap();
    assert!(listing.starts_with(&format!("[Root directory digest: {}]", outcome.root)));
    assert!(listing.contains("a.txt: [File digest: "));

    let dst = TempDir::new().unwrap();
    let target = dst.path().join("out");
    let downloaded = downloader
        .download_directory(outcome.root, &target)
        .await
        .unwrap();
    assert!(downloaded.report.is_success(), "{}", downloaded.report.summary());
    assert_eq!(downloaded.files, 3);
    assert_eq!(downloaded.empty_directories, 1);

    assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"0123456789");
    assert_eq!(std::fs::read(target.join("sub/dup.txt")).unwrap(), b"0123456789");
    assert_eq!(
        std::fs::read(target.join("sub/big.bin")).unwrap(),
        generate_data(10_000)
    );
    assert!(target.join("b").is_dir());
    assert_eq!(std::fs::read_dir(target.join("b")).unwrap().count(), 0);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(
            std::fs::read_link(target.join("c")).unwrap(),
            Path::new("a.txt")
        );
        let mode = std::fs::metadata(target.join("sub/big.bin"))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0);
    }

    // Uploading again finds everything present and hashes nothing new
    let again = uploader.upload_path(src.path()).await.unwrap();
    assert_eq!(again.root, outcome.root);
    assert!(again.report.uploaded.is_empty());
    assert!(!again.report.already_present.is_empty());
}

#[tokio::test]
async fn test_single_file_upload_and_read() {
    let cas = Arc::new(LocalCas::new(Arc::new(MemoryBlobStore::new())));
    let dispatcher = BatchDispatcher::new(cas, streaming_config()).unwrap();
    let cache: Arc<dyn MetadataCache> = Arc::new(FileMetadataCache::new());

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("file.bin");
    write_file(&path, &generate_data(6_000));

    let outcome = Uploader::new(dispatcher.clone(), cache)
        .upload_path(&path)
        .await
        .unwrap();
    assert_eq!(outcome.root, Digest::from_content(&generate_data(6_000)));
    assert_eq!(outcome.report.uploaded, vec![outcome.root]);

    let downloader = Downloader::new(dispatcher);
    let content = downloader.read_blob(outcome.root).await.unwrap();
    assert_eq!(content, Bytes::from(generate_data(6_000)));

    let copy = dir.path().join("nested/copy.bin");
    let report = downloader.download_blob(outcome.root, &copy).await.unwrap();
    assert!(report.is_success());
    assert_eq!(std::fs::read(&copy).unwrap(), generate_data(6_000));

    let missing = Digest::from_content(b"never uploaded");
    assert!(downloader.read_blob(missing).await.is_err());
}

#[tokio::test]
async fn test_prepare_matches_upload_without_transfer() {
    let cas = Arc::new(LocalCas::new(Arc::new(MemoryBlobStore::new())));
    let dispatcher = BatchDispatcher::new(cas.clone(), streaming_config()).unwrap();
    let cache: Arc<dyn MetadataCache> = Arc::new(FileMetadataCache::new());

    let src = TempDir::new().unwrap();
    build_source_tree(src.path());

    let uploader = Uploader::new(dispatcher.clone(), cache);
    let prepared = uploader.prepare(src.path()).await.unwrap();

    // Nothing reaches the store until the blobs are dispatched
    let missing = dispatcher.find_missing(vec![prepared.root]).await.unwrap();
    assert_eq!(missing, vec![prepared.root]);

    let outcome = uploader.upload_path(src.path()).await.unwrap();
    assert_eq!(outcome.root, prepared.root);
    assert_eq!(outcome.files, prepared.files);
    assert!(dispatcher.find_missing(vec![prepared.root]).await.unwrap().is_empty());
}

/// Cache whose first lookups fail as if the file changed mid-read
struct ChangingFileCache {
    inner: FileMetadataCache,
    failures_left: AtomicUsize,
    kind: std::io::ErrorKind,
    calls: AtomicUsize,
}

impl ChangingFileCache {
    fn new(failures: usize, kind: std::io::ErrorKind) -> Self {
        Self {
            inner: FileMetadataCache::new(),
            failures_left: AtomicUsize::new(failures),
            kind,
            calls: AtomicUsize::new(0),
        }
    }
}

impl MetadataCache for ChangingFileCache {
    fn compute_or_get_entry(&self, path: &Path) -> rexcas_core::Result<CacheEntry> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CasError::unreadable(
                path,
                std::io::Error::new(self.kind, "file changed while hashing"),
            ));
        }
        self.inner.compute_or_get_entry(path)
    }
}

#[tokio::test]
async fn test_file_changed_while_hashing_is_rehashed() {
    let cas = Arc::new(LocalCas::new(Arc::new(MemoryBlobStore::new())));
    let dispatcher = BatchDispatcher::new(cas, streaming_config()).unwrap();
    let cache = Arc::new(ChangingFileCache::new(1, std::io::ErrorKind::Interrupted));

    let src = TempDir::new().unwrap();
    write_file(&src.path().join("racy.txt"), b"settled content");

    let uploader = Uploader::new(dispatcher, cache.clone());
    let prepared = uploader.prepare(src.path()).await.unwrap();

    assert_eq!(cache.calls.load(Ordering::SeqCst), 2);
    assert_eq!(prepared.files, 1);
    assert!(prepared
        .blobs
        .iter()
        .any(|item| item.digest == Digest::from_content(b"settled content")));
}

#[tokio::test]
async fn test_hashing_gives_up_after_max_attempts() {
    let cas = Arc::new(LocalCas::new(Arc::new(MemoryBlobStore::new())));
    let dispatcher = BatchDispatcher::new(cas, streaming_config()).unwrap();
    let cache = Arc::new(ChangingFileCache::new(usize::MAX, std::io::ErrorKind::Interrupted));

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("always-changing.txt");
    write_file(&path, b"data");

    let err = Uploader::new(dispatcher, cache.clone())
        .prepare(&path)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::Local(CasError::FileUnreadable { .. })
    ));
    assert_eq!(
        cache.calls.load(Ordering::SeqCst),
        streaming_config().retry.max_attempts as usize
    );
}

#[tokio::test]
async fn test_unreadable_file_is_not_rehashed() {
    let cas = Arc::new(LocalCas::new(Arc::new(MemoryBlobStore::new())));
    let dispatcher = BatchDispatcher::new(cas, streaming_config()).unwrap();
    let cache = Arc::new(ChangingFileCache::new(1, std::io::ErrorKind::PermissionDenied));

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locked.txt");
    write_file(&path, b"data");

    let result = Uploader::new(dispatcher, cache.clone()).prepare(&path).await;
    assert!(result.is_err());
    assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_same_digest_to_several_files() {
    let cas = Arc::new(LocalCas::new(Arc::new(MemoryBlobStore::new())));
    let dispatcher = BatchDispatcher::new(cas, streaming_config()).unwrap();

    let small = UploadItem::from_bytes(generate_data(100));
    let large = UploadItem::from_bytes(generate_data(9_000));
    dispatcher
        .upload(vec![small.clone(), large.clone()])
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let mut requests = Vec::new();
    for name in ["s1", "s2"] {
        requests.push(TransferRequest::download_to_file(small.digest, dir.path().join(name)));
    }
    for name in ["l1", "l2"] {
        requests.push(TransferRequest::download_to_file(large.digest, dir.path().join(name)));
    }
    requests.push(TransferRequest::download_to_memory(large.digest));

    let report = dispatcher.dispatch(requests).await.unwrap();
    assert_eq!(report.downloaded.len(), 2);
    assert_eq!(report.contents[&large.digest].len(), 9_000);
    for name in ["s1", "s2"] {
        assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), generate_data(100));
    }
    for name in ["l1", "l2"] {
        assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), generate_data(9_000));
    }
}

/// Loopback store whose first streamed write and read break part way
struct FlakyStreams {
    inner: LocalCas,
    writes: AtomicUsize,
    reads: AtomicUsize,
    write_offsets: Arc<Mutex<Vec<u64>>>,
    read_offsets: Mutex<Vec<u64>>,
}

impl FlakyStreams {
    fn new() -> Self {
        Self {
            inner: LocalCas::new(Arc::new(MemoryBlobStore::new())).with_read_chunk_size(1000),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            write_offsets: Arc::new(Mutex::new(Vec::new())),
            read_offsets: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl CasRpc for FlakyStreams {
    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, Status> {
        self.inner.find_missing_blobs(digests).await
    }

    async fn batch_update_blobs(
        &self,
        blobs: Vec<(Digest, Bytes)>,
    ) -> Result<Vec<BlobResult<()>>, Status> {
        self.inner.batch_update_blobs(blobs).await
    }

    async fn batch_read_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<BlobResult<Bytes>>, Status> {
        self.inner.batch_read_blobs(digests).await
    }

    async fn write_blob(&self, digest: Digest, chunks: ChunkStream) -> Result<u64, Status> {
        let offsets = self.write_offsets.clone();
        let chunks: ChunkStream = Box::pin(chunks.inspect(move |chunk| {
            offsets.lock().push(chunk.offset);
        }));

        if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
            // Commit two chunks, then drop the connection
            self.inner.write_blob(digest, Box::pin(chunks.take(2))).await?;
            return Err(Status::unavailable("connection reset"));
        }
        self.inner.write_blob(digest, chunks).await
    }

    async fn query_write_status(&self, digest: Digest) -> Result<u64, Status> {
        self.inner.query_write_status(digest).await
    }

    async fn read_blob(&self, digest: Digest, offset: u64) -> Result<ByteStream, Status> {
        self.read_offsets.lock().push(offset);
        let stream = self.inner.read_blob(digest, offset).await?;
        if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
            let broken = stream
                .take(1)
                .chain(futures::stream::once(async {
                    Err(Status::unavailable("stream reset"))
                }));
            return Ok(Box::pin(broken));
        }
        Ok(stream)
    }

    async fn get_tree(&self, root: Digest) -> Result<Vec<DirectoryNode>, Status> {
        self.inner.get_tree(root).await
    }
}

#[tokio::test]
async fn test_interrupted_streams_resume_from_committed_offset() {
    let cas = Arc::new(FlakyStreams::new());
    let dispatcher = BatchDispatcher::new(cas.clone(), streaming_config()).unwrap();

    let data = generate_data(10_000);
    let item = UploadItem::from_bytes(data.clone());

    let report = dispatcher.upload(vec![item.clone()]).await.unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(cas.writes.load(Ordering::SeqCst), 2);

    // The second attempt starts where the store's committed prefix ends
    let offsets = cas.write_offsets.lock().clone();
    assert_eq!(&offsets[..2], &[0, 1024]);
    assert_eq!(offsets[2], 2048);
    assert_eq!(*offsets.last().unwrap(), 9 * 1024);

    let report = dispatcher.read_blobs([item.digest]).await.unwrap();
    assert_eq!(report.contents[&item.digest], Bytes::from(data));
    assert_eq!(*cas.read_offsets.lock(), vec![0, 1000]);
}
