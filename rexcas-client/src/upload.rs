//! Directory upload
//!
//! Walks a local file or directory, hashes files through a metadata cache,
//! builds the Merkle tree bottom-up and dispatches every blob the store is
//! missing: file contents plus one serialized node per directory.

use crate::dispatcher::{BatchDispatcher, DispatchReport, UploadItem};
use crate::error::{DispatchError, Result, TransferError};
use crate::retry::{Retrier, RetryBudget};
use futures::stream::{self, StreamExt, TryStreamExt};
use rexcas_core::{CasError, Digest, DirectoryNode};
use rexcas_storage::{CacheEntry, MetadataCache};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result of uploading a path
#[derive(Debug)]
pub struct UploadOutcome {
    /// Digest of the file, or of the root directory node
    pub root: Digest,
    pub report: DispatchReport,
    /// Regular files found under the path
    pub files: usize,
    /// Directories found, including the root
    pub directories: usize,
}

/// A hashed file or tree, ready to dispatch
#[derive(Debug)]
pub struct PreparedUpload {
    pub root: Digest,
    /// File contents plus one serialized node per directory
    pub blobs: Vec<UploadItem>,
    pub files: usize,
    pub directories: usize,
}

/// A directory as found on disk, before hashing
#[derive(Debug, Default)]
struct ScannedDir {
    files: Vec<(String, PathBuf)>,
    directories: Vec<(String, ScannedDir)>,
    symlinks: Vec<(String, String)>,
}

impl ScannedDir {
    fn file_paths<'a>(&'a self, out: &mut Vec<&'a Path>) {
        out.extend(self.files.iter().map(|(_, path)| path.as_path()));
        for (_, dir) in &self.directories {
            dir.file_paths(out);
        }
    }

    fn directory_count(&self) -> usize {
        1 + self
            .directories
            .iter()
            .map(|(_, dir)| dir.directory_count())
            .sum::<usize>()
    }
}

fn utf8_name(path: &Path) -> std::result::Result<String, CasError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| CasError::InvalidName(path.display().to_string()))
}

/// Read `dir` recursively without following symlinks
fn scan(dir: &Path, depth: usize, max_depth: usize) -> std::result::Result<ScannedDir, CasError> {
    if depth > max_depth {
        return Err(CasError::TreeTooDeep { max: max_depth });
    }

    let mut scanned = ScannedDir::default();
    let entries = std::fs::read_dir(dir).map_err(|e| CasError::unreadable(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CasError::unreadable(dir, e))?;
        let path = entry.path();
        let name = utf8_name(&path)?;
        let file_type = entry
            .file_type()
            .map_err(|e| CasError::unreadable(&path, e))?;

        if file_type.is_symlink() {
            let target = std::fs::read_link(&path).map_err(|e| CasError::unreadable(&path, e))?;
            let target = target
                .to_str()
                .ok_or_else(|| CasError::InvalidName(target.display().to_string()))?
                .to_string();
            scanned.symlinks.push((name, target));
        } else if file_type.is_dir() {
            let child = scan(&path, depth + 1, max_depth)?;
            scanned.directories.push((name, child));
        } else if file_type.is_file() {
            scanned.files.push((name, path));
        } else {
            warn!(path = %path.display(), "Skipping special file");
        }
    }
    Ok(scanned)
}

/// Turn a scanned directory into nodes, queueing every blob for upload
fn build(
    dir: &ScannedDir,
    entries: &HashMap<PathBuf, CacheEntry>,
    blobs: &mut Vec<UploadItem>,
) -> std::result::Result<Digest, CasError> {
    let mut node = DirectoryNode::new();

    for (name, path) in &dir.files {
        let entry = entries
            .get(path)
            .ok_or_else(|| CasError::unreadable(path, std::io::ErrorKind::NotFound.into()))?;
        node = node.with_file(name.clone(), entry.digest, entry.is_executable());
        blobs.push(UploadItem::from_file(entry.digest, path.clone()));
    }
    for (name, child) in &dir.directories {
        let digest = build(child, entries, blobs)?;
        node = node.with_directory(name.clone(), digest);
    }
    for (name, target) in &dir.symlinks {
        node = node.with_symlink(name.clone(), target.clone());
    }

    let item = UploadItem::from_bytes(node.to_bytes()?);
    let digest = item.digest;
    blobs.push(item);
    Ok(digest)
}

/// Uploads local files and directory trees
pub struct Uploader {
    dispatcher: BatchDispatcher,
    cache: Arc<dyn MetadataCache>,
    hash_concurrency: usize,
}

impl Uploader {
    pub fn new(dispatcher: BatchDispatcher, cache: Arc<dyn MetadataCache>) -> Self {
        let hash_concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            dispatcher,
            cache,
            hash_concurrency,
        }
    }

    /// Number of files hashed at once
    pub fn with_hash_concurrency(mut self, hash_concurrency: usize) -> Self {
        self.hash_concurrency = hash_concurrency.max(1);
        self
    }

    /// Hash one file, rehashing it when it changed mid-read
    async fn hash(
        &self,
        path: PathBuf,
        budget: &Arc<RetryBudget>,
    ) -> Result<(PathBuf, CacheEntry)> {
        let mut retrier = Retrier::new(
            self.dispatcher.config().retry.clone(),
            budget.clone(),
            CancellationToken::new(),
        );

        loop {
            let cache = self.cache.clone();
            let target = path.clone();
            let result = tokio::task::spawn_blocking(move || cache.compute_or_get_entry(&target))
                .await
                .map_err(|e| CasError::Storage(format!("hashing task failed: {}", e)))?;

            let error = match result {
                Ok(entry) => return Ok((path, entry)),
                Err(e) => TransferError::Local(e),
            };
            if !retrier.backoff(&error).await? {
                return Err(error);
            }
            debug!(
                path = %path.display(),
                attempt = retrier.attempt(),
                "Rehashing file that changed while being read"
            );
        }
    }

    /// Scan and hash a file or directory tree without contacting the store.
    ///
    /// For a directory, `root` is the digest of its node; for a single file,
    /// the file's digest. A file that changes while being hashed is hashed
    /// again under the client's retry policy.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn prepare(&self, path: &Path) -> Result<PreparedUpload> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| CasError::unreadable(path, e))?;
        let budget = Arc::new(RetryBudget::new(
            self.dispatcher.config().retry.retry_budget,
        ));

        if meta.is_file() {
            let (path, entry) = self.hash(path.to_path_buf(), &budget).await?;
            return Ok(PreparedUpload {
                root: entry.digest,
                blobs: vec![UploadItem::from_file(entry.digest, path)],
                files: 1,
                directories: 0,
            });
        }
        if !meta.is_dir() {
            return Err(CasError::unreadable(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "not a regular file or directory",
                ),
            )
            .into());
        }

        let max_depth = self.dispatcher.config().max_tree_depth;
        let dir = path.to_path_buf();
        let scanned = tokio::task::spawn_blocking(move || scan(&dir, 0, max_depth))
            .await
            .map_err(|e| CasError::Storage(format!("scan task failed: {}", e)))??;

        let mut paths = Vec::new();
        scanned.file_paths(&mut paths);
        let file_count = paths.len();

        let entries: HashMap<PathBuf, CacheEntry> = stream::iter(paths)
            .map(|path| self.hash(path.to_path_buf(), &budget))
            .buffer_unordered(self.hash_concurrency)
            .try_collect()
            .await?;

        let mut blobs = Vec::with_capacity(file_count + 1);
        let root = build(&scanned, &entries, &mut blobs)?;
        info!(
            root = %root,
            files = file_count,
            blobs = blobs.len(),
            "Built directory tree"
        );

        Ok(PreparedUpload {
            root,
            blobs,
            files: file_count,
            directories: scanned.directory_count(),
        })
    }

    /// Upload a file or directory tree, sending only what the store lacks
    pub async fn upload_path(
        &self,
        path: &Path,
    ) -> std::result::Result<UploadOutcome, DispatchError> {
        let prepared = self.prepare(path).await?;
        let report = self.dispatcher.upload(prepared.blobs).await?;
        Ok(UploadOutcome {
            root: prepared.root,
            report,
            files: prepared.files,
            directories: prepared.directories,
        })
    }
}
