//! Directory and blob download

use crate::dispatcher::{BatchDispatcher, DispatchReport, TransferRequest};
use crate::error::{DispatchError, FailureKind, ItemFailure, Result, TransferError};
use bytes::Bytes;
use rexcas_core::{
    flatten_with_prefix, render_listing, CasError, Digest, EntryKind, FlatEntry,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Result of materializing a tree
#[derive(Debug)]
pub struct DownloadOutcome {
    pub report: DispatchReport,
    pub files: usize,
    pub empty_directories: usize,
    pub symlinks: usize,
}

/// Fetches blobs and recreates directory trees locally
pub struct Downloader {
    dispatcher: BatchDispatcher,
}

impl Downloader {
    pub fn new(dispatcher: BatchDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Fetch and flatten the tree under `root`
    pub async fn flat_tree(&self, root: Digest) -> Result<BTreeMap<String, FlatEntry>> {
        let nodes = self.dispatcher.get_tree(root).await?;
        let max_depth = self.dispatcher.config().max_tree_depth;
        Ok(flatten_with_prefix(&root, &nodes, "", max_depth)?)
    }

    /// Render the tree under `root` one entry per line
    pub async fn tree_listing(&self, root: Digest) -> Result<String> {
        let entries = self.flat_tree(root).await?;
        Ok(render_listing(&root, &entries))
    }

    /// Recreate the tree under `root` inside `target`.
    ///
    /// Directories, empty directories and symlinks are created first; file
    /// contents are then fetched, each distinct digest once.
    #[instrument(skip_all, fields(root = %root, target = %target.display()))]
    pub async fn download_directory(
        &self,
        root: Digest,
        target: &Path,
    ) -> std::result::Result<DownloadOutcome, DispatchError> {
        let entries = self.flat_tree(root).await?;

        let target_dir = target.to_path_buf();
        let plan = tokio::task::spawn_blocking(move || prepare(&target_dir, &entries))
            .await
            .map_err(|e| CasError::Storage(format!("layout task failed: {}", e)))??;

        info!(
            files = plan.files.len(),
            empty_directories = plan.empty_directories,
            symlinks = plan.symlinks,
            "Fetching file contents"
        );

        let requests = plan
            .files
            .iter()
            .map(|(path, digest, _)| TransferRequest::download_to_file(*digest, path.clone()))
            .collect();
        let report = self.dispatcher.dispatch(requests).await?;

        mark_executables(&plan.files, &report).await;

        Ok(DownloadOutcome {
            report,
            files: plan.files.len(),
            empty_directories: plan.empty_directories,
            symlinks: plan.symlinks,
        })
    }

    /// Fetch one blob into `target`
    pub async fn download_blob(
        &self,
        digest: Digest,
        target: &Path,
    ) -> std::result::Result<DispatchReport, DispatchError> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CasError::unreadable(parent, e))?;
        }
        self.dispatcher
            .dispatch(vec![TransferRequest::download_to_file(digest, target)])
            .await
    }

    /// Fetch one blob into memory
    pub async fn read_blob(&self, digest: Digest) -> Result<Bytes> {
        let mut report = self
            .dispatcher
            .read_blobs([digest])
            .await
            .map_err(|e| e.error)?;

        if let Some(content) = report.contents.remove(&digest) {
            return Ok(content);
        }
        let failure = report.failures.pop().unwrap_or_else(|| {
            ItemFailure::new(digest, FailureKind::NotFound, "no content returned")
        });
        Err(TransferError::ItemFailed(failure))
    }
}

/// Local layout of a tree, with file contents still to fetch
struct Layout {
    files: Vec<(PathBuf, Digest, bool)>,
    empty_directories: usize,
    symlinks: usize,
}

fn prepare(target: &Path, entries: &BTreeMap<String, FlatEntry>) -> rexcas_core::Result<Layout> {
    std::fs::create_dir_all(target).map_err(|e| CasError::unreadable(target, e))?;

    let mut layout = Layout {
        files: Vec::new(),
        empty_directories: 0,
        symlinks: 0,
    };

    for entry in entries.values() {
        let path = if entry.path.is_empty() {
            target.to_path_buf()
        } else {
            target.join(&entry.path)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CasError::unreadable(parent, e))?;
        }

        match &entry.kind {
            EntryKind::File {
                digest,
                is_executable,
            } => layout.files.push((path, *digest, *is_executable)),
            EntryKind::EmptyDirectory { .. } => {
                std::fs::create_dir_all(&path).map_err(|e| CasError::unreadable(&path, e))?;
                layout.empty_directories += 1;
            }
            EntryKind::Symlink { target: link } => {
                create_symlink(link, &path)?;
                layout.symlinks += 1;
            }
        }
    }

    debug!(
        files = layout.files.len(),
        empty_directories = layout.empty_directories,
        "Prepared local layout"
    );
    Ok(layout)
}

#[cfg(unix)]
async fn mark_executables(files: &[(PathBuf, Digest, bool)], report: &DispatchReport) {
    use std::os::unix::fs::PermissionsExt;

    for (path, digest, is_executable) in files {
        if !*is_executable || report.failure(digest).is_some() {
            continue;
        }
        let mode = std::fs::Permissions::from_mode(0o755);
        if let Err(e) = tokio::fs::set_permissions(path, mode).await {
            warn!(path = %path.display(), error = %e, "Failed to mark file executable");
        }
    }
}

#[cfg(not(unix))]
async fn mark_executables(_files: &[(PathBuf, Digest, bool)], _report: &DispatchReport) {}

#[cfg(unix)]
fn create_symlink(link: &str, path: &Path) -> rexcas_core::Result<()> {
    std::os::unix::fs::symlink(link, path).map_err(|e| CasError::unreadable(path, e))
}

#[cfg(not(unix))]
fn create_symlink(link: &str, path: &Path) -> rexcas_core::Result<()> {
    warn!(path = %path.display(), target = link, "Symlinks unsupported, skipping");
    Ok(())
}
