//! CLI Commands

pub mod digest;
pub mod download;
pub mod tree;
pub mod upload;

use crate::config::RexcasConfig;
use anyhow::{Context, Result};
use rexcas_client::{BatchDispatcher, DispatchReport, Downloader, LocalCas, Uploader};
use rexcas_core::Digest;
use rexcas_storage::{FileMetadataCache, MetadataCache, SledStore};
use std::path::PathBuf;
use std::sync::Arc;

/// Flag values that override the config file
#[derive(Debug, Default)]
pub struct SessionOptions {
    pub store: Option<PathBuf>,
    pub cas_concurrency: Option<usize>,
    pub rpc_timeouts: Option<String>,
}

/// Everything a command needs to talk to the local store
pub struct Session {
    pub store_path: PathBuf,
    pub dispatcher: BatchDispatcher,
    cache: Arc<FileMetadataCache>,
}

impl Session {
    /// Open the store and build a dispatcher from config plus flags
    pub fn open(mut cfg: RexcasConfig, options: SessionOptions) -> Result<Self> {
        if let Some(limit) = options.cas_concurrency {
            cfg.client.concurrency_limit = limit;
        }
        if let Some(spec) = options.rpc_timeouts.as_deref() {
            cfg.client
                .apply_rpc_timeouts(spec)
                .context("Invalid --rpc-timeouts")?;
        }

        let store_path = match options.store {
            Some(path) => path,
            None => cfg.store_path()?,
        };
        let store = Arc::new(
            SledStore::open(&store_path)
                .with_context(|| format!("Failed to open store at {}", store_path.display()))?,
        );

        let cache = if cfg.cli.persist_file_cache {
            FileMetadataCache::with_store(store.clone()).context("Failed to load file cache")?
        } else {
            FileMetadataCache::new()
        };

        let cas = LocalCas::new(store).with_max_batch_size(cfg.client.max_batch_size);
        let dispatcher =
            BatchDispatcher::new(Arc::new(cas), cfg.client).context("Invalid client configuration")?;

        Ok(Self {
            store_path,
            dispatcher,
            cache: Arc::new(cache),
        })
    }

    pub fn uploader(&self) -> Uploader {
        let cache: Arc<dyn MetadataCache> = self.cache.clone();
        Uploader::new(self.dispatcher.clone(), cache)
    }

    pub fn downloader(&self) -> Downloader {
        Downloader::new(self.dispatcher.clone())
    }

    /// Persist file digests learned during this run
    pub fn flush(&self) {
        if let Err(e) = self.cache.flush() {
            tracing::warn!(error = %e, "Failed to flush file cache");
        }
    }
}

/// Parse a `hash/size` digest argument
pub fn parse_digest(s: &str) -> Result<Digest> {
    Digest::parse(s.trim()).with_context(|| format!("Invalid digest: {}", s))
}

/// Fail the command if any item failed, listing each failure
pub fn check_report(report: &DispatchReport) -> Result<()> {
    use console::style;

    if report.is_success() {
        return Ok(());
    }
    for failure in &report.failures {
        eprintln!("{} {}", style(crate::symbols::CROSS).red(), failure);
    }
    anyhow::bail!("{} item(s) failed: {}", report.failures.len(), report.summary())
}
