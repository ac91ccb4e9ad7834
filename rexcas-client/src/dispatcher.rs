//! Batch Dispatcher
//!
//! Moves many blobs to or from the store with:
//! - A global ceiling on in-flight batch and stream operations
//! - Size-bounded batching of small blobs
//! - Resumable chunked streaming of large blobs
//! - Per-RPC timeouts and bounded exponential retries
//! - Per-item failure reporting, with whole-dispatch abort on fatal errors

use crate::config::{ClientConfig, RpcKind, RpcTimeouts};
use crate::error::{DispatchError, FailureKind, ItemFailure, Result, TransferError};
use crate::metrics::names;
use crate::retry::{Retrier, RetryBudget};
use crate::rpc::{BlobResult, CasRpc, ChunkStream};
use bytes::Bytes;
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use rexcas_core::{
    index_nodes, BlobSource, CasError, Chunk, Chunker, Digest, DirectoryNode, Reassembler,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, error, info, instrument, warn};

/// Chunks buffered between the local reader/writer and the network
const CHUNK_QUEUE_DEPTH: usize = 4;

/// Where the bytes of an upload come from
#[derive(Debug, Clone)]
pub enum UploadSource {
    Memory(Bytes),
    File(PathBuf),
}

impl UploadSource {
    fn to_blob_source(&self) -> BlobSource {
        match self {
            UploadSource::Memory(data) => BlobSource::Memory(data.clone()),
            UploadSource::File(path) => BlobSource::File(path.clone()),
        }
    }

    /// Read the whole blob and check it still matches `digest`
    async fn load(&self, digest: &Digest) -> Result<Bytes> {
        let data = match self {
            UploadSource::Memory(data) => data.clone(),
            UploadSource::File(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| CasError::unreadable(path, e))?,
        };
        let actual = Digest::from_content(&data);
        if actual != *digest {
            return Err(CasError::DigestMismatch {
                expected: *digest,
                actual,
            }
            .into());
        }
        Ok(data)
    }
}

/// One blob to upload
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub digest: Digest,
    pub source: UploadSource,
}

impl UploadItem {
    pub fn new(digest: Digest, source: UploadSource) -> Self {
        Self { digest, source }
    }

    /// Upload in-memory content, computing its digest
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            digest: Digest::from_content(&data),
            source: UploadSource::Memory(data),
        }
    }

    /// Upload a file whose digest is already known
    pub fn from_file(digest: Digest, path: impl Into<PathBuf>) -> Self {
        Self {
            digest,
            source: UploadSource::File(path.into()),
        }
    }
}

/// Where downloaded bytes go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSink {
    /// Returned in [`DispatchReport::contents`]
    Memory,
    /// Written to this path, replacing any existing file
    File(PathBuf),
}

/// A single unit of work for [`BatchDispatcher::dispatch`]
#[derive(Debug, Clone)]
pub enum TransferRequest {
    Upload(UploadItem),
    Download { digest: Digest, sink: DownloadSink },
}

impl TransferRequest {
    pub fn download_to_memory(digest: Digest) -> Self {
        TransferRequest::Download {
            digest,
            sink: DownloadSink::Memory,
        }
    }

    pub fn download_to_file(digest: Digest, path: impl Into<PathBuf>) -> Self {
        TransferRequest::Download {
            digest,
            sink: DownloadSink::File(path.into()),
        }
    }
}

impl From<UploadItem> for TransferRequest {
    fn from(item: UploadItem) -> Self {
        TransferRequest::Upload(item)
    }
}

/// Result of a dispatch
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Blobs written to the store
    pub uploaded: Vec<Digest>,
    /// Upload candidates the store already held
    pub already_present: Vec<Digest>,
    /// Blobs fetched and delivered to every requested sink
    pub downloaded: Vec<Digest>,
    /// Content of blobs requested into memory
    pub contents: HashMap<Digest, Bytes>,
    /// Items that could not be transferred
    pub failures: Vec<ItemFailure>,
    /// Blob bytes moved over the wire
    pub bytes_transferred: u64,
    pub duration: Duration,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failure recorded for `digest`, if any
    pub fn failure(&self, digest: &Digest) -> Option<&ItemFailure> {
        self.failures.iter().find(|f| f.digest == *digest)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} uploaded, {} already present, {} downloaded, {} failed, {} bytes in {:?}",
            self.uploaded.len(),
            self.already_present.len(),
            self.downloaded.len(),
            self.failures.len(),
            self.bytes_transferred,
            self.duration
        )
    }

    fn merge(&mut self, outcome: JobOutcome, pending: &mut BTreeSet<Digest>) {
        for digest in &outcome.uploaded {
            pending.remove(digest);
        }
        for (digest, _) in &outcome.downloaded {
            pending.remove(digest);
        }
        for failure in &outcome.failures {
            pending.remove(&failure.digest);
        }

        self.uploaded.extend(outcome.uploaded);
        for (digest, content) in outcome.downloaded {
            self.downloaded.push(digest);
            if let Some(content) = content {
                self.contents.insert(digest, content);
            }
        }
        self.failures.extend(outcome.failures);
        self.bytes_transferred += outcome.bytes;
    }

    /// Record every still-unresolved digest as failed with `kind`
    fn fail_pending(&mut self, pending: BTreeSet<Digest>, kind: FailureKind, message: &str) {
        counter!(names::ITEM_FAILURES).increment(pending.len() as u64);
        self.failures.extend(
            pending
                .into_iter()
                .map(|digest| ItemFailure::new(digest, kind, message)),
        );
    }
}

/// Everything one download job must deliver for a digest
#[derive(Debug, Clone)]
struct DownloadTarget {
    keep_in_memory: bool,
    files: Vec<PathBuf>,
}

impl DownloadTarget {
    async fn deliver(&self, data: &Bytes) -> Result<()> {
        for path in &self.files {
            tokio::fs::write(path, data).await.map_err(|e| {
                CasError::Storage(format!("Failed to write {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

enum Job {
    UploadBatch(Vec<(Digest, UploadSource)>),
    UploadStream(Digest, UploadSource),
    DownloadBatch(Vec<(Digest, DownloadTarget)>),
    DownloadStream(Digest, DownloadTarget),
}

/// What a single job accomplished
#[derive(Default)]
struct JobOutcome {
    uploaded: Vec<Digest>,
    downloaded: Vec<(Digest, Option<Bytes>)>,
    failures: Vec<ItemFailure>,
    bytes: u64,
    fatal: Option<TransferError>,
}

impl JobOutcome {
    fn uploaded(&mut self, digest: Digest) {
        counter!(names::BYTES_UPLOADED).increment(digest.size());
        self.bytes += digest.size();
        self.uploaded.push(digest);
    }

    fn downloaded(&mut self, digest: Digest, content: Option<Bytes>) {
        counter!(names::BYTES_DOWNLOADED).increment(digest.size());
        self.bytes += digest.size();
        self.downloaded.push((digest, content));
    }

    fn fail(&mut self, digest: Digest, error: &TransferError) {
        warn!(digest = %digest, error = %error, "Transfer failed");
        counter!(names::ITEM_FAILURES).increment(1);
        self.failures.push(ItemFailure::from_error(digest, error));
    }

    /// Stop the job. Cancellation leaves unfinished items to the dispatcher.
    fn abort(&mut self, error: TransferError) {
        if !matches!(error, TransferError::Cancelled) && self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }
}

struct Inner {
    rpc: Arc<dyn CasRpc>,
    config: ClientConfig,
    timeouts: RpcTimeouts,
    semaphore: Arc<Semaphore>,
}

/// Bounded-concurrency transfer engine over a [`CasRpc`].
///
/// Cheap to clone; clones share the concurrency ceiling.
#[derive(Clone)]
pub struct BatchDispatcher {
    inner: Arc<Inner>,
}

impl BatchDispatcher {
    /// Create a dispatcher, rejecting invalid configuration up front
    pub fn new(rpc: Arc<dyn CasRpc>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let timeouts = config.resolved_timeouts()?;
        let semaphore = Arc::new(Semaphore::new(config.concurrency_limit));

        debug!(
            concurrency = config.concurrency_limit,
            max_batch_size = config.max_batch_size,
            large_blob_threshold = config.large_blob_threshold,
            "Created batch dispatcher"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                rpc,
                config,
                timeouts,
                semaphore,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Effective per-RPC timeouts
    pub fn timeouts(&self) -> &RpcTimeouts {
        &self.inner.timeouts
    }

    fn run(&self, cancel: &CancellationToken) -> Run {
        Run {
            inner: self.inner.clone(),
            budget: Arc::new(RetryBudget::new(self.inner.config.retry.retry_budget)),
            cancel: cancel.child_token(),
        }
    }

    /// Execute `requests`, see [`dispatch_cancellable`](Self::dispatch_cancellable)
    pub async fn dispatch(
        &self,
        requests: Vec<TransferRequest>,
    ) -> std::result::Result<DispatchReport, DispatchError> {
        self.dispatch_cancellable(requests, CancellationToken::new())
            .await
    }

    /// Execute `requests` until done or `cancel` fires.
    ///
    /// Duplicate digests are transferred once. Uploads are preceded by an
    /// existence query and only missing blobs are sent. Item failures are
    /// listed in the report; a fatal error or cancellation stops every job
    /// and returns the partial report inside the error.
    #[instrument(skip(self, requests, cancel), fields(requests = requests.len()))]
    pub async fn dispatch_cancellable(
        &self,
        requests: Vec<TransferRequest>,
        cancel: CancellationToken,
    ) -> std::result::Result<DispatchReport, DispatchError> {
        let start = Instant::now();
        let run = self.run(&cancel);
        let mut report = DispatchReport::default();

        let mut uploads: BTreeMap<Digest, UploadSource> = BTreeMap::new();
        let mut downloads: BTreeMap<Digest, DownloadTarget> = BTreeMap::new();
        for request in requests {
            match request {
                TransferRequest::Upload(item) => {
                    uploads.entry(item.digest).or_insert(item.source);
                }
                TransferRequest::Download { digest, sink } => {
                    let target = downloads.entry(digest).or_insert_with(|| DownloadTarget {
                        keep_in_memory: false,
                        files: Vec::new(),
                    });
                    match sink {
                        DownloadSink::Memory => target.keep_in_memory = true,
                        DownloadSink::File(path) => target.files.push(path),
                    }
                }
            }
        }

        // The empty blob is always present and never fetched
        let empty = Digest::empty();
        if uploads.remove(&empty).is_some() {
            report.already_present.push(empty);
        }
        if let Some(target) = downloads.remove(&empty) {
            let mut outcome = JobOutcome::default();
            match target.deliver(&Bytes::new()).await {
                Ok(()) => outcome.downloaded(empty, target.keep_in_memory.then(Bytes::new)),
                Err(e) => outcome.fail(empty, &e),
            }
            report.merge(outcome, &mut BTreeSet::new());
        }

        let mut pending: BTreeSet<Digest> = uploads.keys().chain(downloads.keys()).copied().collect();

        if !uploads.is_empty() {
            let candidates: Vec<Digest> = uploads.keys().copied().collect();
            let missing = match run.find_missing(candidates).await {
                Ok(missing) => missing,
                Err(TransferError::Cancelled) => {
                    report.fail_pending(pending, FailureKind::Cancelled, "cancelled");
                    return Err(DispatchError::new(TransferError::Cancelled, report));
                }
                Err(e) if self.inner.config.assume_missing_on_presence_failure && !e.is_fatal() => {
                    warn!(error = %e, "Presence check failed, assuming every blob is missing");
                    uploads.keys().copied().collect()
                }
                Err(e) => {
                    let error = match e {
                        TransferError::Rpc { .. } | TransferError::Timeout(_) => {
                            TransferError::PresenceCheckFailed(e.to_string())
                        }
                        other => other,
                    };
                    error!(error = %error, "Presence check failed");
                    report.fail_pending(pending, FailureKind::Fatal, &error.to_string());
                    return Err(DispatchError::new(error, report));
                }
            };

            histogram!(names::MISSING_RATIO).record(missing.len() as f64 / uploads.len() as f64);
            uploads.retain(|digest, _| {
                let keep = missing.contains(digest);
                if !keep {
                    report.already_present.push(*digest);
                    pending.remove(digest);
                }
                keep
            });
            counter!(names::BLOBS_SKIPPED).increment(report.already_present.len() as u64);
        }

        let jobs = self.plan(uploads, downloads);
        info!(
            jobs = jobs.len(),
            items = pending.len(),
            "Dispatching transfer jobs"
        );

        let mut join_set = JoinSet::new();
        for job in jobs {
            let run = run.clone();
            join_set.spawn(async move { run.admit(job).await });
        }

        let mut fatal: Option<TransferError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(mut outcome) => {
                    if let Some(e) = outcome.fatal.take() {
                        if fatal.is_none() {
                            error!(error = %e, "Fatal transfer error, cancelling outstanding jobs");
                            run.cancel.cancel();
                            fatal = Some(e);
                        }
                    }
                    report.merge(outcome, &mut pending);
                }
                Err(e) => {
                    error!(error = %e, "Transfer job panicked");
                }
            }
        }

        report.duration = start.elapsed();

        if let Some(e) = fatal {
            report.fail_pending(pending, FailureKind::Fatal, &e.to_string());
            return Err(DispatchError::new(e, report));
        }
        if cancel.is_cancelled() {
            report.fail_pending(pending, FailureKind::Cancelled, "cancelled");
            return Err(DispatchError::new(TransferError::Cancelled, report));
        }
        if !pending.is_empty() {
            report.fail_pending(pending, FailureKind::Local, "transfer job panicked");
        }

        info!(summary = %report.summary(), "Dispatch complete");
        Ok(report)
    }

    /// Split work into size-bounded batches and individual streams
    fn plan(
        &self,
        uploads: BTreeMap<Digest, UploadSource>,
        downloads: BTreeMap<Digest, DownloadTarget>,
    ) -> Vec<Job> {
        let threshold = self.inner.config.large_blob_threshold;
        let max_batch = self.inner.config.max_batch_size;
        let mut jobs = Vec::new();

        let (large, small): (Vec<_>, Vec<_>) = uploads
            .into_iter()
            .partition(|(digest, _)| digest.size() > threshold);
        jobs.extend(large.into_iter().map(|(d, s)| Job::UploadStream(d, s)));
        jobs.extend(pack(small, max_batch).into_iter().map(Job::UploadBatch));

        let (large, small): (Vec<_>, Vec<_>) = downloads
            .into_iter()
            .partition(|(digest, _)| digest.size() > threshold);
        jobs.extend(large.into_iter().map(|(d, t)| Job::DownloadStream(d, t)));
        jobs.extend(pack(small, max_batch).into_iter().map(Job::DownloadBatch));

        jobs
    }

    /// Upload blobs the store does not already hold
    pub async fn upload(
        &self,
        items: Vec<UploadItem>,
    ) -> std::result::Result<DispatchReport, DispatchError> {
        self.dispatch(items.into_iter().map(TransferRequest::Upload).collect())
            .await
    }

    /// Fetch blobs into memory
    pub async fn read_blobs(
        &self,
        digests: impl IntoIterator<Item = Digest>,
    ) -> std::result::Result<DispatchReport, DispatchError> {
        self.dispatch(
            digests
                .into_iter()
                .map(TransferRequest::download_to_memory)
                .collect(),
        )
        .await
    }

    /// Digests among `digests` the store does not hold
    pub async fn find_missing(&self, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        let run = self.run(&CancellationToken::new());
        let mut missing: Vec<Digest> = run.find_missing(digests).await?.into_iter().collect();
        missing.sort();
        Ok(missing)
    }

    /// Every directory node reachable from `root`, keyed by digest
    pub async fn get_tree(&self, root: Digest) -> Result<HashMap<Digest, DirectoryNode>> {
        let run = self.run(&CancellationToken::new());
        let rpc = run.inner.rpc.clone();
        let nodes = run
            .with_retry(|| run.call(RpcKind::GetTree, rpc.get_tree(root)))
            .await?;
        debug!(root = %root, nodes = nodes.len(), "Fetched tree");
        Ok(index_nodes(nodes)?)
    }
}

/// Greedily pack items, in digest order, into groups under `max_bytes`
fn pack<T>(items: Vec<(Digest, T)>, max_bytes: u64) -> Vec<Vec<(Digest, T)>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0u64;

    for (digest, payload) in items {
        if !current.is_empty() && current_size + digest.size() > max_bytes {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += digest.size();
        current.push((digest, payload));
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// State shared by the jobs of one dispatch
#[derive(Clone)]
struct Run {
    inner: Arc<Inner>,
    budget: Arc<RetryBudget>,
    cancel: CancellationToken,
}

impl Run {
    fn retrier(&self) -> Retrier {
        Retrier::new(
            self.inner.config.retry.clone(),
            self.budget.clone(),
            self.cancel.clone(),
        )
    }

    /// Issue one RPC under its timeout, giving up on cancellation
    async fn call<T>(
        &self,
        kind: RpcKind,
        fut: impl Future<Output = std::result::Result<T, Status>>,
    ) -> Result<T> {
        counter!(names::RPC_CALLS, "rpc" => kind.name()).increment(1);
        let start = Instant::now();

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            result = with_timeout(self.inner.timeouts.get(kind), fut) => result,
        };
        histogram!(names::RPC_DURATION, "rpc" => kind.name()).record(start.elapsed().as_secs_f64());

        match result {
            Some(Ok(value)) => Ok(value),
            Some(Err(status)) => {
                counter!(names::RPC_FAILURES, "rpc" => kind.name()).increment(1);
                Err(TransferError::rpc(kind, status))
            }
            None => {
                counter!(names::RPC_FAILURES, "rpc" => kind.name()).increment(1);
                Err(TransferError::Timeout(kind))
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retrier = self.retrier();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !retrier.backoff(&e).await? {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn find_missing(&self, digests: Vec<Digest>) -> Result<HashSet<Digest>> {
        let requested: HashSet<Digest> = digests.iter().copied().collect();
        let rpc = self.inner.rpc.clone();
        let missing = self
            .with_retry(|| self.call(RpcKind::FindMissingBlobs, rpc.find_missing_blobs(digests.clone())))
            .await?;

        let missing: HashSet<Digest> = missing
            .into_iter()
            .filter(|digest| {
                let known = requested.contains(digest);
                if !known {
                    warn!(digest = %digest, "Presence check reported an unrequested digest");
                }
                known
            })
            .collect();
        debug!(
            requested = requested.len(),
            missing = missing.len(),
            "Presence check complete"
        );
        Ok(missing)
    }

    /// Wait for a concurrency slot, then run the job
    async fn admit(self, job: Job) -> JobOutcome {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return JobOutcome::default(),
            permit = self.inner.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return JobOutcome::default(),
            },
        };

        gauge!(names::INFLIGHT).increment(1.0);
        let outcome = match job {
            Job::UploadBatch(items) => self.upload_batch(items).await,
            Job::UploadStream(digest, source) => self.upload_stream(digest, source).await,
            Job::DownloadBatch(items) => self.download_batch(items).await,
            Job::DownloadStream(digest, target) => self.download_stream(digest, target).await,
        };
        gauge!(names::INFLIGHT).decrement(1.0);
        drop(permit);

        outcome
    }

    /// Send one batch request, retrying only the items that failed
    /// transiently. Returns the items that succeeded with their results.
    async fn run_batch<P, R, F, Fut>(
        &self,
        kind: RpcKind,
        mut items: Vec<(Digest, P)>,
        outcome: &mut JobOutcome,
        send: F,
    ) -> Vec<(Digest, P, R)>
    where
        P: Clone,
        F: Fn(Vec<(Digest, P)>) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<BlobResult<R>>, Status>>,
    {
        let mut done = Vec::new();
        let mut retrier = self.retrier();

        while !items.is_empty() {
            let (retry, error) = match self.call(kind, send(items.clone())).await {
                Ok(responses) => {
                    let mut by_digest: HashMap<Digest, std::result::Result<R, Status>> =
                        responses.into_iter().collect();
                    let mut retry = Vec::new();
                    let mut last_error = None;

                    for (digest, payload) in items {
                        match by_digest.remove(&digest) {
                            Some(Ok(result)) => done.push((digest, payload, result)),
                            Some(Err(status)) => {
                                let e = TransferError::rpc(kind, status);
                                if e.is_fatal() {
                                    outcome.abort(e);
                                    return done;
                                } else if e.is_transient() {
                                    retry.push((digest, payload));
                                    last_error = Some(e);
                                } else {
                                    outcome.fail(digest, &e);
                                }
                            }
                            None => outcome.fail(
                                digest,
                                &TransferError::MalformedResponse(format!(
                                    "{} response has no entry for {}",
                                    kind, digest
                                )),
                            ),
                        }
                    }

                    match last_error {
                        Some(e) => (retry, e),
                        None => break,
                    }
                }
                Err(e) => (items, e),
            };

            if error.is_fatal() || matches!(error, TransferError::Cancelled) {
                outcome.abort(error);
                return done;
            }
            match retrier.backoff(&error).await {
                Ok(true) => items = retry,
                Ok(false) => {
                    for (digest, _) in &retry {
                        outcome.fail(*digest, &error);
                    }
                    break;
                }
                Err(e) => {
                    outcome.abort(e);
                    return done;
                }
            }
        }

        done
    }

    async fn upload_batch(&self, items: Vec<(Digest, UploadSource)>) -> JobOutcome {
        let mut outcome = JobOutcome::default();

        let mut blobs = Vec::with_capacity(items.len());
        for (digest, source) in items {
            match source.load(&digest).await {
                Ok(data) => blobs.push((digest, data)),
                Err(e) => outcome.fail(digest, &e),
            }
        }

        let rpc = self.inner.rpc.clone();
        let done = self
            .run_batch(RpcKind::BatchUpdateBlobs, blobs, &mut outcome, |blobs| {
                let rpc = rpc.clone();
                async move { rpc.batch_update_blobs(blobs).await }
            })
            .await;

        for (digest, _, ()) in done {
            outcome.uploaded(digest);
        }
        debug!(
            uploaded = outcome.uploaded.len(),
            failed = outcome.failures.len(),
            "Upload batch complete"
        );
        outcome
    }

    async fn download_batch(&self, items: Vec<(Digest, DownloadTarget)>) -> JobOutcome {
        let mut outcome = JobOutcome::default();

        let rpc = self.inner.rpc.clone();
        let done = self
            .run_batch(RpcKind::BatchReadBlobs, items, &mut outcome, |items| {
                let rpc = rpc.clone();
                let digests = items.into_iter().map(|(digest, _)| digest).collect();
                async move { rpc.batch_read_blobs(digests).await }
            })
            .await;

        for (digest, target, data) in done {
            let actual = Digest::from_content(&data);
            if actual != digest {
                outcome.fail(
                    digest,
                    &CasError::DigestMismatch {
                        expected: digest,
                        actual,
                    }
                    .into(),
                );
                continue;
            }
            match target.deliver(&data).await {
                Ok(()) => outcome.downloaded(digest, target.keep_in_memory.then_some(data)),
                Err(e) => outcome.fail(digest, &e),
            }
        }
        outcome
    }

    #[instrument(skip_all, fields(digest = %digest))]
    async fn upload_stream(&self, digest: Digest, source: UploadSource) -> JobOutcome {
        let mut outcome = JobOutcome::default();
        let mut retrier = self.retrier();
        let mut offset = 0u64;

        loop {
            let error = match self.write_from(digest, &source, offset).await {
                Ok(committed) if committed == digest.size() => {
                    outcome.uploaded(digest);
                    return outcome;
                }
                Ok(committed) => TransferError::MalformedResponse(format!(
                    "store committed {} of {} bytes",
                    committed,
                    digest.size()
                )),
                Err(e) => e,
            };

            if error.is_fatal() || matches!(error, TransferError::Cancelled) {
                outcome.abort(error);
                return outcome;
            }
            match retrier.backoff(&error).await {
                Ok(true) => {}
                Ok(false) => {
                    outcome.fail(digest, &error);
                    return outcome;
                }
                Err(e) => {
                    outcome.abort(e);
                    return outcome;
                }
            }

            // Resume after whatever prefix the store already committed
            let rpc = self.inner.rpc.clone();
            offset = match self
                .call(RpcKind::QueryWriteStatus, rpc.query_write_status(digest))
                .await
            {
                Ok(committed) if committed == digest.size() => {
                    outcome.uploaded(digest);
                    return outcome;
                }
                Ok(committed) if committed < digest.size() => committed,
                Ok(committed) => {
                    warn!(committed, "Write status beyond blob size, restarting");
                    0
                }
                Err(TransferError::Cancelled) => return outcome,
                Err(e) => {
                    debug!(error = %e, "Write status unavailable, restarting");
                    0
                }
            };
            debug!(offset, "Resuming streamed upload");
        }
    }

    /// One streamed write attempt starting at `offset`
    async fn write_from(&self, digest: Digest, source: &UploadSource, offset: u64) -> Result<u64> {
        let blob_source = source.to_blob_source();
        let chunker_config = self.inner.config.chunker_config();
        let (tx, rx) = mpsc::channel::<Chunk>(CHUNK_QUEUE_DEPTH);

        let producer = tokio::task::spawn_blocking(move || -> rexcas_core::Result<()> {
            let mut chunker = Chunker::with_config(blob_source, chunker_config)?;
            if chunker.total_size() != digest.size() {
                return Err(CasError::IncompleteBlob {
                    expected: digest.size(),
                    actual: chunker.total_size(),
                });
            }
            chunker.seek(offset)?;
            for chunk in chunker {
                if tx.blocking_send(chunk?).is_err() {
                    // Receiver dropped: the attempt already ended
                    break;
                }
            }
            Ok(())
        });

        let chunks: ChunkStream = Box::pin(ReceiverStream::new(rx));
        let rpc = self.inner.rpc.clone();
        let sent = self.call(RpcKind::Write, rpc.write_blob(digest, chunks)).await;

        // A local read failure explains a truncated stream better than the
        // server's complaint about it
        match producer.await {
            Ok(Ok(())) => sent,
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(CasError::Storage(format!("chunk producer failed: {}", e)).into()),
        }
    }

    #[instrument(skip_all, fields(digest = %digest))]
    async fn download_stream(&self, digest: Digest, target: DownloadTarget) -> JobOutcome {
        let mut outcome = JobOutcome::default();
        let (tx, rx) = mpsc::channel::<Bytes>(CHUNK_QUEUE_DEPTH);
        let writer = spawn_writer(digest, &target, rx);

        let mut received = 0u64;
        let mut retrier = self.retrier();
        let mut failure = None;

        while received < digest.size() {
            let error = match self.read_from(digest, &mut received, &tx).await {
                Ok(()) if received == digest.size() => break,
                Ok(()) => TransferError::MalformedResponse(format!(
                    "stream ended after {} of {} bytes",
                    received,
                    digest.size()
                )),
                Err(e) => e,
            };

            // Writer gone: its own error is reported below
            if tx.is_closed() {
                break;
            }
            if error.is_fatal() || matches!(error, TransferError::Cancelled) {
                outcome.abort(error);
                drop(tx);
                let _ = writer.await;
                return outcome;
            }
            match retrier.backoff(&error).await {
                Ok(true) => debug!(offset = received, "Resuming streamed download"),
                Ok(false) => {
                    failure = Some(error);
                    break;
                }
                Err(e) => {
                    outcome.abort(e);
                    drop(tx);
                    let _ = writer.await;
                    return outcome;
                }
            }
        }
        drop(tx);

        let written = match writer.await {
            Ok(result) => result,
            Err(e) => Err(CasError::Storage(format!("chunk writer failed: {}", e))),
        };
        match (failure, written) {
            (Some(e), _) => outcome.fail(digest, &e),
            (None, Err(e)) => outcome.fail(digest, &e.into()),
            (None, Ok(memory)) => {
                let delivered = match memory {
                    Some(data) => target
                        .deliver(&data)
                        .await
                        .map(|()| target.keep_in_memory.then_some(data)),
                    None => copy_to_rest(&target.files).await.map(|()| None),
                };
                match delivered {
                    Ok(content) => outcome.downloaded(digest, content),
                    Err(e) => outcome.fail(digest, &e),
                }
            }
        }
        outcome
    }

    /// One streamed read attempt from `*received`, forwarding bytes to the writer.
    ///
    /// The `Read` timeout bounds opening the stream and each wait for the
    /// next piece, so a long blob that keeps arriving never times out.
    async fn read_from(
        &self,
        digest: Digest,
        received: &mut u64,
        tx: &mpsc::Sender<Bytes>,
    ) -> Result<()> {
        let rpc = self.inner.rpc.clone();
        let mut stream = self
            .call(RpcKind::Read, rpc.read_blob(digest, *received))
            .await?;
        let limit = self.inner.timeouts.get(RpcKind::Read);

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                next = with_timeout(limit, stream.next()) => next,
            };
            let data = match next {
                Some(Some(Ok(data))) => data,
                Some(None) => return Ok(()),
                Some(Some(Err(status))) => {
                    counter!(names::RPC_FAILURES, "rpc" => RpcKind::Read.name()).increment(1);
                    return Err(TransferError::rpc(RpcKind::Read, status));
                }
                None => {
                    counter!(names::RPC_FAILURES, "rpc" => RpcKind::Read.name()).increment(1);
                    return Err(TransferError::Timeout(RpcKind::Read));
                }
            };
            if data.is_empty() {
                continue;
            }

            let len = data.len() as u64;
            if tx.send(data).await.is_err() {
                return Err(TransferError::rpc(
                    RpcKind::Read,
                    Status::cancelled("reassembly stopped"),
                ));
            }
            *received += len;
        }
    }
}

/// Destination a streamed download is reassembled into
enum SinkWriter {
    Memory(Vec<u8>),
    File(BufWriter<File>),
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            SinkWriter::Memory(v) => v.write(buf),
            SinkWriter::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SinkWriter::Memory(v) => v.flush(),
            SinkWriter::File(f) => f.flush(),
        }
    }
}

/// Reassemble received bytes on a blocking thread.
///
/// Resolves to the content when it was kept in memory, or `None` once the
/// first target file is complete. A partial file is removed on failure.
fn spawn_writer(
    digest: Digest,
    target: &DownloadTarget,
    mut rx: mpsc::Receiver<Bytes>,
) -> tokio::task::JoinHandle<rexcas_core::Result<Option<Bytes>>> {
    let file = match (target.keep_in_memory, target.files.first()) {
        (false, Some(path)) => Some(path.clone()),
        _ => None,
    };

    tokio::task::spawn_blocking(move || -> rexcas_core::Result<Option<Bytes>> {
        let sink = match &file {
            Some(path) => SinkWriter::File(BufWriter::new(
                File::create(path).map_err(|e| CasError::unreadable(path, e))?,
            )),
            None => SinkWriter::Memory(Vec::new()),
        };

        let mut reassembler = Reassembler::new(sink, digest.size());
        let result = (|| -> rexcas_core::Result<()> {
            while let Some(data) = rx.blocking_recv() {
                reassembler.push(&Chunk::new(reassembler.written(), data))?;
            }
            Ok(())
        })();
        let result = result.and_then(|()| reassembler.finish_verified(&digest));

        match result {
            Ok(SinkWriter::Memory(data)) => Ok(Some(Bytes::from(data))),
            Ok(SinkWriter::File(_)) => Ok(None),
            Err(e) => {
                if let Some(path) = &file {
                    let _ = std::fs::remove_file(path);
                }
                Err(e)
            }
        }
    })
}

/// Duplicate the first file to every other requested path
async fn copy_to_rest(files: &[PathBuf]) -> Result<()> {
    if let Some((first, rest)) = files.split_first() {
        for path in rest {
            tokio::fs::copy(first, path).await.map_err(|e| {
                CasError::Storage(format!("Failed to write {}: {}", path.display(), e))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of_size(size: usize) -> Digest {
        Digest::from_content(&vec![size as u8; size])
    }

    #[test]
    fn test_pack_respects_max_size() {
        let items: Vec<(Digest, ())> = [400, 300, 300, 200, 900, 100]
            .into_iter()
            .map(|size| (digest_of_size(size), ()))
            .collect();

        let batches = pack(items, 1000);
        for batch in &batches {
            let total: u64 = batch.iter().map(|(d, _)| d.size()).sum();
            assert!(total <= 1000, "batch of {} bytes", total);
        }
        let count: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(count, 6);
    }

    #[test]
    fn test_pack_single_item_at_limit() {
        let items = vec![(digest_of_size(1000), ()), (digest_of_size(1), ())];
        let batches = pack(items, 1000);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_pack_empty() {
        assert!(pack::<()>(Vec::new(), 10).is_empty());
    }

    #[test]
    fn test_report_summary() {
        let mut report = DispatchReport::default();
        report.uploaded.push(Digest::from_content(b"a"));
        report.failures.push(ItemFailure::new(
            Digest::from_content(b"b"),
            FailureKind::NotFound,
            "gone",
        ));
        assert!(!report.is_success());
        assert!(report.summary().starts_with("1 uploaded, 0 already present"));
        assert!(report.failure(&Digest::from_content(b"b")).is_some());
    }

    #[tokio::test]
    async fn test_writer_cleans_up_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial");
        let target = DownloadTarget {
            keep_in_memory: false,
            files: vec![path.clone()],
        };

        let digest = Digest::from_content(b"0123456789");
        let (tx, rx) = mpsc::channel(4);
        let writer = spawn_writer(digest, &target, rx);
        tx.send(Bytes::from_static(b"01234")).await.unwrap();
        drop(tx);

        let result = writer.await.unwrap();
        assert!(matches!(result, Err(CasError::IncompleteBlob { .. })));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_writer_keeps_content_in_memory() {
        let target = DownloadTarget {
            keep_in_memory: true,
            files: Vec::new(),
        };
        let digest = Digest::from_content(b"0123456789");
        let (tx, rx) = mpsc::channel(4);
        let writer = spawn_writer(digest, &target, rx);
        tx.send(Bytes::from_static(b"01234")).await.unwrap();
        tx.send(Bytes::from_static(b"56789")).await.unwrap();
        drop(tx);

        let content = writer.await.unwrap().unwrap();
        assert_eq!(content.as_deref(), Some(&b"0123456789"[..]));
    }
}
