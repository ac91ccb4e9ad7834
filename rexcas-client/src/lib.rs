//! rexcas Client
//!
//! The transfer engine that moves blobs between local files and a remote
//! content-addressable store:
//! - `BatchDispatcher`: bounded-concurrency batching and streaming with
//!   retries, per-RPC timeouts and per-item failure reporting
//! - `Uploader` / `Downloader`: directory trees to and from the store
//! - `CasRpc`: the RPC boundary, with `LocalCas` as an in-process loopback

pub mod config;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod local;
pub mod metrics;
pub mod retry;
pub mod rpc;
pub mod upload;

pub use config::{parse_duration, ClientConfig, RetryPolicy, RpcKind, RpcTimeouts};
pub use dispatcher::{
    BatchDispatcher, DispatchReport, DownloadSink, TransferRequest, UploadItem, UploadSource,
};
pub use download::{DownloadOutcome, Downloader};
pub use error::{DispatchError, FailureKind, ItemFailure, Result, TransferError};
pub use local::LocalCas;
pub use rpc::{BlobResult, ByteStream, CasRpc, ChunkStream};
pub use upload::{PreparedUpload, UploadOutcome, Uploader};
