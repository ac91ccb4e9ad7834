//! Client configuration
//!
//! Everything the dispatcher, chunker and tree walker need is carried in one
//! explicit, validated [`ClientConfig`], so independent clients with
//! different settings can coexist in a process. Loaded from TOML, then
//! environment overrides, then validated before any I/O happens.

use rexcas_core::error::{CasError, Result};
use rexcas_core::{
    ChunkerConfig, DEFAULT_CHUNK_SIZE, DEFAULT_INLINE_THRESHOLD, DEFAULT_MAX_TREE_DEPTH,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default number of in-flight batch/stream operations
pub const DEFAULT_CAS_CONCURRENCY: usize = 500;

/// Default ceiling for the cumulative size of one batch request
pub const DEFAULT_MAX_BATCH_SIZE: u64 = 4 * 1024 * 1024; // 4 MiB

/// Blobs above this size are streamed instead of batched
pub const DEFAULT_LARGE_BLOB_THRESHOLD: u64 = 1024 * 1024; // 1 MiB

/// The RPC operations a timeout can be configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RpcKind {
    FindMissingBlobs,
    BatchReadBlobs,
    BatchUpdateBlobs,
    /// Streaming read of one blob
    Read,
    /// Streaming write of one blob
    Write,
    QueryWriteStatus,
    GetTree,
}

impl RpcKind {
    pub const ALL: [RpcKind; 7] = [
        RpcKind::FindMissingBlobs,
        RpcKind::BatchReadBlobs,
        RpcKind::BatchUpdateBlobs,
        RpcKind::Read,
        RpcKind::Write,
        RpcKind::QueryWriteStatus,
        RpcKind::GetTree,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RpcKind::FindMissingBlobs => "FindMissingBlobs",
            RpcKind::BatchReadBlobs => "BatchReadBlobs",
            RpcKind::BatchUpdateBlobs => "BatchUpdateBlobs",
            RpcKind::Read => "Read",
            RpcKind::Write => "Write",
            RpcKind::QueryWriteStatus => "QueryWriteStatus",
            RpcKind::GetTree => "GetTree",
        }
    }

    fn default_timeout(&self) -> Option<Duration> {
        match self {
            RpcKind::FindMissingBlobs | RpcKind::QueryWriteStatus => Some(Duration::from_secs(20)),
            RpcKind::BatchReadBlobs | RpcKind::BatchUpdateBlobs | RpcKind::GetTree => {
                Some(Duration::from_secs(60))
            }
            RpcKind::Read | RpcKind::Write => Some(Duration::from_secs(300)),
        }
    }
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RpcKind {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self> {
        RpcKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| CasError::InvalidConfig(format!("unknown RPC name {:?}", s)))
    }
}

/// Parse a duration such as `500ms`, `10s`, `1m30s` or `1.5h`.
///
/// `0` means "no timeout" and yields `None`.
pub fn parse_duration(s: &str) -> Result<Option<Duration>> {
    let invalid = |reason: &str| CasError::InvalidConfig(format!("invalid duration {:?}: {}", s, reason));

    let s = s.trim();
    if s == "0" {
        return Ok(None);
    }
    if s.is_empty() {
        return Err(invalid("empty"));
    }

    const UNITS: [(&str, f64); 7] = [
        ("ns", 1.0),
        ("us", 1e3),
        ("µs", 1e3),
        ("ms", 1e6),
        ("s", 1e9),
        ("m", 60e9),
        ("h", 3600e9),
    ];

    let mut rest = s;
    let mut nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("bad number"))?;
        rest = &rest[number_len..];

        let (unit, scale) = UNITS
            .iter()
            .find(|(unit, _)| rest.starts_with(unit))
            .ok_or_else(|| invalid("missing or unknown unit"))?;
        nanos += value * scale;
        rest = &rest[unit.len()..];
    }

    if nanos < 1.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_nanos(nanos as u64)))
}

/// Effective timeout for every RPC kind, fully resolved.
///
/// Built once from defaults plus overrides; `None` means no timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcTimeouts {
    timeouts: BTreeMap<RpcKind, Option<Duration>>,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            timeouts: RpcKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_timeout()))
                .collect(),
        }
    }
}

impl RpcTimeouts {
    /// The same timeout for every kind
    pub fn uniform(timeout: Option<Duration>) -> Self {
        Self {
            timeouts: RpcKind::ALL.iter().map(|kind| (*kind, timeout)).collect(),
        }
    }

    pub fn get(&self, kind: RpcKind) -> Option<Duration> {
        self.timeouts.get(&kind).copied().flatten()
    }

    pub fn set(&mut self, kind: RpcKind, timeout: Option<Duration>) {
        self.timeouts.insert(kind, timeout);
    }

    pub fn iter(&self) -> impl Iterator<Item = (RpcKind, Option<Duration>)> + '_ {
        self.timeouts.iter().map(|(k, v)| (*k, *v))
    }

    /// Apply `name=duration` overrides.
    ///
    /// A `default` entry replaces the timeout of every kind that has no
    /// explicit override of its own.
    pub fn with_overrides<'a>(
        mut self,
        overrides: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self> {
        let mut default = None;
        let mut explicit = Vec::new();
        for (name, value) in overrides {
            let timeout = parse_duration(value)?;
            if name == "default" {
                default = Some(timeout);
            } else {
                explicit.push((name.parse::<RpcKind>()?, timeout));
            }
        }

        if let Some(timeout) = default {
            for kind in RpcKind::ALL {
                self.set(kind, timeout);
            }
        }
        for (kind, timeout) in explicit {
            self.set(kind, timeout);
        }
        Ok(self)
    }
}

/// Split a `name=value,name=value` flag into pairs
pub fn parse_override_list(spec: &str) -> Result<Vec<(String, String)>> {
    spec.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (name, value) = item.split_once('=').ok_or_else(|| {
                CasError::InvalidConfig(format!("expected name=duration, got {:?}", item))
            })?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per job, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Retries allowed across all jobs of one dispatch before it is aborted
    pub retry_budget: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            retry_budget: 1_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (starting at 1)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CasError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(CasError::InvalidConfig(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(CasError::InvalidConfig(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Transfer engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum simultaneous in-flight batch/stream operations
    pub concurrency_limit: usize,

    /// Maximum cumulative byte size of one batch request
    pub max_batch_size: u64,

    /// Blobs larger than this are streamed individually
    pub large_blob_threshold: u64,

    /// Maximum payload of one streamed chunk
    pub chunk_size: usize,

    /// Files at or below this size are read whole instead of streamed from disk
    pub inline_threshold: u64,

    /// Retry behaviour for transient failures
    pub retry: RetryPolicy,

    /// Treat every blob as missing if the existence query fails
    pub assume_missing_on_presence_failure: bool,

    /// Maximum directory nesting accepted from the server
    pub max_tree_depth: usize,

    /// Per-RPC timeout overrides: RPC name (or `default`) to duration,
    /// `0` disabling the timeout
    pub rpc_timeouts: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CAS_CONCURRENCY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            large_blob_threshold: DEFAULT_LARGE_BLOB_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            retry: RetryPolicy::default(),
            assume_missing_on_presence_failure: false,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
            rpc_timeouts: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| CasError::unreadable(path, e))?;
        toml::from_str(&content).map_err(|e| {
            CasError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply `REXCAS_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = std::env::var("REXCAS_CAS_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.concurrency_limit = v;
        }

        if let Some(v) = std::env::var("REXCAS_MAX_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.max_batch_size = v;
        }

        if let Ok(spec) = std::env::var("REXCAS_RPC_TIMEOUTS") {
            if let Err(e) = self.apply_rpc_timeouts(&spec) {
                warn!(error = %e, "Ignoring REXCAS_RPC_TIMEOUTS");
            }
        }

        self
    }

    /// Merge a `name=duration,...` override list into `rpc_timeouts`
    pub fn apply_rpc_timeouts(&mut self, spec: &str) -> Result<()> {
        let pairs = parse_override_list(spec)?;
        // Reject bad entries before touching the map
        RpcTimeouts::default().with_overrides(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        self.rpc_timeouts.extend(pairs);
        Ok(())
    }

    /// Resolve the effective per-RPC timeouts
    pub fn resolved_timeouts(&self) -> Result<RpcTimeouts> {
        RpcTimeouts::default().with_overrides(
            self.rpc_timeouts
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }

    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: self.chunk_size,
            inline_threshold: self.inline_threshold,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(CasError::InvalidConfig(
                "concurrency_limit must be positive".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(CasError::InvalidConfig(
                "max_batch_size must be positive".to_string(),
            ));
        }
        if self.large_blob_threshold == 0 || self.large_blob_threshold > self.max_batch_size {
            return Err(CasError::InvalidConfig(format!(
                "large_blob_threshold must be in 1..={} (max_batch_size), got {}",
                self.max_batch_size, self.large_blob_threshold
            )));
        }
        if self.max_tree_depth == 0 {
            return Err(CasError::InvalidConfig(
                "max_tree_depth must be positive".to_string(),
            ));
        }
        self.chunker_config().validate()?;
        self.retry.validate()?;
        self.resolved_timeouts()?;
        Ok(())
    }
}
