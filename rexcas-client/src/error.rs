//! Transfer error types

use crate::config::RpcKind;
use crate::dispatcher::DispatchReport;
use rexcas_core::{CasError, Digest};
use std::fmt;
use thiserror::Error;
use tonic::{Code, Status};

/// Errors raised while moving blobs to or from the remote store
#[derive(Error, Debug)]
pub enum TransferError {
    // ===== Remote Errors =====
    #[error("{kind} failed: {status}")]
    Rpc { kind: RpcKind, status: Status },

    #[error("{0} timed out")]
    Timeout(RpcKind),

    #[error("Presence check failed: {0}")]
    PresenceCheckFailed(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    // ===== Dispatch Errors =====
    #[error("Retry budget of {0} retries exhausted")]
    RetryBudgetExhausted(u32),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    ItemFailed(ItemFailure),

    // ===== Local Errors =====
    #[error(transparent)]
    Local(#[from] CasError),
}

impl TransferError {
    pub fn rpc(kind: RpcKind, status: Status) -> Self {
        TransferError::Rpc { kind, status }
    }

    /// GRPC code of a remote failure
    pub fn code(&self) -> Option<Code> {
        match self {
            TransferError::Rpc { status, .. } => Some(status.code()),
            TransferError::Timeout(_) => Some(Code::DeadlineExceeded),
            _ => None,
        }
    }

    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Rpc { status, .. } => is_transient_code(status.code()),
            TransferError::Timeout(_) => true,
            // A file modified mid-read
            TransferError::Local(CasError::FileUnreadable { source, .. }) => {
                source.kind() == std::io::ErrorKind::Interrupted
            }
            _ => false,
        }
    }

    /// Aborts the whole dispatch rather than a single item
    pub fn is_fatal(&self) -> bool {
        match self {
            TransferError::Rpc { status, .. } => matches!(
                status.code(),
                Code::Unauthenticated | Code::PermissionDenied
            ),
            TransferError::RetryBudgetExhausted(_) | TransferError::PresenceCheckFailed(_) => true,
            _ => false,
        }
    }
}

/// Status codes that are worth retrying
pub fn is_transient_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable
            | Code::DeadlineExceeded
            | Code::Aborted
            | Code::ResourceExhausted
            | Code::Unknown
    )
}

/// Why a single digest could not be transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Transient failures persisted through every attempt
    RetriesExhausted,
    /// The store does not hold the blob
    NotFound,
    /// Received content does not match its digest
    Corrupt,
    /// Permanently refused by the store
    Rejected,
    /// Local read or write failed
    Local,
    Cancelled,
    /// The dispatch was aborted before this item completed
    Fatal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::RetriesExhausted => "retries exhausted",
            FailureKind::NotFound => "not found",
            FailureKind::Corrupt => "corrupt",
            FailureKind::Rejected => "rejected",
            FailureKind::Local => "local error",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Fatal => "aborted",
        };
        f.write_str(s)
    }
}

/// Per-digest failure record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub digest: Digest,
    pub kind: FailureKind,
    pub message: String,
}

impl ItemFailure {
    pub fn new(digest: Digest, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            digest,
            kind,
            message: message.into(),
        }
    }

    /// Classify the error that ended the item's last attempt
    pub fn from_error(digest: Digest, error: &TransferError) -> Self {
        let kind = match error {
            e if e.is_transient() => FailureKind::RetriesExhausted,
            e if e.is_fatal() => FailureKind::Fatal,
            TransferError::Rpc { status, .. } => match status.code() {
                Code::NotFound => FailureKind::NotFound,
                Code::DataLoss => FailureKind::Corrupt,
                _ => FailureKind::Rejected,
            },
            TransferError::MalformedResponse(_) => FailureKind::Corrupt,
            TransferError::Cancelled => FailureKind::Cancelled,
            TransferError::ItemFailed(failure) => failure.kind,
            // The store sent content that does not match the digest
            TransferError::Local(
                CasError::DigestMismatch { .. } | CasError::BlobOverflow { .. },
            ) => FailureKind::Corrupt,
            TransferError::Local(_) => FailureKind::Local,
            _ => FailureKind::Rejected,
        };
        Self::new(digest, kind, error.to_string())
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.digest, self.kind, self.message)
    }
}

/// A dispatch that was aborted, with whatever completed before the abort
#[derive(Error, Debug)]
#[error("dispatch aborted: {error}")]
pub struct DispatchError {
    #[source]
    pub error: TransferError,
    pub partial: DispatchReport,
}

impl DispatchError {
    pub fn new(error: TransferError, partial: DispatchReport) -> Self {
        Self { error, partial }
    }
}

impl From<TransferError> for DispatchError {
    fn from(error: TransferError) -> Self {
        Self::new(error, DispatchReport::default())
    }
}

impl From<CasError> for DispatchError {
    fn from(error: CasError) -> Self {
        Self::new(TransferError::Local(error), DispatchReport::default())
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let unavailable = TransferError::rpc(RpcKind::Read, Status::unavailable("down"));
        assert!(unavailable.is_transient());
        assert!(!unavailable.is_fatal());

        let denied = TransferError::rpc(RpcKind::Write, Status::permission_denied("no"));
        assert!(denied.is_fatal());
        assert!(!denied.is_transient());

        let not_found = TransferError::rpc(RpcKind::Read, Status::not_found("gone"));
        assert!(!not_found.is_transient());
        assert!(!not_found.is_fatal());

        assert!(TransferError::Timeout(RpcKind::GetTree).is_transient());
        assert!(TransferError::RetryBudgetExhausted(3).is_fatal());
        assert!(!TransferError::Cancelled.is_transient());
    }

    #[test]
    fn test_item_failure_kind() {
        let digest = Digest::from_content(b"x");
        let cases = [
            (
                TransferError::rpc(RpcKind::Read, Status::unavailable("down")),
                FailureKind::RetriesExhausted,
            ),
            (
                TransferError::rpc(RpcKind::BatchReadBlobs, Status::not_found("gone")),
                FailureKind::NotFound,
            ),
            (
                TransferError::rpc(RpcKind::BatchUpdateBlobs, Status::invalid_argument("bad")),
                FailureKind::Rejected,
            ),
            (
                TransferError::Local(CasError::DigestMismatch {
                    expected: digest,
                    actual: Digest::empty(),
                }),
                FailureKind::Corrupt,
            ),
            (
                TransferError::Local(CasError::BlobOverflow {
                    end: 12,
                    expected: 10,
                }),
                FailureKind::Corrupt,
            ),
            (TransferError::Cancelled, FailureKind::Cancelled),
        ];
        for (error, kind) in cases {
            let failure = ItemFailure::from_error(digest, &error);
            assert_eq!(failure.kind, kind, "{}", error);
            assert_eq!(failure.digest, digest);
        }
    }
}
