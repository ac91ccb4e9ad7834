//! Retry bookkeeping shared by every job of a dispatch

use crate::config::RetryPolicy;
use crate::error::{Result, TransferError};
use crate::metrics::names;
use metrics::counter;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retries remaining across a whole dispatch
#[derive(Debug)]
pub struct RetryBudget {
    limit: u32,
    used: AtomicU32,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: AtomicU32::new(0),
        }
    }

    /// Take one retry, or report that none are left
    pub fn try_consume(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// Attempt counter for one job
pub struct Retrier {
    policy: RetryPolicy,
    budget: Arc<RetryBudget>,
    cancel: CancellationToken,
    attempt: u32,
}

impl Retrier {
    pub fn new(policy: RetryPolicy, budget: Arc<RetryBudget>, cancel: CancellationToken) -> Self {
        Self {
            policy,
            budget,
            cancel,
            attempt: 1,
        }
    }

    /// Attempts made so far, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decide whether to try again after `err`, sleeping through the backoff.
    ///
    /// `Ok(false)` means the job should give up and report `err`. The shared
    /// budget running dry or cancellation is returned as an error that ends
    /// the whole dispatch.
    pub async fn backoff(&mut self, err: &TransferError) -> Result<bool> {
        if !err.is_transient() || self.attempt >= self.policy.max_attempts {
            return Ok(false);
        }
        if !self.budget.try_consume() {
            return Err(TransferError::RetryBudgetExhausted(self.budget.limit()));
        }

        let delay = self.policy.backoff(self.attempt);
        warn!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying operation"
        );
        counter!(names::RETRIES).increment(1);
        self.attempt += 1;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcKind;
    use tonic::Status;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..Default::default()
        }
    }

    fn transient() -> TransferError {
        TransferError::rpc(RpcKind::Read, Status::unavailable("flaky"))
    }

    #[test]
    fn test_budget_consumption() {
        let budget = RetryBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let budget = Arc::new(RetryBudget::new(100));
        let mut retrier = Retrier::new(policy(3), budget.clone(), CancellationToken::new());

        assert!(retrier.backoff(&transient()).await.unwrap());
        assert!(retrier.backoff(&transient()).await.unwrap());
        assert!(!retrier.backoff(&transient()).await.unwrap());
        assert_eq!(retrier.attempt(), 3);
        assert_eq!(budget.used(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let budget = Arc::new(RetryBudget::new(100));
        let mut retrier = Retrier::new(policy(5), budget.clone(), CancellationToken::new());
        let err = TransferError::rpc(RpcKind::Read, Status::not_found("gone"));

        assert!(!retrier.backoff(&err).await.unwrap());
        assert_eq!(budget.used(), 0);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_fatal() {
        let budget = Arc::new(RetryBudget::new(1));
        let mut a = Retrier::new(policy(5), budget.clone(), CancellationToken::new());
        let mut b = Retrier::new(policy(5), budget, CancellationToken::new());

        assert!(a.backoff(&transient()).await.unwrap());
        let err = b.backoff(&transient()).await.unwrap_err();
        assert!(matches!(err, TransferError::RetryBudgetExhausted(1)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let slow = RetryPolicy {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..Default::default()
        };
        let mut retrier = Retrier::new(slow, Arc::new(RetryBudget::new(10)), cancel.clone());
        cancel.cancel();

        let err = retrier.backoff(&transient()).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
