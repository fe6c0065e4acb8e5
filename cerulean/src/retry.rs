//! Retry policies for transient service failures

use std::time::Duration;

use crate::error::TableError;

/// Server error codes that indicate a transient condition worth retrying.
const TRANSIENT_ERROR_CODES: [&str; 4] = [
    "InternalError",
    "OperationTimedOut",
    "ServerBusy",
    "TableBeingDeleted",
];

/// Decides whether and how long to wait before retrying a failed operation.
///
/// `delays` yields the full retry schedule up front; each consumed value is
/// the wait before the next attempt, so an empty schedule means no retries.
/// Precondition failures are a correctness signal, not a transient fault,
/// and are never classified as retryable.
pub trait RetryPolicy: Send + Sync {
    /// Whether the given failure is worth retrying.
    ///
    /// The default classification treats server-reported errors by code
    /// (only the service's transient codes qualify: internal error, timeout,
    /// busy, table being deleted) and everything else, transport-level or
    /// unrecognized, as retryable. Validation errors are raised before any
    /// network call and never reach this classification.
    fn should_retry(&self, error: &TableError) -> bool {
        match error {
            TableError::Protocol { code, .. } => TRANSIENT_ERROR_CODES.contains(&code.as_str()),
            _ => true,
        }
    }

    /// The waits between attempts, in order. Finite and possibly empty.
    fn delays(&self) -> Vec<Duration>;
}

/// The default policy: never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetries;

impl RetryPolicy for NoRetries {
    fn should_retry(&self, _error: &TableError) -> bool {
        false
    }

    fn delays(&self) -> Vec<Duration> {
        Vec::new()
    }
}

/// Retry a fixed number of times with a constant interval.
#[derive(Debug, Clone, Copy)]
pub struct FixedRetry {
    retries: usize,
    interval: Duration,
}

impl FixedRetry {
    pub fn new(retries: usize, interval: Duration) -> Self {
        Self { retries, interval }
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl RetryPolicy for FixedRetry {
    fn delays(&self) -> Vec<Duration> {
        vec![self.interval; self.retries]
    }
}
