//! Retry Engine
//!
//! Runs an opaque fallible async operation under a [`RetryPolicy`]: bounded
//! attempts, exponential delays capped at `max_backoff`, and a cancellation
//! token that preempts both the call in flight and the wait between calls.
//!
//! The engine has no opinion on which failures are worth retrying. Callers
//! that care pass a predicate to [`RetryEngine::run_if`]; the registry passes
//! [`BackendError::is_retryable`](crate::error::BackendError::is_retryable).
//!
//! ```text
//! attempt 0 ──fail──► wait initial ──► attempt 1 ──fail──► wait initial×m ──► ...
//!     │                   │                                       │
//!     └─ cancelled ───────┴─────────── cancelled ─────────────────┴──► Cancelled
//! ```

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{duration_ms, RetryPolicy};

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Cancellation was observed before, between or during attempts
    #[error("{operation} cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Operation name
        operation: String,
        /// Attempts started before cancellation
        attempts: u32,
        /// Last failure seen, if any attempt completed
        last: Option<E>,
    },

    /// Every attempt failed
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        /// Operation name
        operation: String,
        /// Total attempts made
        attempts: u32,
        /// Final failure
        source: E,
    },

    /// The predicate rejected the failure, so no retry was made
    #[error("{operation} failed permanently after {attempts} attempt(s): {source}")]
    Permanent {
        /// Operation name
        operation: String,
        /// Total attempts made
        attempts: u32,
        /// The rejected failure
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    /// Name of the operation
    pub fn operation(&self) -> &str {
        match self {
            Self::Cancelled { operation, .. }
            | Self::Exhausted { operation, .. }
            | Self::Permanent { operation, .. } => operation,
        }
    }

    /// Last underlying failure, if any attempt completed
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Cancelled { last, .. } => last.as_ref(),
            Self::Exhausted { source, .. } | Self::Permanent { source, .. } => Some(source),
        }
    }

    /// Whether the caller's token ended the run
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Executes operations under a retry policy
#[derive(Clone, Debug, Default)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    /// Create an engine for `policy`
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in force
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry every failure until the budget runs out
    pub async fn run<F, Fut, T, E>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_observed(operation, cancel, op, |_| true, |_, _, _| {})
            .await
    }

    /// Retry only failures `is_retryable` accepts
    pub async fn run_if<F, Fut, T, E, P>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.run_observed(operation, cancel, op, is_retryable, |_, _, _| {})
            .await
    }

    /// Like [`run_if`](Self::run_if), calling `on_retry(attempt, error, delay)`
    /// before each wait
    pub async fn run_observed<F, Fut, T, E, P, O>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
        is_retryable: P,
        mut on_retry: O,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        O: FnMut(u32, &E, Duration),
    {
        let cancelled = |attempts: u32, last: Option<E>| RetryError::Cancelled {
            operation: operation.to_string(),
            attempts,
            last,
        };

        if cancel.is_cancelled() {
            return Err(cancelled(0, None));
        }

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(attempt + 1, None)),
                outcome = op() => outcome,
            };
            attempt += 1;

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempts = attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if cancel.is_cancelled() {
                return Err(cancelled(attempt, Some(err)));
            }
            if !is_retryable(&err) {
                return Err(RetryError::Permanent {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }
            if attempt > self.policy.max_attempts {
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.policy.backoff_for_attempt(attempt - 1);
            tracing::warn!(
                operation,
                attempt,
                delay_ms = duration_ms(delay),
                "Attempt failed, retrying"
            );
            on_retry(attempt, &err, delay);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(attempt, Some(err))),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
