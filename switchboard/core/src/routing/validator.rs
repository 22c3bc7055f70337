//! Parallel Validator
//!
//! Probes every constructed backend with `initialize` at once, under one
//! shared deadline, and reports every failure rather than the first.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::error::format_failures;

/// Reason recorded for probes still running at the deadline
pub const DEADLINE_EXCEEDED: &str = "validation deadline exceeded";

/// One or more backends failed their startup probe
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Backend validation failed for {} backend(s): {}", .failures.len(), format_failures(.failures))]
pub struct ValidationError {
    /// `(backend id, reason)` pairs, sorted by id
    pub failures: Vec<(String, String)>,
}

impl ValidationError {
    /// Ids of the backends that failed
    pub fn backend_ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(id, _)| id.as_str())
    }
}

/// Concurrent startup prober
#[derive(Clone, Copy, Debug)]
pub struct ParallelValidator {
    timeout: Duration,
}

impl ParallelValidator {
    /// Validator whose probes share one `timeout` window
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Probe all backends; `Ok` only if every probe passed
    pub async fn validate(
        &self,
        backends: &[(String, Arc<dyn Backend>)],
    ) -> Result<(), ValidationError> {
        let deadline = Instant::now() + self.timeout;

        let probes = backends.iter().map(|(id, backend)| async move {
            match tokio::time::timeout_at(deadline, backend.initialize()).await {
                Ok(Ok(())) => {
                    tracing::debug!(backend = %id, "Backend validated");
                    None
                }
                Ok(Err(e)) => {
                    tracing::warn!(backend = %id, error = %e, "Backend validation failed");
                    Some((id.clone(), e.to_string()))
                }
                Err(_) => {
                    tracing::warn!(backend = %id, "Backend validation timed out");
                    Some((id.clone(), DEADLINE_EXCEEDED.to_string()))
                }
            }
        });

        let mut failures: Vec<(String, String)> =
            join_all(probes).await.into_iter().flatten().collect();
        if failures.is_empty() {
            return Ok(());
        }

        failures.sort();
        Err(ValidationError { failures })
    }
}
