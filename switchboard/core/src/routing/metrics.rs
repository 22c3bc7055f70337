//! Backend Metrics
//!
//! Append-only log of per-call events and the summaries derived from it:
//! - Request counts by outcome (success, failure, retry)
//! - Latency averages and order statistics (p50, p95)
//! - Token usage
//!
//! Summaries are recomputed on every query and never stored. The log lives
//! for the process lifetime; [`MetricsCollector::flush`] hands a copy to an
//! external [`MetricsSink`] when one is attached.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::Role;

// ============================================================================
// Events
// ============================================================================

/// Outcome of one backend call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Success,
    Failure,
    /// A failed attempt that was retried
    Retry,
}

/// One recorded backend call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    /// Backend that served the call
    pub backend_id: String,
    /// Role the call was made for
    pub role: Role,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// Wall time of the attempt
    pub latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub status: MetricStatus,
    /// Failure text for `failure` and `retry` events
    pub error: Option<String>,
}

impl MetricEvent {
    /// Successful call stamped now
    pub fn success(backend_id: impl Into<String>, role: Role, latency_ms: u64) -> Self {
        Self {
            backend_id: backend_id.into(),
            role,
            timestamp: Utc::now(),
            latency_ms,
            prompt_tokens: 0,
            completion_tokens: 0,
            status: MetricStatus::Success,
            error: None,
        }
    }

    /// Failed call stamped now
    pub fn failure(
        backend_id: impl Into<String>,
        role: Role,
        latency_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: MetricStatus::Failure,
            error: Some(error.into()),
            ..Self::success(backend_id, role, latency_ms)
        }
    }

    /// Failed attempt that will be retried, stamped now
    pub fn retry(
        backend_id: impl Into<String>,
        role: Role,
        latency_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: MetricStatus::Retry,
            ..Self::failure(backend_id, role, latency_ms, error)
        }
    }

    /// Set token counts
    #[must_use]
    pub fn with_tokens(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self
    }

    /// Override the timestamp
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// Filter & Summary
// ============================================================================

/// Which events a summary covers. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsFilter {
    /// Only events from this backend
    pub backend_id: Option<String>,
    /// Only events for this role
    pub role: Option<Role>,
    /// Only events at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl MetricsFilter {
    /// Match everything
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one backend
    #[must_use]
    pub fn backend(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    /// Restrict to one role
    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Restrict to events at or after `since`
    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    fn matches(&self, event: &MetricEvent) -> bool {
        self.backend_id
            .as_deref()
            .map_or(true, |id| event.backend_id == id)
            && self.role.map_or(true, |role| event.role == role)
            && self.since.map_or(true, |since| event.timestamp >= since)
    }
}

/// Aggregate over a filtered set of events
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    /// Matching events of any status
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub retry_count: u64,
    /// Fraction in `[0, 1]`
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    /// `sorted[floor(n * 0.5)]` over event latencies
    pub p50_latency_ms: u64,
    /// `sorted[floor(n * 0.95)]`, clamped to the last element
    pub p95_latency_ms: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub avg_tokens_per_request: f64,
}

impl MetricsSummary {
    fn from_events(events: &[&MetricEvent]) -> Self {
        if events.is_empty() {
            return Self::default();
        }

        let mut summary = Self::default();
        let mut latencies = Vec::with_capacity(events.len());
        let mut latency_sum: u64 = 0;

        for event in events {
            summary.total_requests += 1;
            match event.status {
                MetricStatus::Success => summary.success_count += 1,
                MetricStatus::Failure => summary.failure_count += 1,
                MetricStatus::Retry => summary.retry_count += 1,
            }
            summary.total_prompt_tokens += event.prompt_tokens;
            summary.total_completion_tokens += event.completion_tokens;
            latency_sum = latency_sum.saturating_add(event.latency_ms);
            latencies.push(event.latency_ms);
        }

        let total = summary.total_requests as f64;
        summary.total_tokens = summary.total_prompt_tokens + summary.total_completion_tokens;
        summary.success_rate = summary.success_count as f64 / total;
        summary.avg_latency_ms = latency_sum as f64 / total;
        summary.avg_tokens_per_request = summary.total_tokens as f64 / total;

        latencies.sort_unstable();
        summary.p50_latency_ms = percentile(&latencies, 0.5);
        summary.p95_latency_ms = percentile(&latencies, 0.95);
        summary
    }
}

/// Index-clamped order statistic over ascending `sorted`: `sorted[floor(n*p)]`
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0;
    };
    let index = ((sorted.len() as f64 * p) as usize).min(last);
    sorted[index]
}

// ============================================================================
// Sink
// ============================================================================

/// External destination for the event log (e.g. an on-disk operation log)
pub trait MetricsSink: Send + Sync {
    /// Persist a batch of events
    fn flush(&self, events: &[MetricEvent]) -> anyhow::Result<()>;
}

// ============================================================================
// Collector
// ============================================================================

/// Thread-safe append-only event store
#[derive(Default)]
pub struct MetricsCollector {
    events: RwLock<Vec<MetricEvent>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("events", &self.len())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl MetricsCollector {
    /// Collector without a sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector that flushes to `sink`
    #[must_use]
    pub fn with_sink(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            sink: Some(sink),
        }
    }

    /// Append one event
    pub fn record(&self, event: MetricEvent) {
        self.events.write().push(event);
    }

    /// Summarize the events `filter` matches
    pub fn summarize(&self, filter: &MetricsFilter) -> MetricsSummary {
        let events = self.events.read();
        let matching: Vec<&MetricEvent> = events.iter().filter(|e| filter.matches(e)).collect();
        MetricsSummary::from_events(&matching)
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Copy of the full log
    pub fn snapshot(&self) -> Vec<MetricEvent> {
        self.events.read().clone()
    }

    /// Hand the log to the sink, if any
    pub fn flush(&self) -> anyhow::Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let events = self.snapshot();
        tracing::debug!(events = events.len(), "Flushing metrics");
        sink.flush(&events)
    }
}
