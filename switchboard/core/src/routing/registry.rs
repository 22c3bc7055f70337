//! Backend Registry
//!
//! Owns every backend handle and the role table. Built once from validated
//! configuration, then shared read-only across concurrent callers.
//!
//! # Selection
//!
//! For a role the registry prefers, in order:
//! 1. the primary, if registered
//! 2. the first registered fallback, in listed order
//! 3. the default backend
//!
//! Selection never retries; retrying is the job of [`Registry::execute`] (or
//! of the caller, through a [`RetryEngine`]).
//!
//! # Lifecycle
//!
//! ```text
//! validate config ─► construct handles ─► probe all (parallel) ─► ready
//!        │                  │                      │
//!        └──── error ───────┴──── error ───────────┴─► shut down what exists, fail
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::metrics::{MetricEvent, MetricsCollector, MetricsFilter, MetricsSummary};
use super::retry::{RetryEngine, RetryError};
use super::validator::ParallelValidator;
use crate::backend::{Backend, BackendFactory, BackendRequest, BackendResponse};
use crate::cache::prompt::PromptCache;
use crate::cache::response::{CachedBackend, ResponseCache, ResponseCacheStats};
use crate::config::{
    duration_ms, merge_parameters, BackendDescriptor, RegistryConfig, RetryPolicy, Role, RoleAssignment,
};
use crate::error::{BackendError, RegistryError};

/// Routing table plus the handles it routes to
pub struct Registry {
    backends: HashMap<String, Arc<dyn Backend>>,
    descriptors: HashMap<String, BackendDescriptor>,
    roles: HashMap<Role, RoleAssignment>,
    default_backend: Option<String>,
    retry: RetryEngine,
    metrics: Arc<MetricsCollector>,
    prompt_caches: HashMap<String, Arc<PromptCache>>,
    response_cache: Arc<ResponseCache>,
    shutdown_timeout: Duration,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("backends", &self.backend_ids())
            .field("roles", &self.roles.len())
            .field("default_backend", &self.default_backend)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Build a registry, probing every backend before returning
    pub async fn new(config: RegistryConfig, factory: &BackendFactory) -> Result<Self, RegistryError> {
        Self::with_collector(config, factory, MetricsCollector::new()).await
    }

    /// Like [`new`](Self::new) with a caller-supplied collector (e.g. one
    /// with a [`MetricsSink`](super::metrics::MetricsSink))
    pub async fn with_collector(
        config: RegistryConfig,
        factory: &BackendFactory,
        collector: MetricsCollector,
    ) -> Result<Self, RegistryError> {
        config.validate()?;

        let mut handles: Vec<(String, Arc<dyn Backend>)> = Vec::with_capacity(config.backends.len());
        for descriptor in &config.backends {
            let created = match factory.create(descriptor) {
                None => Err(RegistryError::UnknownBackendType {
                    id: descriptor.id.clone(),
                    kind: descriptor.kind.to_string(),
                }),
                Some(Err(source)) => Err(RegistryError::Construction {
                    id: descriptor.id.clone(),
                    source,
                }),
                Some(Ok(handle)) => Ok(handle),
            };
            match created {
                Ok(handle) => handles.push((descriptor.id.clone(), handle)),
                Err(e) => {
                    tracing::warn!(backend = %descriptor.id, error = %e, "Backend construction failed");
                    shutdown_all(&handles, config.shutdown_timeout()).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = ParallelValidator::new(config.validation_timeout())
            .validate(&handles)
            .await
        {
            shutdown_all(&handles, config.shutdown_timeout()).await;
            return Err(e.into());
        }

        let registry = Self::assemble(config, handles, collector);
        tracing::info!(
            backends = registry.backends.len(),
            roles = registry.roles.len(),
            "Backend registry ready"
        );
        Ok(registry)
    }

    /// Build from existing handles, skipping config validation and probing
    ///
    /// An embedding and test hook: none of the startup guarantees of
    /// [`new`](Self::new) apply. Handles are keyed by [`Backend::name`]; when
    /// two share a name the first is kept and the rest are dropped with a
    /// warning. Role entries may name ids that have no handle;
    /// [`select`](Self::select) then falls through to the next candidate.
    pub fn from_handles(config: RegistryConfig, handles: Vec<Arc<dyn Backend>>) -> Self {
        let mut keyed: Vec<(String, Arc<dyn Backend>)> = Vec::with_capacity(handles.len());
        for handle in handles {
            let id = handle.name().to_string();
            if keyed.iter().any(|(existing, _)| *existing == id) {
                tracing::warn!(backend = %id, "Duplicate backend handle ignored");
                continue;
            }
            keyed.push((id, handle));
        }
        Self::assemble(config, keyed, MetricsCollector::new())
    }

    fn assemble(
        config: RegistryConfig,
        handles: Vec<(String, Arc<dyn Backend>)>,
        collector: MetricsCollector,
    ) -> Self {
        // Disabled mode still counts lookups
        let response_cache = Arc::new(ResponseCache::new(config.cache.response_cache));

        let mut backends = HashMap::with_capacity(handles.len());
        let mut prompt_caches = HashMap::with_capacity(handles.len());
        for (id, handle) in handles {
            let handle: Arc<dyn Backend> =
                Arc::new(CachedBackend::new(handle, Arc::clone(&response_cache)));
            prompt_caches.insert(
                id.clone(),
                Arc::new(PromptCache::new(Arc::clone(&handle), config.cache.prompt_cache)),
            );
            backends.insert(id, handle);
        }

        Self {
            backends,
            descriptors: config
                .backends
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
            roles: config.roles.into_iter().map(|a| (a.role, a)).collect(),
            default_backend: config.default_backend,
            retry: RetryEngine::new(config.retry),
            metrics: Arc::new(collector),
            prompt_caches,
            response_cache,
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            shut_down: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// Pick the backend for `role`: primary, then fallbacks, then default
    pub fn select(&self, role: Role) -> Result<(Arc<dyn Backend>, String), RegistryError> {
        if let Some(assignment) = self.roles.get(&role) {
            if let Some(handle) = self.backends.get(&assignment.primary) {
                tracing::debug!(role = %role, backend = %assignment.primary, "Selected primary");
                return Ok((Arc::clone(handle), assignment.primary.clone()));
            }

            for id in &assignment.fallbacks {
                if let Some(handle) = self.backends.get(id) {
                    tracing::warn!(
                        role = %role,
                        primary = %assignment.primary,
                        backend = %id,
                        "Primary unavailable, using fallback"
                    );
                    return Ok((Arc::clone(handle), id.clone()));
                }
            }
        }

        if let Some(id) = &self.default_backend {
            if let Some(handle) = self.backends.get(id) {
                tracing::debug!(role = %role, backend = %id, "Selected default backend");
                return Ok((Arc::clone(handle), id.clone()));
            }
        }

        Err(RegistryError::NoBackendAvailable { role })
    }

    /// Handle for one backend id
    pub fn backend(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(id).cloned()
    }

    /// Registered ids, sorted
    pub fn backend_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn assignment(&self, role: Role) -> Option<&RoleAssignment> {
        self.roles.get(&role)
    }

    pub fn default_backend_id(&self) -> Option<&str> {
        self.default_backend.as_deref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Backend-global parameters with the role's overrides on top
    ///
    /// Overrides apply only when `backend_id` serves the role as primary or
    /// fallback.
    pub fn merged_parameters(&self, role: Role, backend_id: &str) -> Map<String, Value> {
        let global = self
            .descriptors
            .get(backend_id)
            .map(|d| d.parameters.clone())
            .unwrap_or_default();

        match self.roles.get(&role) {
            Some(assignment) if assignment.involves(backend_id) => {
                merge_parameters(&global, &assignment.overrides)
            }
            _ => global,
        }
    }

    /// Request for `role` on `backend_id` with merged sampling settings
    pub fn build_request(&self, role: Role, backend_id: &str, prompt: impl Into<String>) -> BackendRequest {
        BackendRequest::from_parameters(role, prompt, self.merged_parameters(role, backend_id))
    }

    /// Select, call with retries, and record metrics
    ///
    /// Only retryable error codes are retried. Each retried failure is
    /// recorded as a `retry` event, followed by one final `success` or
    /// `failure` event. A response that carries an `error` is still returned,
    /// but is recorded as a `failure`.
    pub async fn execute(
        &self,
        role: Role,
        prompt: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, RegistryError> {
        let (backend, backend_id) = self.select(role)?;
        let request = self.build_request(role, &backend_id, prompt);
        let attempt_started = Mutex::new(Instant::now());
        let elapsed_ms = || duration_ms(attempt_started.lock().elapsed());

        let result = self
            .retry
            .run_observed(
                &format!("{role} request to {backend_id}"),
                cancel,
                || {
                    *attempt_started.lock() = Instant::now();
                    backend.execute(&request)
                },
                BackendError::is_retryable,
                |_, err, _| {
                    self.record_metric(MetricEvent::retry(
                        &backend_id,
                        role,
                        elapsed_ms(),
                        err.to_string(),
                    ));
                },
            )
            .await;

        match result {
            Ok(response) => {
                let event = match &response.error {
                    None => MetricEvent::success(&backend_id, role, elapsed_ms()),
                    Some(reason) => {
                        tracing::warn!(backend = %backend_id, error = %reason, "Backend returned a partial response");
                        MetricEvent::failure(&backend_id, role, elapsed_ms(), reason.clone())
                    }
                };
                self.record_metric(event.with_tokens(
                    u64::from(response.prompt_tokens),
                    u64::from(response.completion_tokens),
                ));
                Ok(response)
            }
            Err(source) => {
                let reason = match &source {
                    RetryError::Cancelled { .. } => "cancelled".to_string(),
                    RetryError::Exhausted { source, .. } | RetryError::Permanent { source, .. } => {
                        source.to_string()
                    }
                };
                self.record_metric(MetricEvent::failure(&backend_id, role, elapsed_ms(), reason));
                Err(RegistryError::Execution { backend_id, source })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Metrics & Caches
    // ------------------------------------------------------------------------

    /// Append one event. Never fails.
    pub fn record_metric(&self, event: MetricEvent) {
        self.metrics.record(event);
    }

    /// Summary for one backend and role; all zeros when nothing matches
    pub fn query_metrics(
        &self,
        backend_id: &str,
        role: Role,
        since: Option<DateTime<Utc>>,
    ) -> MetricsSummary {
        self.metrics.summarize(&MetricsFilter {
            backend_id: Some(backend_id.to_string()),
            role: Some(role),
            since,
        })
    }

    /// Shared collector, for free-form filters
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Prompt-cache front for one backend
    pub fn prompt_cache(&self, backend_id: &str) -> Option<Arc<PromptCache>> {
        self.prompt_caches.get(backend_id).cloned()
    }

    /// Response cache counters; a disabled cache still counts every lookup
    /// as a miss
    pub fn response_cache_stats(&self) -> ResponseCacheStats {
        self.response_cache.stats()
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Shut every backend down and flush metrics
    ///
    /// Runs to completion, reporting every failure at the end. Later calls
    /// return `Ok(())` without doing anything.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("Registry already shut down");
            return Ok(());
        }

        let handles: Vec<(String, Arc<dyn Backend>)> = self
            .backends
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();
        let mut failures = shutdown_all(&handles, self.shutdown_timeout).await;

        if let Err(e) = self.metrics.flush() {
            tracing::warn!(error = %e, "Metrics flush failed");
            failures.push(("metrics".to_string(), e.to_string()));
        }

        if failures.is_empty() {
            tracing::info!(backends = handles.len(), "Backend registry shut down");
            Ok(())
        } else {
            tracing::warn!(failures = failures.len(), "Backend registry shut down with failures");
            Err(RegistryError::Shutdown { failures })
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Shut down every handle concurrently, each under its own timeout
async fn shutdown_all(handles: &[(String, Arc<dyn Backend>)], timeout: Duration) -> Vec<(String, String)> {
    let results = join_all(handles.iter().map(|(id, handle)| async move {
        match tokio::time::timeout(timeout, handle.shutdown()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                tracing::warn!(backend = %id, error = %e, "Backend shutdown failed");
                Some((id.clone(), e.to_string()))
            }
            Err(_) => {
                tracing::warn!(backend = %id, timeout_ms = duration_ms(timeout), "Backend shutdown timed out");
                Some((id.clone(), format!("shutdown timed out after {}ms", duration_ms(timeout))))
            }
        }
    }))
    .await;

    let mut failures: Vec<(String, String)> = results.into_iter().flatten().collect();
    failures.sort();
    failures
}
