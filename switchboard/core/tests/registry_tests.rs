//! Registry Integration Tests
//!
//! Drive the public API end to end with mock backends:
//!
//! 1. Construction - all-or-nothing validation, constructor lookup
//! 2. Selection - primary, fallback chain, default
//! 3. Execution - retries, classification, cancellation, metric events
//! 4. Shutdown - aggregation, timeouts, metrics flush
//! 5. Caching - response cache and prompt cache through the registry

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use switchboard_core::cache::{CacheTtl, CachedMessage};
use switchboard_core::{
    Backend, BackendDescriptor, BackendFactory, BackendType, CacheConfig, ErrorCode, MessageRole,
    MetricEvent, MetricStatus, MetricsCollector, MetricsFilter, MetricsSink, MockBackend,
    Registry, RegistryConfig, RegistryError, RetryError, RetryPolicy, Role, RoleAssignment,
};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

fn mock_descriptor(id: &str) -> BackendDescriptor {
    BackendDescriptor::new(id, BackendType::Mock, "mock-model")
}

fn two_backend_config() -> RegistryConfig {
    RegistryConfig::default()
        .with_backend(mock_descriptor("primary-a").with_parameter("temperature", 0.4))
        .with_backend(mock_descriptor("backup-b"))
        .with_role(
            RoleAssignment::new(Role::Coder, "primary-a")
                .with_fallbacks(["backup-b"])
                .with_override("temperature", 0.2),
        )
        .with_default_backend("backup-b")
}

/// Factory whose mock constructor hands each built backend to `built`
fn recording_factory(
    built: Arc<Mutex<Vec<Arc<MockBackend>>>>,
    customize: fn(&BackendDescriptor, MockBackend) -> MockBackend,
) -> BackendFactory {
    let mut factory = BackendFactory::new();
    factory.register(BackendType::Mock, move |descriptor| {
        let backend = Arc::new(customize(descriptor, MockBackend::from_descriptor(descriptor)));
        built.lock().push(Arc::clone(&backend));
        Ok(backend as Arc<dyn Backend>)
    });
    factory
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(10))
}

// ============================================================================
// 1. Construction
// ============================================================================

#[tokio::test]
async fn test_builds_from_builtin_factory() {
    let registry = assert_ok!(Registry::new(two_backend_config(), &BackendFactory::with_builtin()).await);
    assert_eq!(registry.backend_ids(), vec!["backup-b", "primary-a"]);
    assert_eq!(registry.default_backend_id(), Some("backup-b"));
    assert_eq!(registry.retry_policy(), &RetryPolicy::default());
}

#[tokio::test]
async fn test_failed_validation_fails_construction_and_names_every_backend() {
    let config = RegistryConfig::default()
        .with_backend(mock_descriptor("good"))
        .with_backend(mock_descriptor("bad-auth").with_parameter("fail_init", "401 invalid api key"))
        .with_backend(mock_descriptor("bad-net").with_parameter("fail_init", "connection refused"));

    let built = Arc::new(Mutex::new(Vec::new()));
    let factory = recording_factory(Arc::clone(&built), |_, backend| backend);

    let err = assert_err!(Registry::new(config, &factory).await);
    let RegistryError::Validation(validation) = err else {
        panic!("expected validation error");
    };
    assert_eq!(
        validation.backend_ids().collect::<Vec<_>>(),
        vec!["bad-auth", "bad-net"]
    );

    // Every constructed handle was probed, then shut down best-effort
    let built = built.lock();
    assert_eq!(built.len(), 3);
    assert!(built.iter().all(|b| b.init_count() == 1));
    assert!(built.iter().all(|b| b.shutdown_count() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_validation_deadline_is_shared() {
    let mut config = RegistryConfig::default()
        .with_backend(mock_descriptor("slow-a"))
        .with_backend(mock_descriptor("slow-b"));
    config.validation_timeout_ms = 200;

    let factory = recording_factory(Arc::new(Mutex::new(Vec::new())), |_, backend| {
        backend.with_init_delay(Duration::from_secs(5))
    });

    let started = tokio::time::Instant::now();
    let err = assert_err!(Registry::new(config, &factory).await);
    assert_eq!(started.elapsed(), Duration::from_millis(200));
    assert!(err.to_string().contains("validation deadline exceeded"));
}

#[tokio::test]
async fn test_unknown_backend_type() {
    let config = RegistryConfig::default()
        .with_backend(mock_descriptor("mock-one"))
        .with_backend(BackendDescriptor::new("claude-main", BackendType::Anthropic, "claude"));

    let err = assert_err!(Registry::new(config, &BackendFactory::with_builtin()).await);
    match err {
        RegistryError::UnknownBackendType { id, kind } => {
            assert_eq!(id, "claude-main");
            assert_eq!(kind, "anthropic");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_constructor_failure() {
    let mut factory = BackendFactory::new();
    factory.register(BackendType::Ollama, |_| {
        Err(switchboard_core::BackendError::classify("invalid endpoint url"))
    });
    let config = RegistryConfig::default()
        .with_backend(BackendDescriptor::new("local", BackendType::Ollama, "llama3"));

    let err = assert_err!(Registry::new(config, &factory).await);
    assert!(matches!(err, RegistryError::Construction { ref id, .. } if id == "local"));
}

#[tokio::test]
async fn test_config_errors_surface() {
    let config = RegistryConfig::default()
        .with_backend(mock_descriptor("mock-a").with_parameter("temperature", 3.0));
    let err = assert_err!(Registry::new(config, &BackendFactory::with_builtin()).await);
    assert!(matches!(err, RegistryError::Config(_)));
}

#[tokio::test]
async fn test_builds_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("switchboard.toml");
    std::fs::write(
        &path,
        r#"
default_backend = "mock-default"

[retry]
max_attempts = 2
initial_backoff_ms = 50

[[backends]]
id = "mock-default"
type = "mock"
model = "mock-model"

[backends.parameters]
response = "from toml"

[[roles]]
role = "planner"
primary = "mock-default"
"#,
    )
    .unwrap();

    let config = RegistryConfig::from_path(&path).unwrap();
    let registry = Registry::new(config, &BackendFactory::with_builtin())
        .await
        .unwrap();
    assert_eq!(registry.retry_policy().max_attempts, 2);

    let response = registry
        .execute(Role::Planner, "plan", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.text, "from toml");
}

// ============================================================================
// 2. Selection
// ============================================================================

#[test]
fn test_primary_wins_over_fallbacks() {
    let config = RegistryConfig::default()
        .with_role(RoleAssignment::new(Role::Reviewer, "a").with_fallbacks(["b", "c"]));
    let handles: Vec<Arc<dyn Backend>> = ["a", "b", "c"]
        .into_iter()
        .map(|id| Arc::new(MockBackend::new(id, "m")) as Arc<dyn Backend>)
        .collect();
    let registry = Registry::from_handles(config, handles);

    for _ in 0..10 {
        assert_eq!(registry.select(Role::Reviewer).unwrap().1, "a");
    }
}

#[test]
fn test_fallback_order() {
    let config = RegistryConfig::default()
        .with_role(RoleAssignment::new(Role::Reviewer, "gone").with_fallbacks(["a", "b"]));
    let registry = Registry::from_handles(config, vec![Arc::new(MockBackend::new("b", "m")) as Arc<dyn Backend>]);
    assert_eq!(registry.select(Role::Reviewer).unwrap().1, "b");
}

#[test]
fn test_unassigned_role_uses_default_or_fails() {
    let registry = Registry::from_handles(
        RegistryConfig::default().with_default_backend("d"),
        vec![Arc::new(MockBackend::new("d", "m")) as Arc<dyn Backend>],
    );
    assert_eq!(registry.select(Role::Documenter).unwrap().1, "d");

    let registry = Registry::from_handles(
        RegistryConfig::default().with_role(RoleAssignment::new(Role::Tester, "gone")),
        Vec::new(),
    );
    assert!(matches!(
        registry.select(Role::Tester),
        Err(RegistryError::NoBackendAvailable { role: Role::Tester })
    ));
}

// ============================================================================
// 3. Execution
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_execute_retries_transient_failures() {
    let backend = Arc::new(
        MockBackend::new("a", "m")
            .with_failures(2, "503 service unavailable")
            .with_response("third time lucky"),
    );
    let config = RegistryConfig::default()
        .with_role(RoleAssignment::new(Role::Coder, "a"))
        .with_retry(fast_retry(3));
    let registry = Registry::from_handles(config, vec![backend.clone() as Arc<dyn Backend>]);

    let response = registry
        .execute(Role::Coder, "fix the bug", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.text, "third time lucky");
    assert_eq!(backend.execute_count(), 3);

    let statuses: Vec<MetricStatus> = registry
        .metrics()
        .snapshot()
        .into_iter()
        .map(|e| e.status)
        .collect();
    assert_eq!(
        statuses,
        vec![MetricStatus::Retry, MetricStatus::Retry, MetricStatus::Success]
    );

    let summary = registry.query_metrics("a", Role::Coder, None);
    assert_eq!(summary.retry_count, 2);
    assert_eq!(summary.success_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_mentioning_a_duration_is_retried() {
    let backend = Arc::new(
        MockBackend::new("a", "m").with_failures(1, "upstream timed out after 4000ms"),
    );
    let config = RegistryConfig::default()
        .with_default_backend("a")
        .with_retry(fast_retry(3));
    let registry = Registry::from_handles(config, vec![backend.clone() as Arc<dyn Backend>]);

    let response = registry
        .execute(Role::Planner, "plan the migration", &CancellationToken::new())
        .await;
    assert_ok!(response);
    assert_eq!(backend.execute_count(), 2);
    assert_eq!(registry.query_metrics("a", Role::Planner, None).retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_execute_exhausts_after_max_plus_one() {
    let backend = Arc::new(MockBackend::new("a", "m").with_failures(10, "429 rate limit"));
    let config = RegistryConfig::default()
        .with_default_backend("a")
        .with_retry(fast_retry(2));
    let registry = Registry::from_handles(config, vec![backend.clone() as Arc<dyn Backend>]);

    let err = registry
        .execute(Role::Tester, "write tests", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(backend.execute_count(), 3);
    let RegistryError::Execution { source, .. } = err else {
        panic!("expected execution error");
    };
    assert!(matches!(source, RetryError::Exhausted { attempts: 3, .. }));
    assert_eq!(source.last_error().map(|e| e.code), Some(ErrorCode::RateLimit));

    let summary = registry.query_metrics("a", Role::Tester, None);
    assert_eq!((summary.retry_count, summary.failure_count), (2, 1));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_wait_stops_attempts() {
    let backend = Arc::new(MockBackend::new("a", "m").with_failures(10, "network unreachable"));
    let config = RegistryConfig::default()
        .with_default_backend("a")
        .with_retry(RetryPolicy::new(5, Duration::from_secs(10)));
    let registry = Registry::from_handles(config, vec![backend.clone() as Arc<dyn Backend>]);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let err = registry
        .execute(Role::Planner, "plan", &token)
        .await
        .unwrap_err();
    assert_eq!(backend.execute_count(), 1);
    assert!(matches!(
        err,
        RegistryError::Execution { ref source, .. } if source.is_cancelled()
    ));
}

#[tokio::test]
async fn test_execute_uses_merged_parameters() {
    let factory = BackendFactory::with_builtin();
    let registry = Registry::new(two_backend_config(), &factory).await.unwrap();

    registry
        .execute(Role::Coder, "hi", &CancellationToken::new())
        .await
        .unwrap();
    let request = registry.build_request(Role::Coder, "primary-a", "hi");
    assert!((request.temperature - 0.2).abs() < f64::EPSILON);

    // Default backend serving an unassigned role gets global parameters only
    let request = registry.build_request(Role::Planner, "backup-b", "hi");
    assert!((request.temperature - 0.7).abs() < f64::EPSILON);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers() {
    let backend = Arc::new(MockBackend::new("a", "m"));
    let registry = Arc::new(Registry::from_handles(
        RegistryConfig::default().with_default_backend("a"),
        vec![backend.clone() as Arc<dyn Backend>],
    ));

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .execute(Role::Coder, format!("prompt {i}"), &CancellationToken::new())
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(backend.execute_count(), 50);
    assert_eq!(registry.query_metrics("a", Role::Coder, None).total_requests, 50);
}

// ============================================================================
// 4. Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_reports_every_failure() {
    let ok = Arc::new(MockBackend::new("ok", "m"));
    let bad_a = Arc::new(MockBackend::new("bad-a", "m").with_shutdown_failure("connection reset"));
    let bad_b = Arc::new(MockBackend::new("bad-b", "m").with_shutdown_failure("server error"));
    let registry = Registry::from_handles(
        RegistryConfig::default(),
        vec![
            ok.clone() as Arc<dyn Backend>,
            bad_a.clone() as Arc<dyn Backend>,
            bad_b.clone() as Arc<dyn Backend>,
        ],
    );

    let err = registry.shutdown().await.unwrap_err();
    let RegistryError::Shutdown { failures } = err else {
        panic!("expected shutdown error");
    };
    let ids: Vec<&str> = failures.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["bad-a", "bad-b"]);
    assert!([&ok, &bad_a, &bad_b].iter().all(|b| b.shutdown_count() == 1));

    // Second call is a no-op
    registry.shutdown().await.unwrap();
    assert_eq!(ok.shutdown_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_bounds_each_backend() {
    let stuck = Arc::new(MockBackend::new("stuck", "m").with_shutdown_delay(Duration::from_secs(600)));
    let mut config = RegistryConfig::default();
    config.shutdown_timeout_ms = 1_000;
    let registry = Registry::from_handles(config, vec![stuck as Arc<dyn Backend>]);

    let started = tokio::time::Instant::now();
    let err = registry.shutdown().await.unwrap_err();
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert!(err.to_string().contains("stuck: shutdown timed out after 1000ms"));
}

struct FailingSink;

impl MetricsSink for FailingSink {
    fn flush(&self, _events: &[MetricEvent]) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
}

#[tokio::test]
async fn test_flush_failure_joins_shutdown_error() {
    let config = RegistryConfig::default().with_backend(mock_descriptor("mock-a"));
    let registry = Registry::with_collector(
        config,
        &BackendFactory::with_builtin(),
        MetricsCollector::with_sink(Arc::new(FailingSink)),
    )
    .await
    .unwrap();

    registry.record_metric(MetricEvent::success("mock-a", Role::Coder, 12));
    let err = registry.shutdown().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Shutdown completed with 1 failure(s): metrics: disk full"
    );
}

// ============================================================================
// 5. Caching
// ============================================================================

#[tokio::test]
async fn test_response_cache_through_registry() {
    let config = two_backend_config().with_cache(CacheConfig {
        response_cache: true,
        prompt_cache: false,
    });
    let built = Arc::new(Mutex::new(Vec::new()));
    let factory = recording_factory(Arc::clone(&built), |_, backend| backend);
    let registry = Registry::new(config, &factory).await.unwrap();

    let token = CancellationToken::new();
    registry.execute(Role::Coder, "same", &token).await.unwrap();
    registry.execute(Role::Coder, "same", &token).await.unwrap();
    registry.execute(Role::Coder, "different", &token).await.unwrap();

    let primary = built
        .lock()
        .iter()
        .find(|b| b.name() == "primary-a")
        .cloned()
        .unwrap();
    assert_eq!(primary.execute_count(), 2);

    let stats = registry.response_cache_stats();
    assert_eq!((stats.hits, stats.misses), (1, 2));
}

#[tokio::test]
async fn test_disabled_response_cache_still_counts_lookups() {
    let built = Arc::new(Mutex::new(Vec::new()));
    let factory = recording_factory(Arc::clone(&built), |_, backend| backend);
    // Response caching is off by default
    let registry = Registry::new(two_backend_config(), &factory).await.unwrap();

    let token = CancellationToken::new();
    registry.execute(Role::Coder, "same", &token).await.unwrap();
    registry.execute(Role::Coder, "same", &token).await.unwrap();

    let primary = built
        .lock()
        .iter()
        .find(|b| b.name() == "primary-a")
        .cloned()
        .unwrap();
    assert_eq!(primary.execute_count(), 2);

    let stats = registry.response_cache_stats();
    assert_eq!((stats.hits, stats.misses, stats.entries), (0, 2, 0));
}

#[tokio::test]
async fn test_prompt_cache_bookkeeping_per_backend() {
    let config = two_backend_config().with_cache(CacheConfig {
        response_cache: false,
        prompt_cache: true,
    });
    let factory = recording_factory(Arc::new(Mutex::new(Vec::new())), |_, backend| {
        backend.with_prompt_caching()
    });
    let registry = Registry::new(config, &factory).await.unwrap();

    let cache = registry.prompt_cache("primary-a").unwrap();
    let request = registry.build_request(Role::Coder, "primary-a", "");
    for question in ["what does this do?", "and this?", "any bugs?"] {
        let messages = [
            CachedMessage::cached(
                MessageRole::System,
                "Project conventions: tokio everywhere, thiserror for library errors.",
                CacheTtl::FiveMinutes,
            ),
            CachedMessage::new(MessageRole::User, question),
        ];
        cache.chat(&messages, &request).await.unwrap();
    }

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (2, 1));
    assert!(cache.cost_savings_percent() > 0.0);
    assert!(registry.prompt_cache("backup-b").unwrap().stats().hits == 0);
}

#[test]
fn test_free_form_metrics_filters() {
    let registry = Registry::from_handles(RegistryConfig::default(), Vec::new());
    registry.record_metric(MetricEvent::success("x", Role::Coder, 10));
    registry.record_metric(MetricEvent::success("y", Role::Coder, 30));
    registry.record_metric(MetricEvent::failure("y", Role::Tester, 50, "boom"));

    let coder = registry
        .metrics()
        .summarize(&MetricsFilter::all().role(Role::Coder));
    assert_eq!(coder.total_requests, 2);

    // Events for pairs with no assignment are still accepted
    let unknown = registry.query_metrics("y", Role::Tester, None);
    assert_eq!(unknown.failure_count, 1);
}
