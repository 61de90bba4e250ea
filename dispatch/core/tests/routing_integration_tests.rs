//! Integration tests for the dispatch router
//!
//! These tests drive the public API end to end with mock providers:
//! - Fallback across rate-limited providers
//! - Single-provider retries and fatal errors
//! - Admission control under load
//! - TOML configuration and hot reload

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use dispatch_core::backend::{CompletionRequest, MockProvider, ProviderError, ProviderRegistry};
use dispatch_core::config::{load_config_from_path, ConfigSource};
use dispatch_core::routing::{
    ConcurrencyLimits, ConcurrencySettings, ErrorKind, ProviderCandidate, RateLimitSettings,
    Router, RouterError, RouterSettings, RoutingContext, TaskType,
};

fn registry(providers: &[&Arc<MockProvider>]) -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::new());
    for &provider in providers {
        let provider: Arc<MockProvider> = Arc::clone(provider);
        registry.register(provider);
    }
    registry
}

// =============================================================================
// Fallback Mode
// =============================================================================

/// A rate-limited primary is retried within its budget, then the chain moves on.
#[tokio::test(start_paused = true)]
async fn test_rate_limited_primary_falls_back() {
    let a = Arc::new(MockProvider::failing(
        "A",
        ProviderError::http(429, "rate limit exceeded"),
    ));
    let b = Arc::new(MockProvider::new("B"));
    let router = Router::new(registry(&[&a, &b])).with_chain(vec![
        ProviderCandidate::new("A", "a-model", 1).with_max_retries(2),
        ProviderCandidate::new("B", "b-model", 2),
    ]);

    let start = Instant::now();
    let result = router
        .route_detailed(&CompletionRequest::new("hello"), &RoutingContext::default())
        .await;
    let elapsed = start.elapsed();

    assert!(result.is_success());
    assert_eq!(result.attempted_providers, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(result.successful_provider.as_deref(), Some("B"));
    assert_eq!(result.total_attempts, 3);
    assert_eq!(a.call_count(), 2);

    // One backoff of 1000ms plus up to 25% jitter between A's attempts
    assert!(elapsed >= Duration::from_millis(1000), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1300), "elapsed {elapsed:?}");

    let response = result.into_result().expect("B should answer");
    assert_eq!(response.model, "b-model");
}

/// A candidate whose token wait times out is skipped like any other failure.
#[tokio::test(start_paused = true)]
async fn test_admission_timeout_advances_chain() {
    let a = Arc::new(MockProvider::new("A"));
    let b = Arc::new(MockProvider::new("B"));
    let router = Router::new(registry(&[&a, &b]))
        .with_chain(vec![
            ProviderCandidate::new("A", "a-model", 1),
            ProviderCandidate::new("B", "b-model", 2),
        ])
        .with_settings(RouterSettings {
            token_timeout: Duration::from_millis(100),
            ..RouterSettings::default()
        })
        .with_rate_limits(&RateLimitSettings {
            default_requests_per_minute: 60,
            providers: [("A".to_string(), 1)].into_iter().collect(),
        });
    let context = RoutingContext::default();

    let first = assert_ok!(router.route(&CompletionRequest::new("one"), &context).await);
    assert_eq!(first.model, "a-model");

    let second = router
        .route_detailed(&CompletionRequest::new("two"), &context)
        .await;
    assert_eq!(second.successful_provider.as_deref(), Some("B"));
    assert_eq!(a.call_count(), 1);

    let summary = router.metrics().summary();
    assert_eq!(summary.providers["A"].admission_timeouts, 1);
    assert_eq!(summary.providers["B"].successes, 1);
}

/// Every candidate failing reports the full list of providers tried.
#[tokio::test(start_paused = true)]
async fn test_exhausted_chain_reports_attempts() {
    let a = Arc::new(MockProvider::failing("A", ProviderError::http(500, "boom")));
    let b = Arc::new(MockProvider::failing("B", ProviderError::http(401, "denied")));
    let router = Router::new(registry(&[&a, &b])).with_chain(vec![
        ProviderCandidate::new("A", "a-model", 1),
        ProviderCandidate::new("missing", "x", 2),
        ProviderCandidate::new("B", "b-model", 3),
    ]);

    let err = assert_err!(
        router
            .route(&CompletionRequest::new("hello"), &RoutingContext::default())
            .await
    );

    let RouterError::Exhausted(fallback) = &err else {
        panic!("expected exhaustion, got {err:?}");
    };
    assert_eq!(fallback.attempted(), ["A".to_string(), "B".to_string()]);
    assert!(err.to_string().starts_with("All fallback providers exhausted (tried: A, B)"));
    assert!(err.to_string().contains("denied"));
}

// =============================================================================
// Single-Provider Mode
// =============================================================================

fn single_router(providers: &[&Arc<MockProvider>]) -> Router {
    Router::new(registry(providers)).with_settings(RouterSettings {
        use_fallback: false,
        ..RouterSettings::default()
    })
}

/// Authentication failures are fatal: one call, no backoff.
#[tokio::test(start_paused = true)]
async fn test_single_mode_auth_error_not_retried() {
    let anthropic = Arc::new(MockProvider::failing(
        "anthropic",
        ProviderError::http(401, "invalid api key"),
    ));
    let router = single_router(&[&anthropic]);

    let start = Instant::now();
    let err = router
        .route(
            &CompletionRequest::new("hello"),
            &RoutingContext::new(TaskType::Coding).with_preferred_model("anthropic/claude-opus-4-1"),
        )
        .await
        .expect_err("401 is fatal");

    assert_eq!(anthropic.call_count(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
    let classified = err.classified().expect("should carry classification");
    assert_eq!(classified.kind, ErrorKind::Authentication);
    assert!(!classified.retryable);
    assert_eq!(classified.source.status, Some(401));
}

/// A Retry-After header sets the wait before the next attempt.
#[tokio::test(start_paused = true)]
async fn test_single_mode_honours_retry_after() {
    let anthropic = Arc::new(
        MockProvider::new("anthropic")
            .queue_error(ProviderError::http(429, "slow down").with_retry_after("2")),
    );
    let router = single_router(&[&anthropic]);

    let start = Instant::now();
    router
        .route(
            &CompletionRequest::new("hello"),
            &RoutingContext::default().with_preferred_model("anthropic/claude-haiku-4-5"),
        )
        .await
        .expect("second attempt succeeds");

    assert_eq!(anthropic.call_count(), 2);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
}

/// Retries stop after `max_retries`; the last provider error is surfaced.
#[tokio::test(start_paused = true)]
async fn test_single_mode_retry_budget() {
    let mcp = Arc::new(MockProvider::failing("mcp", ProviderError::http(503, "unavailable")));
    let router = single_router(&[&mcp]);

    let err = router
        .route(
            &CompletionRequest::new("hello"),
            &RoutingContext::default().with_preferred_model("mcp/qwen-72b"),
        )
        .await
        .expect_err("always unavailable");

    assert_eq!(mcp.call_count(), 4);
    let RouterError::Provider(annotated) = err else {
        panic!("expected provider error");
    };
    assert_eq!(annotated.attempt, 4);
    assert_eq!(annotated.classified.kind, ErrorKind::ServerError);
    assert_eq!(router.metrics().provider("mcp").snapshot().retries, 3);
}

// =============================================================================
// Admission Control Under Load
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_routes_respect_provider_limit() {
    let featherless = Arc::new(
        MockProvider::new("featherless").with_latency(Duration::from_millis(250)),
    );
    let router = Arc::new(
        Router::new(registry(&[&featherless]))
            .with_chain(vec![ProviderCandidate::new("featherless", "llama-70b", 1)])
            .with_concurrency(&ConcurrencySettings {
                default_limits: ConcurrencyLimits::default(),
                providers: [(
                    "featherless".to_string(),
                    ConcurrencyLimits::new(3).with_min_time_between(Duration::from_millis(100)),
                )]
                .into_iter()
                .collect(),
            }),
    );

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                router
                    .route(
                        &CompletionRequest::new(format!("request {i}")),
                        &RoutingContext::default(),
                    )
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle
            .await
            .expect("task should not panic")
            .expect("route should succeed");
    }

    assert_eq!(featherless.call_count(), 12);
    assert!(featherless.peak_in_flight() <= 3);
    let status = router.concurrency().get_status("featherless");
    assert_eq!(status.in_flight, 0);
    assert_eq!(status.waiting, 0);
    assert_eq!(status.peak_in_flight, 3);
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_config_file_drives_router_and_hot_reload() {
    let mut file = NamedTempFile::new().expect("should create temp file");
    file.write_all(
        br#"
[router]
token_timeout_ms = 500

[rate_limits.mcp]
requests_per_minute = 5

[concurrency.mcp]
max_concurrent = 1
min_time_between_ms = 0

[[fallback]]
provider = "mcp"
model = "glm-4.7"
priority = 1
"#,
    )
    .expect("should write config");

    let mut config =
        load_config_from_path(Some(file.path().to_path_buf())).expect("config should load");
    assert_eq!(config.source(), ConfigSource::File);

    let mcp = Arc::new(MockProvider::new("mcp"));
    let router = Router::from_config(registry(&[&mcp]), &config);

    let response = router
        .route(&CompletionRequest::new("hi"), &RoutingContext::default())
        .await
        .expect("glm answers");
    assert_eq!(response.model, "glm-4.7");
    assert_eq!(router.rate_limiter().get_status("mcp").limit, 5);
    assert_eq!(router.concurrency().limits("mcp").max_concurrent, 1);

    config.rate_limits.providers.insert("mcp".to_string(), 120);
    config.concurrency.providers.insert("mcp".to_string(), ConcurrencyLimits::new(4));
    config.fallback = vec![ProviderCandidate::new("mcp", "kimi-k2", 1)];
    router.apply_config(&config);

    assert_eq!(router.rate_limiter().get_status("mcp").limit, 120);
    assert_eq!(router.concurrency().limits("mcp").max_concurrent, 4);
    let response = router
        .route(&CompletionRequest::new("hi"), &RoutingContext::default())
        .await
        .expect("kimi answers");
    assert_eq!(response.model, "kimi-k2");
}
