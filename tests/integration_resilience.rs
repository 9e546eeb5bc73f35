mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedTransport, Step, builder};
use reqshield::{
    AttemptFailure, CancellationToken, CircuitBreakerPolicy, CircuitPhase, Error, ErrorCode,
    ManualClock, RequestSpec, ResilienceConfig, RetryPolicy, TransportErrorKind,
};

fn no_retries() -> RetryPolicy {
    RetryPolicy::disabled().timeout_per_attempt(Duration::from_secs(1))
}

fn quick_retries(max_retries: usize) -> RetryPolicy {
    RetryPolicy::standard()
        .max_retries(max_retries)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(5))
        .jitter_window(Duration::ZERO)
        .timeout_per_attempt(Duration::from_millis(250))
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_threshold_and_closes_after_recovery() {
    let transport = ScriptedTransport::new(vec![Step::status(503); 5], Step::status(200));
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock.clone())
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(5)
                .recovery_timeout(Duration::from_secs(30)),
        )
        .retry_policy(no_retries())
        .try_build()
        .expect("executor should build");

    for _ in 0..5 {
        let error = executor
            .execute(RequestSpec::get("/orders"))
            .await
            .expect_err("backend is failing");
        assert_eq!(error.code(), ErrorCode::RetriesExhausted);
    }
    let status = executor.status();
    assert!(status.is_open);
    assert_eq!(status.failure_count, 5);

    clock.advance(Duration::from_secs(10));
    let error = executor
        .execute(RequestSpec::get("/orders"))
        .await
        .expect_err("breaker should reject");
    match &error {
        Error::CircuitOpen { retry_after_ms, .. } => assert_eq!(*retry_after_ms, 20_000),
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(
        error.user_message(),
        "service temporarily unavailable, retry later"
    );
    assert_eq!(transport.calls(), 5, "rejected call must not reach the backend");

    clock.advance(Duration::from_secs(20));
    assert_eq!(executor.status().phase, CircuitPhase::HalfOpen);
    let response = executor
        .execute(RequestSpec::get("/orders"))
        .await
        .expect("probe should succeed");
    assert_eq!(response.status(), http::StatusCode::OK);

    let status = executor.status();
    assert!(!status.is_open);
    assert_eq!(status.phase, CircuitPhase::Closed);
    assert_eq!(status.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_immediately() {
    let transport = ScriptedTransport::always(Step::status(500));
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock.clone())
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(2)
                .recovery_timeout(Duration::from_secs(30)),
        )
        .retry_policy(no_retries())
        .try_build()
        .expect("executor should build");

    for _ in 0..2 {
        let _ = executor.execute(RequestSpec::get("/orders")).await;
    }
    clock.advance(Duration::from_secs(30));

    let error = executor
        .execute(RequestSpec::get("/orders"))
        .await
        .expect_err("probe should fail");
    assert_eq!(error.code(), ErrorCode::RetriesExhausted);

    let status = executor.status();
    assert!(status.is_open);
    assert_eq!(status.failure_count, 3);
    assert_eq!(
        executor
            .execute(RequestSpec::get("/orders"))
            .await
            .expect_err("reopened breaker should reject")
            .code(),
        ErrorCode::CircuitOpen
    );
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_one_probe_while_others_are_rejected() {
    let transport = ScriptedTransport::new(vec![Step::status(503)], Step::Hang);
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock.clone())
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(30)),
        )
        .retry_policy(no_retries())
        .try_build()
        .expect("executor should build");

    let _ = executor.execute(RequestSpec::get("/orders")).await;
    assert!(executor.status().is_open);
    clock.advance(Duration::from_secs(30));

    let probe_executor = executor.clone();
    let probe =
        tokio::spawn(async move { probe_executor.execute(RequestSpec::get("/orders")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let rejected = executor
        .execute(RequestSpec::get("/orders"))
        .await
        .expect_err("probe slot is taken");
    assert_eq!(rejected.code(), ErrorCode::CircuitOpen);

    let probe_error = probe
        .await
        .expect("probe task should finish")
        .expect_err("probe hangs until its attempt timeout");
    match probe_error {
        Error::RetriesExhausted { last, .. } => {
            assert_eq!(last, AttemptFailure::Timeout { timeout_ms: 1_000 });
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert!(executor.status().is_open);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn client_errors_never_retry_or_open_the_breaker() {
    let transport = ScriptedTransport::always(Step::body(404, "no such order"));
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(2))
        .retry_policy(quick_retries(3))
        .try_build()
        .expect("executor should build");

    for _ in 0..10 {
        let error = executor
            .execute(RequestSpec::get("/orders/missing"))
            .await
            .expect_err("404 should fail");
        match &error {
            Error::Client { status, body, .. } => {
                assert_eq!(*status, 404);
                assert_eq!(body, "no such order");
            }
            other => panic!("unexpected error variant: {other}"),
        }
        assert_eq!(error.user_message(), "request invalid");
    }

    let status = executor.status();
    assert!(!status.is_open);
    assert_eq!(status.failure_count, 0);
    assert_eq!(transport.calls(), 10);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_is_reported_once_with_last_cause() {
    let transport = ScriptedTransport::always(Step::body(503, "maintenance"));
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .retry_policy(quick_retries(3))
        .try_build()
        .expect("executor should build");

    let started = tokio::time::Instant::now();
    let error = executor
        .execute(RequestSpec::get("/orders"))
        .await
        .expect_err("backend is down");
    let elapsed = started.elapsed();

    match &error {
        Error::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(*attempts, 4);
            assert_eq!(
                *last,
                AttemptFailure::Server {
                    status: 503,
                    body: "maintenance".to_owned(),
                }
            );
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(error.user_message(), "service unreachable after 4 attempts");
    assert_eq!(transport.calls(), 4);
    assert_eq!(executor.status().failure_count, 1);
    assert!(elapsed >= Duration::from_millis(700), "elapsed={elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "elapsed={elapsed:?}");

    let snapshot = executor.metrics_snapshot();
    assert_eq!(snapshot.attempts, 4);
    assert_eq!(snapshot.retries, 3);
    assert_eq!(snapshot.calls_failed, 1);
    assert_eq!(snapshot.error_counts.get("retries_exhausted"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_then_success_close_the_call_cleanly() {
    let transport = ScriptedTransport::new(
        vec![
            Step::status(502),
            Step::Fail(TransportErrorKind::Connect),
            Step::Hang,
        ],
        Step::body(200, r#"{"id":"42"}"#),
    );
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .retry_policy(quick_retries(3))
        .try_build()
        .expect("executor should build");

    #[derive(serde::Deserialize)]
    struct Order {
        id: String,
    }

    let response = executor
        .execute(RequestSpec::get("/orders/42"))
        .await
        .expect("fourth attempt should succeed");
    assert_eq!(response.attempts(), 4);
    assert_eq!(response.json::<Order>().expect("order json").id, "42");

    let status = executor.status();
    assert_eq!(status.failure_count, 0);
    assert_eq!(status.last_failure_at, None);
    assert_eq!(transport.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_stretches_the_backoff() {
    let transport = ScriptedTransport::new(
        vec![Step::body(429, "slow down").with_header("retry-after", "2")],
        Step::status(200),
    );
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .retry_policy(quick_retries(1))
        .try_build()
        .expect("executor should build");

    let started = tokio::time::Instant::now();
    executor
        .execute(RequestSpec::get("/quotes"))
        .await
        .expect("second attempt should succeed");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_rate_limiting_counts_toward_the_breaker() {
    let transport = ScriptedTransport::always(
        Step::body(429, "slow down").with_header("retry-after", "1"),
    );
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(2))
        .retry_policy(quick_retries(1))
        .try_build()
        .expect("executor should build");

    for expected_failures in 1..=2 {
        let error = executor
            .execute(RequestSpec::get("/quotes"))
            .await
            .expect_err("backend keeps throttling");
        match error {
            Error::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(
                    last,
                    AttemptFailure::RateLimited {
                        retry_after_ms: Some(1_000),
                        body: "slow down".to_owned(),
                    }
                );
            }
            other => panic!("unexpected error variant: {other}"),
        }
        assert_eq!(executor.status().failure_count, expected_failures);
    }
    assert!(executor.status().is_open);

    let error = executor
        .execute(RequestSpec::get("/quotes"))
        .await
        .expect_err("breaker should reject");
    assert_eq!(error.code(), ErrorCode::CircuitOpen);
    assert_eq!(transport.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn consecutive_timeouts_open_the_breaker() {
    let transport = ScriptedTransport::always(Step::Hang);
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(5)
                .recovery_timeout(Duration::from_secs(30)),
        )
        .retry_policy(no_retries())
        .try_build()
        .expect("executor should build");

    for _ in 0..5 {
        match executor
            .execute(RequestSpec::get("/orders"))
            .await
            .expect_err("attempt should time out")
        {
            Error::RetriesExhausted { last, .. } => {
                assert_eq!(last, AttemptFailure::Timeout { timeout_ms: 1_000 })
            }
            other => panic!("unexpected error variant: {other}"),
        }
    }
    let status = executor.status();
    assert!(status.is_open);
    assert_eq!(status.phase, CircuitPhase::Open);
    assert_eq!(status.failure_count, 5);

    let error = executor
        .execute(RequestSpec::get("/orders"))
        .await
        .expect_err("sixth call is rejected locally");
    match error {
        Error::CircuitOpen { retry_after_ms, .. } => assert_eq!(retry_after_ms, 30_000),
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(transport.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn per_request_timeout_override_applies_to_each_attempt() {
    let transport = ScriptedTransport::always(Step::Hang);
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .retry_policy(quick_retries(1))
        .try_build()
        .expect("executor should build");

    let error = executor
        .execute(RequestSpec::get("/reports").timeout(Duration::from_millis(40)))
        .await
        .expect_err("every attempt hangs");
    match error {
        Error::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 2);
            assert_eq!(last, AttemptFailure::Timeout { timeout_ms: 40 });
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_without_touching_breaker() {
    let transport = ScriptedTransport::always(Step::Hang);
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(1))
        .retry_policy(quick_retries(2).timeout_per_attempt(Duration::from_secs(10)))
        .try_build()
        .expect("executor should build");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let error = executor
        .execute_with_cancel(RequestSpec::get("/orders"), cancel)
        .await
        .expect_err("call should be cancelled");
    match error {
        Error::Aborted { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("unexpected error variant: {other}"),
    }

    let status = executor.status();
    assert!(!status.is_open);
    assert_eq!(status.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn reset_force_closes_an_open_breaker() {
    let transport = ScriptedTransport::new(vec![Step::status(500)], Step::status(204));
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(300)),
        )
        .retry_policy(no_retries())
        .try_build()
        .expect("executor should build");

    let _ = executor.execute(RequestSpec::delete("/orders/1")).await;
    assert!(executor.status().is_open);

    executor.reset();
    let status = executor.status();
    assert!(!status.is_open);
    assert_eq!(status.failure_count, 0);

    let response = executor
        .execute(RequestSpec::delete("/orders/1"))
        .await
        .expect("reset breaker should admit calls");
    assert_eq!(response.status(), http::StatusCode::NO_CONTENT);
}

#[tokio::test(start_paused = true)]
async fn loaded_config_drives_policies() {
    let config: ResilienceConfig = serde_json::from_value(serde_json::json!({
        "failure_threshold": 1,
        "recovery_timeout_ms": 1_000,
        "max_retries": 1,
        "base_delay_ms": 10,
        "jitter_window_ms": 0,
        "timeout_per_attempt_ms": 100
    }))
    .expect("config should parse");

    let transport = ScriptedTransport::always(Step::Fail(TransportErrorKind::Dns));
    let clock = Arc::new(ManualClock::new());
    let executor = builder(transport.clone(), clock)
        .config(&config)
        .try_build()
        .expect("executor should build");

    let error = executor
        .execute(RequestSpec::get("/orders"))
        .await
        .expect_err("dns failure");
    match error {
        Error::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 2);
            assert!(matches!(
                last,
                AttemptFailure::Network {
                    kind: TransportErrorKind::Dns,
                    ..
                }
            ));
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert!(executor.status().is_open);
    assert_eq!(executor.metrics_snapshot().calls_failed, 1);
}
