use crate::config::{LimitScope, ProviderSettings, ProviderVariant};
use crate::error::AppError;
use crate::ratelimit::RateLimiter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Unit Tests for RateLimiter (process scope)
//
// UNIT UNDER TEST: in-process admission control
//
// BUSINESS RESPONSIBILITY:
//   - At most concurrent_limit permits are held at any instant, for any
//     interleaving of concurrent acquirers
//   - The trailing-60s window never admits more than qpm_limit requests
//   - Every exit path (drop, cancel, deadline) returns the slot
//
// The global scope shares the acquire contract; its store-backed
// algorithm is covered by the redis-gated integration tests.

fn test_provider(qpm_limit: u32, concurrent_limit: u32) -> ProviderSettings {
    ProviderSettings {
        id: "test".to_string(),
        api_key: "sk-test".to_string(),
        base_url: "http://localhost:0".to_string(),
        model: "test-model".to_string(),
        variant: ProviderVariant::OneShot,
        qpm_limit,
        concurrent_limit,
        scope: LimitScope::Process,
        request_timeout: Duration::from_secs(2),
    }
}

fn limiter(qpm_limit: u32, concurrent_limit: u32) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        &[test_provider(qpm_limit, concurrent_limit)],
        None,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_holders_never_exceed_limit() {
    // Arrange
    let limiter = limiter(1000, 3);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    // Act: 20 tasks contend for 3 slots.
    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = Arc::clone(&limiter);
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let permit = limiter.acquire("test", &cancel).await.expect("acquire");
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }));
    }
    for handle in handles {
        handle.await.expect("task");
    }

    // Assert
    assert!(
        peak.load(Ordering::SeqCst) <= 3,
        "Observed {} simultaneous holders, limit is 3",
        peak.load(Ordering::SeqCst)
    );
    assert_eq!(
        limiter.in_flight("test").await.expect("in_flight"),
        0,
        "All slots must return after the burst"
    );
}

#[tokio::test]
async fn test_permit_drop_releases_the_slot() {
    let limiter = limiter(100, 1);
    let cancel = CancellationToken::new();

    let permit = limiter.acquire("test", &cancel).await.expect("first");
    assert_eq!(limiter.in_flight("test").await.unwrap(), 1);
    drop(permit);

    // The slot must be reusable immediately after the drop.
    let permit = limiter
        .acquire_with_deadline("test", &cancel, Duration::from_millis(200))
        .await
        .expect("slot should be free after drop");
    drop(permit);
    assert_eq!(limiter.in_flight("test").await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancellation_during_acquire_leaves_no_partial_state() {
    // Arrange: exhaust the single slot.
    let limiter = limiter(100, 1);
    let cancel = CancellationToken::new();
    let held = limiter.acquire("test", &cancel).await.expect("first");

    // Act: a second acquirer blocks, then is cancelled.
    let waiter_cancel = CancellationToken::new();
    let waiter = {
        let limiter = Arc::clone(&limiter);
        let waiter_cancel = waiter_cancel.clone();
        tokio::spawn(async move { limiter.acquire("test", &waiter_cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    waiter_cancel.cancel();
    let result = waiter.await.expect("task");

    // Assert
    assert!(
        matches!(result, Err(AppError::Cancelled { .. })),
        "Cancelled acquire must surface as Cancelled, got {result:?}"
    );
    drop(held);
    let permit = limiter
        .acquire_with_deadline("test", &cancel, Duration::from_millis(200))
        .await
        .expect("cancelled waiter must not have leaked the slot");
    drop(permit);
}

#[tokio::test]
async fn test_qpm_window_rejects_a_burst_past_the_limit() {
    // Arrange: tiny QPM budget, plenty of slots.
    let limiter = limiter(2, 10);
    let cancel = CancellationToken::new();

    // Act: the first two admissions fit the window.
    let _one = limiter.acquire("test", &cancel).await.expect("first");
    let _two = limiter.acquire("test", &cancel).await.expect("second");
    let third = limiter
        .acquire_with_deadline("test", &cancel, Duration::from_millis(300))
        .await;

    // Assert: the third cannot be admitted inside the window and the
    // short deadline converts the wait into RateLimited.
    assert!(
        matches!(third, Err(AppError::RateLimited { .. })),
        "Expected RateLimited past the QPM budget, got {third:?}"
    );
}

#[tokio::test]
async fn test_deadline_expiry_reports_rate_limited() {
    let limiter = limiter(100, 1);
    let cancel = CancellationToken::new();
    let _held = limiter.acquire("test", &cancel).await.expect("first");

    let result = limiter
        .acquire_with_deadline("test", &cancel, Duration::from_millis(100))
        .await;

    assert!(
        matches!(result, Err(AppError::RateLimited { .. })),
        "A blocked acquire past its deadline is RateLimited, got {result:?}"
    );
}

#[tokio::test]
async fn test_unknown_provider_is_an_internal_error() {
    let limiter = limiter(10, 1);
    let cancel = CancellationToken::new();

    let result = limiter.acquire("nope", &cancel).await;

    assert!(matches!(result, Err(AppError::Internal { .. })));
}
