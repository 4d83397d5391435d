//! Coordination-store behavior against a real redis.
//!
//! These tests exercise the atomic scripts, the global rate limiter, and
//! the SMS flow end to end. They require a running redis (REDIS_URL or
//! redis://127.0.0.1:6379) and are `#[ignore]`d by default:
//!
//! ```text
//! cargo test --test store_redis_tests -- --ignored
//! ```

mod common;

use async_trait::async_trait;
use mindcanvas::config::{LimitScope, ProviderVariant, SmsConfig};
use mindcanvas::sms::{SendStatus, SmsCodeService, SmsGateway, VerifyStatus};
use mindcanvas::{AppResult, CoordinationStore, RateLimiter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn store() -> CoordinationStore {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    CoordinationStore::connect(&url)
        .await
        .expect("redis must be running for these tests")
}

/// Unique key prefix per test run so parallel runs do not collide.
fn key(name: &str) -> String {
    format!("test:{}:{name}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_compare_and_delete_consumes_exactly_once() {
    let store = store().await;
    let code_key = key("code");
    store
        .set_with_ttl(&code_key, "123456", Duration::from_secs(30))
        .await
        .unwrap();

    // Two concurrent consumers race for the same value.
    let (a, b) = tokio::join!(
        store.compare_and_delete(&code_key, "123456"),
        store.compare_and_delete(&code_key, "123456"),
    );
    let wins = [a.unwrap(), b.unwrap()].iter().filter(|&&w| w).count();

    assert_eq!(wins, 1, "Exactly one consumer may take the value");
    assert_eq!(store.get(&code_key).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_incr_with_ttl_applies_ttl_only_on_create() {
    let store = store().await;
    let counter = key("counter");

    assert_eq!(
        store
            .incr_with_ttl(&counter, Duration::from_secs(60))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .incr_with_ttl(&counter, Duration::from_secs(60))
            .await
            .unwrap(),
        2
    );
    let ttl = store.ttl(&counter).await.unwrap();
    assert!(
        ttl.is_some_and(|t| t <= 60),
        "Counter must expire with its creation TTL"
    );
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_read_and_trim_removes_what_it_returns() {
    let store = store().await;
    let list = key("list");
    for i in 0..5 {
        store.rpush(&list, &format!("item-{i}")).await.unwrap();
    }

    let batch = store.read_and_trim(&list, 3).await.unwrap();

    assert_eq!(batch, vec!["item-0", "item-1", "item-2"]);
    assert_eq!(store.llen(&list).await.unwrap(), 2, "Read items are gone");

    // Restoring puts a failed batch back at the front in order.
    store.lpush_front(&list, &batch).await.unwrap();
    let all = store.lrange(&list, 0, -1).await.unwrap();
    assert_eq!(all[0], "item-0");
    assert_eq!(all.len(), 5);
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_lock_is_exclusive_and_release_is_holder_safe() {
    let store = store().await;
    let name = key("backup");

    let lock = store
        .acquire_lock(&name, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("first holder wins");
    assert!(
        store
            .acquire_lock(&name, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none(),
        "Second acquirer must be refused"
    );

    lock.release().await;
    assert!(
        store
            .acquire_lock(&name, Duration::from_secs(30))
            .await
            .unwrap()
            .is_some(),
        "Lock reusable after release"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a running redis"]
async fn test_global_limiter_bounds_inflight_across_workers() {
    // Two limiter instances simulate two worker processes sharing the
    // provider's budget through the store.
    let store = store().await;
    let provider = mindcanvas::ProviderSettings {
        id: key("prov"),
        api_key: "sk-test".to_string(),
        base_url: "http://localhost:0".to_string(),
        model: "m".to_string(),
        variant: ProviderVariant::OneShot,
        qpm_limit: 100,
        concurrent_limit: 3,
        scope: LimitScope::Global,
        request_timeout: Duration::from_secs(2),
    };
    let worker_a = Arc::new(RateLimiter::new(
        std::slice::from_ref(&provider),
        Some(store.clone()),
    ));
    let worker_b = Arc::new(RateLimiter::new(
        std::slice::from_ref(&provider),
        Some(store.clone()),
    ));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..10 {
        let limiter = if i % 2 == 0 {
            Arc::clone(&worker_a)
        } else {
            Arc::clone(&worker_b)
        };
        let provider_id = provider.id.clone();
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let permit = limiter.acquire(&provider_id, &cancel).await.expect("acquire");
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            permit.release().await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(
        peak.load(Ordering::SeqCst) <= 3,
        "Cross-worker in-flight exceeded the limit: {}",
        peak.load(Ordering::SeqCst)
    );
    // Counter returns to zero once everything released.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(worker_a.in_flight(&provider.id).await.unwrap(), 0);
}

// ----------------------------------------------------------------------
// SMS flow
// ----------------------------------------------------------------------

#[derive(Debug, Default)]
struct StubGateway {
    fail: bool,
    delivered: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SmsGateway for StubGateway {
    async fn deliver(&self, phone: &str, code: &str) -> AppResult<()> {
        if self.fail {
            return Err(mindcanvas::AppError::upstream_error(
                "sms_gateway",
                "stub failure",
                true,
                None,
            ));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((phone.to_string(), code.to_string()));
        Ok(())
    }
}

fn sms_config() -> SmsConfig {
    SmsConfig {
        code_ttl: Duration::from_secs(60),
        resend_cooldown: Duration::from_secs(60),
        hourly_cap: 5,
        max_attempts: 5,
        ..Default::default()
    }
}

/// Distinct valid phone per test so store state never collides.
fn fresh_phone() -> String {
    let suffix: u64 = uuid::Uuid::new_v4().as_u128() as u64 % 1_000_000_000;
    format!("13{suffix:09}")
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_sms_send_then_concurrent_verify_consumes_once() {
    let store = store().await;
    let gateway = Arc::new(StubGateway::default());
    let service = Arc::new(SmsCodeService::new(
        store.clone(),
        Arc::clone(&gateway) as Arc<dyn SmsGateway>,
        sms_config(),
    ));
    let phone = fresh_phone();

    // Act: send, recover the code from the gateway, verify twice at once.
    let status = service.send_code(&phone, "login").await.unwrap();
    assert_eq!(status, SendStatus::Sent);
    let code = gateway.delivered.lock().unwrap()[0].1.clone();

    let (a, b) = tokio::join!(
        service.verify_code(&phone, "login", &code),
        service.verify_code(&phone, "login", &code),
    );
    let results = [a.unwrap(), b.unwrap()];

    // Assert: exactly one Verified; the loser sees the consumed state.
    let verified = results
        .iter()
        .filter(|&&r| r == VerifyStatus::Verified)
        .count();
    assert_eq!(verified, 1, "A code is consumable exactly once");
    assert!(results
        .iter()
        .any(|&r| r == VerifyStatus::Incorrect || r == VerifyStatus::NoActiveCode));
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_sms_cooldown_blocks_immediate_resend() {
    let store = store().await;
    let gateway = Arc::new(StubGateway::default());
    let service = SmsCodeService::new(
        store,
        Arc::clone(&gateway) as Arc<dyn SmsGateway>,
        sms_config(),
    );
    let phone = fresh_phone();

    assert_eq!(
        service.send_code(&phone, "login").await.unwrap(),
        SendStatus::Sent
    );
    let second = service.send_code(&phone, "login").await.unwrap();

    match second {
        SendStatus::CooldownActive { wait_seconds } => {
            assert!(wait_seconds <= 60, "Wait must not exceed the cooldown")
        }
        other => panic!("expected CooldownActive, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_sms_hourly_cap_blocks_excess_sends() {
    let store = store().await;
    let gateway = Arc::new(StubGateway::default());
    let config = SmsConfig {
        resend_cooldown: Duration::from_secs(1),
        hourly_cap: 3,
        ..sms_config()
    };
    let service = SmsCodeService::new(
        store,
        Arc::clone(&gateway) as Arc<dyn SmsGateway>,
        config,
    );
    let phone = fresh_phone();

    for i in 0..3 {
        assert_eq!(
            service.send_code(&phone, "login").await.unwrap(),
            SendStatus::Sent,
            "send {i} is inside the cap"
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;
    }

    let fourth = service.send_code(&phone, "login").await.unwrap();
    assert_eq!(
        fourth,
        SendStatus::HourlyCapReached,
        "The rolling-hour budget admits exactly hourly_cap sends"
    );
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_sms_gateway_failure_rolls_back_the_code() {
    let store = store().await;
    let gateway = Arc::new(StubGateway {
        fail: true,
        ..Default::default()
    });
    let service = SmsCodeService::new(
        store.clone(),
        gateway as Arc<dyn SmsGateway>,
        sms_config(),
    );
    let phone = fresh_phone();

    let status = service.send_code(&phone, "login").await.unwrap();

    assert_eq!(status, SendStatus::GatewayUnavailable);
    // No orphaned code: verify sees nothing active.
    assert_eq!(
        service.verify_code(&phone, "login", "000000").await.unwrap(),
        VerifyStatus::NoActiveCode
    );
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_sms_attempt_cap_force_deletes_the_code() {
    let store = store().await;
    let gateway = Arc::new(StubGateway::default());
    let service = SmsCodeService::new(
        store.clone(),
        Arc::clone(&gateway) as Arc<dyn SmsGateway>,
        sms_config(),
    );
    let phone = fresh_phone();

    assert_eq!(
        service.send_code(&phone, "login").await.unwrap(),
        SendStatus::Sent
    );
    let code = gateway.delivered.lock().unwrap()[0].1.clone();

    // Burn the guess budget with wrong codes.
    for _ in 0..5 {
        let result = service.verify_code(&phone, "login", "999999").await.unwrap();
        assert!(result == VerifyStatus::Incorrect || result == VerifyStatus::NoActiveCode);
    }

    // Even the correct code is refused now; the code is gone.
    let result = service.verify_code(&phone, "login", &code).await.unwrap();
    assert_eq!(result, VerifyStatus::TooManyAttempts);
    let after = service.verify_code(&phone, "login", &code).await.unwrap();
    assert!(
        after == VerifyStatus::TooManyAttempts || after == VerifyStatus::NoActiveCode,
        "A guessed-out code never verifies, got {after:?}"
    );
}
