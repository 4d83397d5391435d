//! Shared fixtures for the integration tests.
//!
//! These helpers are test-only and should NEVER be used in production
//! code.

// Allow dead code in test utilities - functions are used across different test files
#![allow(dead_code)]

use async_trait::async_trait;
use mindcanvas::config::{LimitScope, ProviderSettings, ProviderVariant};
use mindcanvas::telemetry::TelemetrySink;
use mindcanvas::usage::{UsageRecord, UsageSink};
use mindcanvas::{LlmFacade, RateLimiter, RetryPolicy};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A provider aimed at a wiremock server.
pub fn test_provider(id: &str, base_url: &str, variant: ProviderVariant) -> ProviderSettings {
    ProviderSettings {
        id: id.to_string(),
        api_key: "sk-test".to_string(),
        base_url: base_url.trim_end_matches('/').to_string(),
        model: format!("{id}-model"),
        variant,
        qpm_limit: 100,
        concurrent_limit: 10,
        scope: LimitScope::Process,
        request_timeout: Duration::from_secs(2),
    }
}

/// Fast delays so retry tests finish in milliseconds.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        rate_limit_delay: Duration::from_millis(20),
    }
}

/// In-memory sink collecting everything the facade reports.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<UsageRecord>>,
}

#[async_trait]
impl UsageSink for RecordingSink {
    async fn enqueue(&self, record: UsageRecord) {
        self.records.lock().expect("sink mutex").push(record);
    }
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<UsageRecord> {
        self.records.lock().expect("sink mutex").clone()
    }
}

/// Facade over the given providers with a process-scope limiter, a
/// recording sink, and fast retries.
pub fn build_facade(
    providers: &[ProviderSettings],
) -> (Arc<LlmFacade>, Arc<RateLimiter>, Arc<RecordingSink>) {
    let limiter = Arc::new(RateLimiter::new(providers, None));
    let sink = Arc::new(RecordingSink::default());
    let facade = LlmFacade::new(
        providers,
        Arc::clone(&limiter),
        Arc::clone(&sink) as Arc<dyn UsageSink>,
        Arc::new(TelemetrySink::default()),
    )
    .expect("facade builds")
    .with_retry_policy(fast_retry());
    (Arc::new(facade), limiter, sink)
}

/// OpenAI-compatible one-shot response body.
pub fn one_shot_body(content: &str, prompt_tokens: u32, completion_tokens: u32) -> serde_json::Value {
    json!({
        "choices": [{ "message": { "content": content } }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
        "model": "test-model",
    })
}

/// OpenAI-compatible streaming body: one `data:` frame per delta, a
/// usage frame, then the `[DONE]` sentinel.
pub fn sse_body(deltas: &[&str], prompt_tokens: u32, completion_tokens: u32) -> String {
    let mut body = String::new();
    for delta in deltas {
        let frame = json!({
            "choices": [{ "delta": { "content": delta }, "finish_reason": null }]
        });
        body.push_str(&format!("data: {frame}\n"));
    }
    let usage_frame = json!({
        "choices": [],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        }
    });
    body.push_str(&format!("data: {usage_frame}\n"));
    body.push_str("data: [DONE]\n");
    body
}
