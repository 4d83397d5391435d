//! LLM facade.
//!
//! One uniform, observable, safe invocation surface over all configured
//! providers. Every call:
//!
//! - obtains a rate-limiter [`Permit`](crate::ratelimit::Permit) before
//!   any network I/O and releases it on every exit path,
//! - runs under the provider's per-attempt timeout,
//! - retries transient failures with exponential backoff and jitter,
//! - classifies provider errors into the common taxonomy,
//! - reports tokens and latency to the usage buffer and telemetry sink.
//!
//! The facade is stateless beyond its provider table; retry decisions
//! are a pure function of the error's kind, never of exception classes.

use crate::config::ProviderSettings;
use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_warn};
use crate::providers::{
    backend_for, ChatRequest, ChatResponse, Chunk, ChunkStream, ProviderBackend, TokenUsage,
};
use crate::ratelimit::RateLimiter;
use crate::telemetry::TelemetrySink;
use crate::usage::{UsageRecord, UsageSink};
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Chunk pipeline depth between the facade's stream wrapper and its
/// consumer. Small so a stalled consumer stalls the producer.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Retry policy for provider calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Delay before the single retry granted to a provider 429.
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            rate_limit_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after `attempt` failures: 1 s, 2 s, 4 s
    /// with up to 10% jitter to avoid thundering herds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let jitter = 1.0 + fastrand::f64() * 0.1;
        Duration::from_secs_f64(base * jitter)
    }
}

/// Per-call identity and cancellation context, threaded explicitly
/// through every facade API. A detached value: holding one never holds
/// a database connection.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub user_id: i64,
    pub org_id: Option<i64>,
    pub api_key_id: Option<i64>,
    /// Telemetry bucket ("generate_diagram", "node_palette", ...).
    pub request_type: String,
    /// Child token of the request's cancellation tree.
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(user_id: i64, request_type: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            user_id,
            org_id: None,
            api_key_id: None,
            request_type: request_type.into(),
            cancel,
        }
    }
}

struct ProviderEntry {
    backend: Box<dyn ProviderBackend>,
    settings: ProviderSettings,
}

/// The facade. One per worker process, injected everywhere LLM calls
/// are made.
pub struct LlmFacade {
    providers: HashMap<String, ProviderEntry>,
    limiter: Arc<RateLimiter>,
    usage: Arc<dyn UsageSink>,
    telemetry: Arc<TelemetrySink>,
    retry: RetryPolicy,
}

impl LlmFacade {
    /// Build backends for every configured provider.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] if the shared HTTP client cannot
    /// be constructed.
    pub fn new(
        providers: &[ProviderSettings],
        limiter: Arc<RateLimiter>,
        usage: Arc<dyn UsageSink>,
        telemetry: Arc<TelemetrySink>,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::internal(format!("http client build failed: {e}")))?;

        let providers = providers
            .iter()
            .map(|settings| {
                (
                    settings.id.clone(),
                    ProviderEntry {
                        backend: backend_for(settings, http.clone()),
                        settings: settings.clone(),
                    },
                )
            })
            .collect();

        Ok(Self {
            providers,
            limiter,
            usage,
            telemetry,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy (tests use fast delays).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ids of all configured providers.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    fn entry(&self, provider_id: &str) -> AppResult<&ProviderEntry> {
        self.providers
            .get(provider_id)
            .ok_or_else(|| AppError::internal(format!("unknown provider: {provider_id}")))
    }

    // ------------------------------------------------------------------
    // One-shot calls
    // ------------------------------------------------------------------

    /// Execute a one-shot completion with retries.
    ///
    /// The permit is held across retries and released on all exit paths.
    pub async fn chat(
        &self,
        provider_id: &str,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> AppResult<ChatResponse> {
        let entry = self.entry(provider_id)?;
        let permit = self
            .limiter
            .acquire_with_deadline(provider_id, &ctx.cancel, entry.settings.request_timeout)
            .await?;

        let outcome = self.chat_attempts(entry, request, ctx).await;

        permit.release().await;
        outcome
    }

    async fn chat_attempts(
        &self,
        entry: &ProviderEntry,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> AppResult<ChatResponse> {
        let provider_id = entry.backend.id();
        let mut rate_limit_retried = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return Err(AppError::cancelled("chat"));
            }

            let started = Instant::now();
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => Err(AppError::cancelled("chat")),
                result = entry.backend.complete(request) => result,
            };
            let latency = started.elapsed();
            self.telemetry.record(
                &ctx.request_type,
                provider_id,
                latency,
                result.as_ref().map(|_| ()).map_err(|e| e),
            );

            let err = match result {
                Ok(response) => {
                    self.record_usage(ctx, &response.model, response.usage, true)
                        .await;
                    return Ok(response);
                }
                Err(err) => err,
            };

            let retry_delay = match &err {
                AppError::Cancelled { .. } => None,
                AppError::RateLimited { .. } if !rate_limit_retried => {
                    // A provider 429 gets a single, longer-delayed retry.
                    rate_limit_retried = true;
                    Some(self.retry.rate_limit_delay)
                }
                e if e.is_retryable() && attempt < self.retry.max_attempts => {
                    Some(self.retry.delay_for(attempt))
                }
                _ => None,
            };

            match retry_delay {
                Some(delay) => {
                    log_debug!(
                        provider = provider_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying provider call after delay"
                    );
                    self.sleep_cancellable(delay, &ctx.cancel).await?;
                }
                None => {
                    self.record_usage(ctx, &entry.settings.model, TokenUsage::default(), false)
                        .await;
                    return Err(err);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Streaming calls
    // ------------------------------------------------------------------

    /// Open a streaming completion.
    ///
    /// The permit is held for the entire lifetime of the returned stream
    /// and released when the stream ends, errors, or is dropped — the
    /// wrapper task is the `finally`-equivalent path. Stream-open
    /// failures retry under the same policy as one-shot calls.
    pub async fn chat_stream(
        &self,
        provider_id: &str,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> AppResult<ChunkStream> {
        let entry = self.entry(provider_id)?;
        let permit = self
            .limiter
            .acquire_with_deadline(provider_id, &ctx.cancel, entry.settings.request_timeout)
            .await?;

        let inner = match self.open_stream_attempts(entry, request, ctx).await {
            Ok(inner) => inner,
            Err(err) => {
                permit.release().await;
                return Err(err);
            }
        };

        let ctx = ctx.clone();
        let model = entry.settings.model.clone();
        let provider = provider_id.to_string();
        let usage_buffer = Arc::clone(&self.usage);
        let telemetry = Arc::clone(&self.telemetry);
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        // Wrapper task: forwards chunks under backpressure, watches the
        // cancellation token, records accounting, and owns the permit so
        // it releases no matter how the stream ends.
        tokio::spawn(async move {
            let mut inner = inner;
            let started = Instant::now();
            let mut final_usage: Option<TokenUsage> = None;
            let mut failed = false;
            let mut cancelled = false;

            loop {
                let chunk = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    chunk = inner.next() => chunk,
                };

                let Some(chunk) = chunk else { break };
                let terminal = chunk.is_terminal();
                match &chunk {
                    Chunk::Done(usage) => final_usage = Some(*usage),
                    Chunk::Error { .. } => failed = true,
                    _ => {}
                }
                if tx.send(chunk).await.is_err() {
                    // Consumer dropped the stream; treat as cancellation.
                    cancelled = true;
                    break;
                }
                if terminal {
                    break;
                }
            }

            // Dropping the inner stream here closes the upstream
            // connection within the producer's next send.
            drop(inner);

            let usage = final_usage.unwrap_or_default();
            let succeeded = final_usage.is_some() && !failed;
            if succeeded || failed {
                usage_buffer
                    .enqueue(UsageRecord {
                        user_id: ctx.user_id,
                        org_id: ctx.org_id,
                        model,
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        request_type: ctx.request_type.clone(),
                        succeeded,
                        created_at: Utc::now(),
                    })
                    .await;
            }

            let outcome_err;
            let outcome: Result<(), &AppError> = if cancelled {
                outcome_err = AppError::cancelled("chat_stream");
                Err(&outcome_err)
            } else if failed {
                outcome_err =
                    AppError::upstream_error(&provider, "stream ended in error", false, None);
                Err(&outcome_err)
            } else {
                Ok(())
            };
            telemetry.record(&ctx.request_type, &provider, started.elapsed(), outcome);

            permit.release().await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn open_stream_attempts(
        &self,
        entry: &ProviderEntry,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> AppResult<ChunkStream> {
        let provider_id = entry.backend.id();
        let mut rate_limit_retried = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return Err(AppError::cancelled("chat_stream open"));
            }

            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => Err(AppError::cancelled("chat_stream open")),
                result = entry.backend.open_stream(request) => result,
            };

            let err = match result {
                Ok(stream) => return Ok(stream),
                Err(err) => err,
            };

            let retry_delay = match &err {
                AppError::Cancelled { .. } => None,
                AppError::RateLimited { .. } if !rate_limit_retried => {
                    rate_limit_retried = true;
                    Some(self.retry.rate_limit_delay)
                }
                e if e.is_retryable() && attempt < self.retry.max_attempts => {
                    Some(self.retry.delay_for(attempt))
                }
                _ => None,
            };

            match retry_delay {
                Some(delay) => self.sleep_cancellable(delay, &ctx.cancel).await?,
                None => {
                    log_warn!(
                        provider = provider_id,
                        attempts = attempt,
                        error = %err,
                        "Stream open failed after all attempts"
                    );
                    return Err(err);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    async fn record_usage(&self, ctx: &CallContext, model: &str, usage: TokenUsage, succeeded: bool) {
        self.usage
            .enqueue(UsageRecord {
                user_id: ctx.user_id,
                org_id: ctx.org_id,
                model: model.to_string(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                request_type: ctx.request_type.clone(),
                succeeded,
                created_at: Utc::now(),
            })
            .await;
    }

    async fn sleep_cancellable(
        &self,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::cancelled("retry backoff")),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl std::fmt::Debug for LlmFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmFacade")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
