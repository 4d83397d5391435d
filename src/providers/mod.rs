//! LLM provider backends.
//!
//! This module contains the transport implementations for the upstream
//! providers the facade fans out to:
//!
//! - **oneshot**: single HTTP request, full response body returned
//! - **streaming**: HTTP response with event-per-token framing
//! - **duplex**: persistent bidirectional WebSocket (realtime scenarios)
//!
//! All three speak the OpenAI-compatible wire shape; provider-specific
//! differences are normalized here so nothing above this module sees a
//! provider's raw response.

use crate::config::{ProviderSettings, ProviderVariant};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub mod duplex;
pub mod oneshot;
pub mod streaming;

pub use duplex::DuplexProvider;
pub use oneshot::OneShotProvider;
pub use streaming::StreamProvider;

// ============================================================================
// Unified request / response types
// ============================================================================

/// Provider-agnostic chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Optional system prompt.
    pub system: Option<String>,
    /// User prompt.
    pub prompt: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
}

impl ChatRequest {
    /// A request with the service-wide defaults.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: 2000,
            temperature: 0.7,
        }
    }

    /// Attach a system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Total tokens used.
    pub total_tokens: u32,
}

/// Complete response from a one-shot call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Full completion text.
    pub content: String,
    /// Token accounting from the provider's usage block.
    pub usage: TokenUsage,
    /// Model that produced the response.
    pub model: String,
}

/// One element of a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Partial completion text.
    Delta(String),
    /// Intermediate accounting, when the provider reports it mid-stream.
    Meta {
        /// Completion tokens generated so far.
        tokens_so_far: u32,
    },
    /// Terminal marker with totals. Nothing follows.
    Done(TokenUsage),
    /// Terminal error marker. Nothing follows.
    Error {
        /// Taxonomy code (`upstream_error`, `upstream_timeout`, ...).
        kind: &'static str,
        /// Client-safe description.
        message: String,
    },
}

impl Chunk {
    /// Whether this chunk terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error { .. })
    }
}

/// Lazy, backpressured sequence of chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

// ============================================================================
// Backend trait
// ============================================================================

/// One upstream LLM provider transport.
///
/// Implementations are stateless beyond their HTTP/WS client and config;
/// rate limiting, retries, and accounting happen in the facade above.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Stable provider id, used for telemetry buckets and event tags.
    fn id(&self) -> &str;

    /// Transport variant this backend speaks.
    fn variant(&self) -> ProviderVariant;

    /// Execute a one-shot completion.
    async fn complete(&self, request: &ChatRequest) -> AppResult<ChatResponse>;

    /// Open a streaming completion.
    ///
    /// The returned stream ends with exactly one terminal chunk
    /// ([`Chunk::Done`] or [`Chunk::Error`]). Dropping the stream closes
    /// the upstream connection.
    async fn open_stream(&self, request: &ChatRequest) -> AppResult<ChunkStream>;
}

/// Construct the backend matching a provider's configured variant.
pub fn backend_for(settings: &ProviderSettings, http: reqwest::Client) -> Box<dyn ProviderBackend> {
    match settings.variant {
        ProviderVariant::OneShot => Box::new(OneShotProvider::new(settings.clone(), http)),
        ProviderVariant::Stream => Box::new(StreamProvider::new(settings.clone(), http)),
        ProviderVariant::Duplex => Box::new(DuplexProvider::new(settings.clone())),
    }
}

// ============================================================================
// OpenAI-compatible wire shapes (shared by oneshot and streaming)
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireResponse {
    pub choices: Vec<WireChoice>,
    pub usage: Option<WireUsage>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChoice {
    pub message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireResponseMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub(crate) struct WireUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: Option<u32>,
}

impl From<WireUsage> for TokenUsage {
    fn from(wire: WireUsage) -> Self {
        Self {
            prompt_tokens: wire.prompt_tokens,
            completion_tokens: wire.completion_tokens,
            total_tokens: wire
                .total_tokens
                .unwrap_or(wire.prompt_tokens + wire.completion_tokens),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireStreamEvent {
    #[serde(default)]
    pub choices: Vec<WireStreamChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireStreamChoice {
    pub delta: WireDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct WireDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl<'a> WireRequest<'a> {
    pub(crate) fn from_chat(settings: &'a ProviderSettings, request: &'a ChatRequest) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: &request.prompt,
        });
        Self {
            model: &settings.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: None,
        }
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Map a provider HTTP status into the common taxonomy. Numeric codes are
/// preserved in the message.
pub(crate) fn classify_status(provider: &str, status: u16, body: &str) -> AppError {
    let preview: String = body.chars().take(200).collect();
    match status {
        429 => AppError::rate_limited(provider, 5),
        401 | 403 => AppError::upstream_error(
            provider,
            format!("provider rejected credentials (HTTP {status}): {preview}"),
            false,
            None,
        ),
        500..=599 => AppError::upstream_error(
            provider,
            format!("provider server error (HTTP {status}): {preview}"),
            true,
            None,
        ),
        _ => AppError::upstream_error(
            provider,
            format!("unexpected provider response (HTTP {status}): {preview}"),
            false,
            None,
        ),
    }
}

/// Map a transport-level failure into the common taxonomy.
pub(crate) fn classify_transport(provider: &str, err: reqwest::Error, timeout_secs: u64) -> AppError {
    if err.is_timeout() {
        AppError::upstream_timeout(provider, timeout_secs)
    } else {
        AppError::upstream_error(
            provider,
            format!("network failure: {err}"),
            true,
            Some(Box::new(err)),
        )
    }
}
