//! # mindcanvas
//!
//! Concurrency, rate-limiting, and resource-control core for a
//! multi-tenant AI diagram-generation service.
//!
//! ## Key Components
//!
//! - **Rate limiter**: per-provider QPM sliding window plus concurrent
//!   slots, coordinated across worker processes through the store
//! - **LLM facade**: one safe call surface over heterogeneous providers
//!   with timeouts, retries, classification, and accounting
//! - **Node-palette streamer**: parallel provider fan-out merged into a
//!   single de-duplicated SSE stream with cooperative cancellation
//! - **Token-usage buffer**: hot-path store append, batched background
//!   persistence
//! - **SMS code service**: atomic issue/consume of short-lived codes
//!   under contention
//!
//! ## Example
//!
//! ```rust,no_run
//! use mindcanvas::{config::AppConfig, server};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AppConfig::from_env()?;
//! let state = server::AppState::from_config(config).await?;
//! server::serve(state).await?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module declarations
// =============================================================================

pub mod auth;
pub mod config;
pub mod db;
pub mod diagram;
pub mod error;
pub mod facade;
pub mod palette;
pub mod providers;
pub mod ratelimit;
pub mod server;
pub mod sms;
pub mod store;
pub mod telemetry;
pub mod usage;

// Internal modules
pub(crate) mod logging;

#[cfg(test)]
pub mod tests;

// =============================================================================
// Public API re-exports
// =============================================================================

// Errors
pub use error::{AppError, AppResult};

// Configuration
pub use config::{AppConfig, LimitScope, ProviderSettings, ProviderVariant};

// Rate limiting
pub use ratelimit::{Permit, RateLimiter};

// Facade and provider types
pub use facade::{CallContext, LlmFacade, RetryPolicy};
pub use providers::{ChatRequest, ChatResponse, Chunk, ChunkStream, TokenUsage};

// Palette
pub use palette::{PaletteEvent, PaletteSession, PaletteStreamer, SessionManager};

// Accounting
pub use usage::{TokenUsageBuffer, UsageRecord, UsageSink};

// SMS
pub use sms::{SendStatus, SmsCodeService, SmsGateway, VerifyStatus};

// Store
pub use store::{CoordinationStore, StoreError};
