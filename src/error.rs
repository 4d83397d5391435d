//! Error types for the service core.
//!
//! This module provides structured error handling for every request path,
//! including categorization, severity levels, retry guidance, and the
//! HTTP status each error surfaces as.
//!
//! # Error Types
//!
//! The main error type is [`AppError`], which covers all failure modes:
//! - Malformed input (phone numbers, prompts, headers)
//! - Missing or invalid credentials
//! - Quota and rate-limit rejections
//! - Upstream LLM provider timeouts and failures
//! - Client-side cancellation
//! - Coordination store / database outages
//!
//! # Error Handling Example
//!
//! ```rust,no_run
//! use mindcanvas::AppError;
//!
//! fn handle_error(err: AppError) {
//!     if err.is_retryable() {
//!         // Transient failure; the facade retries these with backoff
//!     }
//!
//!     // What the client sees: a safe message and an HTTP status
//!     let body = err.user_message();
//!     let status = err.status_code();
//!     println!("{status}: {body}");
//! }
//! ```

use crate::logging::{log_debug, log_error, log_warn};
use thiserror::Error;

// ============================================================================
// Error categorization types
// ============================================================================

/// High-level categorization of errors for routing and handling decisions.
///
/// Use [`AppError::category()`] to get the category for any error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Client errors (invalid input, authentication, quota).
    ///
    /// The caller made a mistake that they can fix (bad phone number,
    /// expired credential, exhausted API key).
    Client,

    /// External service failures (LLM providers, SMS gateway).
    ///
    /// An upstream dependency had an issue. May be transient or indicate
    /// a provider outage.
    External,

    /// Temporary failures that should be retried.
    ///
    /// Rate limits and timeouts. Retry with exponential backoff.
    Transient,

    /// Infrastructure unavailable (coordination store, database).
    ///
    /// The health probe reflects these; traffic should be shed until
    /// the dependency recovers.
    Infrastructure,

    /// Internal system errors (bugs, invariant violations).
    Internal,
}

/// Severity level for logging and alerting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// System is unusable or data integrity is at risk.
    Critical,

    /// Action failed but system is stable.
    Error,

    /// Unexpected but recoverable situation.
    Warning,

    /// Expected failure (validation, cancellation, quota).
    Info,
}

// ============================================================================
// Application error type
// ============================================================================

/// Convenient result type for service operations.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Errors that can occur anywhere in the request lifecycle.
///
/// Each variant can be:
/// - Categorized via [`category()`](Self::category)
/// - Assessed for severity via [`severity()`](Self::severity)
/// - Checked for retryability via [`is_retryable()`](Self::is_retryable)
/// - Mapped to an HTTP status via [`status_code()`](Self::status_code)
/// - Converted to a client-safe message via [`user_message()`](Self::user_message)
///
/// # Creating Errors
///
/// Use the constructor methods which automatically log the error:
///
/// ```rust
/// use mindcanvas::AppError;
///
/// let err = AppError::validation("phone number must be 11 digits");
/// let err = AppError::rate_limited("qwen", 30);
/// let err = AppError::upstream_timeout("deepseek", 60);
/// ```
///
/// | Variant | Category | Retryable | Status |
/// |---------|----------|-----------|--------|
/// | `Validation` | Client | No | 400 |
/// | `Auth` | Client | No | 401 |
/// | `QuotaExceeded` | Client | No | 429 |
/// | `RateLimited` | Transient | Yes | 429 |
/// | `UpstreamTimeout` | Transient | Yes | 504 |
/// | `UpstreamError` | External | Yes* | 502 |
/// | `Cancelled` | Client | No | 499 |
/// | `Unavailable` | Infrastructure | No | 503 |
/// | `Internal` | Internal | No | 500 |
///
/// *`UpstreamError` retries only while `retryable` is set (transient
/// network faults); malformed responses and auth rejections do not.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed input: phone format, prompt length, bad header shape.
    #[error("Validation failed: {message}")]
    Validation {
        /// Description of what failed validation.
        message: String,
    },

    /// Missing, invalid, or expired credential.
    #[error("Authentication failed: {message}")]
    Auth {
        /// Details about the authentication failure.
        message: String,
    },

    /// API key quota or SMS hourly cap exhausted.
    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        /// Which quota was exhausted.
        message: String,
    },

    /// The rate limiter could not grant a permit within the deadline.
    #[error("Rate limited on provider {provider}, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Provider whose limit was hit.
        provider: String,
        /// Recommended wait time before retrying.
        retry_after_seconds: u64,
    },

    /// An LLM provider exceeded its time budget.
    #[error("Upstream timeout on provider {provider} after {timeout_seconds}s")]
    UpstreamTimeout {
        /// Provider that timed out.
        provider: String,
        /// The timeout duration that was exceeded.
        timeout_seconds: u64,
    },

    /// A provider returned a failing or malformed response after retries.
    ///
    /// Numeric provider codes are preserved in the message.
    #[error("Upstream error on provider {provider}: {message}")]
    UpstreamError {
        /// Provider that failed.
        provider: String,
        /// Details, including any numeric provider code.
        message: String,
        /// Whether the facade should retry this failure.
        retryable: bool,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Client disconnected or the request was aborted.
    ///
    /// Never surfaced to the client (they are gone); recorded for
    /// telemetry only.
    #[error("Request cancelled: {context}")]
    Cancelled {
        /// Where in the pipeline the cancellation was observed.
        context: String,
    },

    /// Coordination store or database unreachable.
    #[error("Dependency unavailable: {dependency}")]
    Unavailable {
        /// Which dependency is down ("coordination store", "database").
        dependency: String,
    },

    /// Anything else.
    #[error("Internal error: {message}")]
    Internal {
        /// Description for server-side logs.
        message: String,
    },
}

impl AppError {
    /// Get the error category for routing and handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Client,
            Self::Auth { .. } => ErrorCategory::Client,
            Self::QuotaExceeded { .. } => ErrorCategory::Client,
            Self::RateLimited { .. } => ErrorCategory::Transient,
            Self::UpstreamTimeout { .. } => ErrorCategory::Transient,
            Self::UpstreamError { .. } => ErrorCategory::External,
            Self::Cancelled { .. } => ErrorCategory::Client,
            Self::Unavailable { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Get the error severity for logging and alerting.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Validation { .. } => ErrorSeverity::Info,
            Self::Auth { .. } => ErrorSeverity::Info,
            Self::QuotaExceeded { .. } => ErrorSeverity::Info,
            Self::RateLimited { .. } => ErrorSeverity::Warning,
            Self::UpstreamTimeout { .. } => ErrorSeverity::Warning,
            Self::UpstreamError { .. } => ErrorSeverity::Error,
            Self::Cancelled { .. } => ErrorSeverity::Info,
            Self::Unavailable { .. } => ErrorSeverity::Critical,
            Self::Internal { .. } => ErrorSeverity::Error,
        }
    }

    /// Whether this error is transient and should trigger a retry.
    ///
    /// Returns `true` for rate limits, upstream timeouts, and upstream
    /// errors flagged retryable (transient network faults). Cancellation
    /// short-circuits retries and is never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::UpstreamTimeout { .. } => true,
            Self::UpstreamError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// The HTTP status this error surfaces as.
    ///
    /// `Cancelled` maps to 499 (client closed request); by the time it is
    /// produced there is nobody left to send it to, so the value only
    /// shows up in access logs.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Auth { .. } => 401,
            Self::QuotaExceeded { .. } => 429,
            Self::RateLimited { .. } => 429,
            Self::UpstreamTimeout { .. } => 504,
            Self::UpstreamError { .. } => 502,
            Self::Cancelled { .. } => 499,
            Self::Unavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    /// Short machine-readable code for the structured `{code, message}`
    /// JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Auth { .. } => "auth",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::Cancelled { .. } => "cancelled",
            Self::Unavailable { .. } => "unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    /// Convert to a client-safe message suitable for display.
    ///
    /// Technical details and internal information are stripped or
    /// generalized; full context stays in server-side logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { message } => message.clone(),
            Self::Auth { .. } => "Authentication failed. Please check your credentials".to_string(),
            Self::QuotaExceeded { .. } => {
                "Usage quota exhausted. Please contact your administrator".to_string()
            }
            Self::RateLimited {
                retry_after_seconds,
                ..
            } => {
                format!("Service is busy. Please wait {retry_after_seconds} seconds and try again")
            }
            Self::UpstreamTimeout { .. } => {
                "The AI service took too long to respond. Please try again".to_string()
            }
            Self::UpstreamError { .. } => {
                "The AI service returned an invalid response. Please try again".to_string()
            }
            Self::Cancelled { .. } => "Request cancelled".to_string(),
            Self::Unavailable { .. } => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            Self::Internal { .. } => "Something went wrong. Please try again later".to_string(),
        }
    }

    // =========================================================================
    // Constructor methods with automatic logging
    // =========================================================================
    //
    // These methods automatically log the error at the appropriate level.
    // Use them instead of constructing variants directly.

    /// Create a validation error (logs at DEBUG level).
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        log_debug!(
            error_type = "validation",
            message = %message,
            "Request validation failed"
        );
        Self::Validation { message }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        let message = message.into();
        log_debug!(
            error_type = "auth",
            message = %message,
            "Authentication rejected"
        );
        Self::Auth { message }
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "quota_exceeded",
            message = %message,
            "Quota exhausted"
        );
        Self::QuotaExceeded { message }
    }

    pub fn rate_limited(provider: impl Into<String>, retry_after_seconds: u64) -> Self {
        let provider = provider.into();
        log_warn!(
            error_type = "rate_limited",
            provider = %provider,
            retry_after_seconds = retry_after_seconds,
            "Rate limit permit not granted within deadline"
        );
        Self::RateLimited {
            provider,
            retry_after_seconds,
        }
    }

    pub fn upstream_timeout(provider: impl Into<String>, timeout_seconds: u64) -> Self {
        let provider = provider.into();
        log_warn!(
            error_type = "upstream_timeout",
            provider = %provider,
            timeout_seconds = timeout_seconds,
            "LLM provider exceeded its time budget"
        );
        Self::UpstreamTimeout {
            provider,
            timeout_seconds,
        }
    }

    pub fn upstream_error(
        provider: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let provider = provider.into();
        let message = message.into();
        log_error!(
            error_type = "upstream_error",
            provider = %provider,
            message = %message,
            retryable = retryable,
            "LLM provider request failed"
        );
        Self::UpstreamError {
            provider,
            message,
            retryable,
            source,
        }
    }

    pub fn cancelled(context: impl Into<String>) -> Self {
        let context = context.into();
        log_debug!(
            error_type = "cancelled",
            context = %context,
            "Request cancelled by client"
        );
        Self::Cancelled { context }
    }

    pub fn unavailable(dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        log_error!(
            error_type = "unavailable",
            dependency = %dependency,
            "Infrastructure dependency unreachable"
        );
        Self::Unavailable { dependency }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "internal",
            message = %message,
            "Internal error"
        );
        Self::Internal { message }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::unavailable("database")
            }
            other => Self::internal(format!("database error: {other}")),
        }
    }
}
