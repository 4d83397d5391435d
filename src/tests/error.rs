use crate::error::{AppError, ErrorCategory, ErrorSeverity};

// Unit Tests for AppError
//
// UNIT UNDER TEST: AppError taxonomy
//
// BUSINESS RESPONSIBILITY:
//   - Maps every failure mode to exactly one HTTP status per the error
//     handling design
//   - Drives the facade's retry decisions through is_retryable()
//   - Keeps internal detail out of client-visible messages

#[test]
fn test_status_codes_match_taxonomy() {
    // Arrange / Act / Assert
    assert_eq!(AppError::validation("bad phone").status_code(), 400);
    assert_eq!(AppError::auth("no credential").status_code(), 401);
    assert_eq!(AppError::quota_exceeded("key spent").status_code(), 429);
    assert_eq!(AppError::rate_limited("qwen", 30).status_code(), 429);
    assert_eq!(AppError::upstream_timeout("qwen", 60).status_code(), 504);
    assert_eq!(
        AppError::upstream_error("qwen", "HTTP 500", true, None).status_code(),
        502
    );
    assert_eq!(AppError::cancelled("sse").status_code(), 499);
    assert_eq!(AppError::unavailable("database").status_code(), 503);
    assert_eq!(AppError::internal("bug").status_code(), 500);
}

#[test]
fn test_retry_decisions_are_a_function_of_the_error_kind() {
    assert!(
        AppError::rate_limited("qwen", 5).is_retryable(),
        "Provider rate limits should be retried after a delay"
    );
    assert!(
        AppError::upstream_timeout("qwen", 60).is_retryable(),
        "Timeouts are transient and should be retried"
    );
    assert!(
        AppError::upstream_error("qwen", "connection reset", true, None).is_retryable(),
        "Transient network faults carry the retryable flag"
    );
    assert!(
        !AppError::upstream_error("qwen", "HTTP 401", false, None).is_retryable(),
        "Credential rejections must not be retried"
    );
    assert!(
        !AppError::cancelled("client gone").is_retryable(),
        "Cancellation short-circuits retries"
    );
    assert!(!AppError::validation("bad input").is_retryable());
}

#[test]
fn test_user_messages_never_leak_internal_detail() {
    // Arrange
    let err = AppError::internal("panic in palette merger: index out of bounds");

    // Act
    let message = err.user_message();

    // Assert
    assert!(
        !message.contains("palette merger"),
        "Internal detail must stay in server-side logs, got: {message}"
    );

    let err = AppError::unavailable("coordination store");
    assert!(
        !err.user_message().contains("coordination store"),
        "Dependency names are internal detail"
    );
}

#[test]
fn test_categories_and_severities() {
    assert_eq!(
        AppError::unavailable("database").category(),
        ErrorCategory::Infrastructure
    );
    assert_eq!(
        AppError::unavailable("database").severity(),
        ErrorSeverity::Critical,
        "Infrastructure outages page on-call"
    );
    assert_eq!(
        AppError::cancelled("x").category(),
        ErrorCategory::Client,
        "Cancellation is the client's doing, not a system fault"
    );
    assert_eq!(AppError::cancelled("x").severity(), ErrorSeverity::Info);
    assert_eq!(
        AppError::rate_limited("qwen", 1).category(),
        ErrorCategory::Transient
    );
}

#[test]
fn test_wire_codes_are_stable() {
    // Clients and dashboards key on these strings.
    assert_eq!(AppError::validation("x").code(), "validation");
    assert_eq!(AppError::rate_limited("p", 1).code(), "rate_limited");
    assert_eq!(AppError::upstream_timeout("p", 1).code(), "upstream_timeout");
    assert_eq!(AppError::unavailable("db").code(), "unavailable");
}
