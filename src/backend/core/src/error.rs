//! Error handling for Stacker.
//!
//! This module provides:
//! - One error type carrying a stable machine-readable code
//! - HTTP status code mapping for API responses
//! - User-facing messages kept apart from internal detail
//! - Severity-driven logging and an error counter metric

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Stacker operations.
pub type Result<T> = std::result::Result<T, StackerError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    InvalidTransition,
    PreconditionFailed,
    Conflict,
    ImageCountDecreased,

    // Listener Errors (1100-1199)
    ListenerBindFailure,
    AlreadyStarted,
    ShutdownTimeout,

    // Store Errors (2000-2099)
    StoreUnavailable,
    DatabaseError,
    NotFound,
    DuplicateRecord,
    ConstraintViolation,

    // Scope Errors (2100-2199)
    Cancelled,
    DeadlineExceeded,

    // Validation Errors (4100-4199)
    ValidationError,

    // Configuration Errors (5000-5099)
    ConfigInvalid,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::InvalidTransition => 1000,
            Self::PreconditionFailed => 1001,
            Self::Conflict => 1002,
            Self::ImageCountDecreased => 1003,

            Self::ListenerBindFailure => 1100,
            Self::AlreadyStarted => 1101,
            Self::ShutdownTimeout => 1102,

            Self::StoreUnavailable => 2000,
            Self::DatabaseError => 2001,
            Self::NotFound => 2002,
            Self::DuplicateRecord => 2003,
            Self::ConstraintViolation => 2004,

            Self::Cancelled => 2100,
            Self::DeadlineExceeded => 2101,

            Self::ValidationError => 4100,

            Self::ConfigInvalid => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,

            Self::InvalidTransition
            | Self::Conflict
            | Self::DuplicateRecord
            | Self::AlreadyStarted => StatusCode::CONFLICT,

            Self::PreconditionFailed
            | Self::ImageCountDecreased
            | Self::ConstraintViolation
            | Self::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,

            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,

            Self::StoreUnavailable | Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,

            Self::ListenerBindFailure
            | Self::ShutdownTimeout
            | Self::DatabaseError
            | Self::ConfigInvalid
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    ///
    /// A retryable error means the caller may re-read state and try again.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict | Self::StoreUnavailable | Self::DeadlineExceeded
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "listener",
            2000..=2099 => "store",
            2100..=2199 => "scope",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, illegal transitions, lost races)
    Low,
    /// Operational issues (timeouts, cancellations)
    Medium,
    /// System errors (database failures)
    High,
    /// Errors that stop the process from starting or shutting down cleanly
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidTransition
            | ErrorCode::PreconditionFailed
            | ErrorCode::Conflict
            | ErrorCode::ImageCountDecreased
            | ErrorCode::NotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::ConstraintViolation
            | ErrorCode::ValidationError
            | ErrorCode::AlreadyStarted => Self::Low,

            ErrorCode::Cancelled | ErrorCode::DeadlineExceeded => Self::Medium,

            ErrorCode::DatabaseError | ErrorCode::InternalError => Self::High,

            ErrorCode::StoreUnavailable
            | ErrorCode::ListenerBindFailure
            | ErrorCode::ShutdownTimeout
            | ErrorCode::ConfigInvalid => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, stacked image, listener, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty() && self.entity_id.is_none() && self.entity_type.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Stacker.
#[derive(Error, Debug)]
pub struct StackerError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for StackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl StackerError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl fmt::Display) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.to_string();
        Self::new(ErrorCode::NotFound, format!("{} not found: {}", entity_type, entity_id))
            .with_details(ErrorDetails::new().with_entity(entity_type, entity_id))
    }

    /// Create a validation error for malformed input.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create an invalid configuration error naming the offending option.
    pub fn config_invalid(option: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ConfigInvalid,
            format!("invalid configuration option `{}`: {}", option, reason),
        )
        .with_context("option", option)
    }

    /// Create a store unavailable error.
    pub fn store_unavailable(store: &str, reason: impl fmt::Display) -> Self {
        Self::with_internal(
            ErrorCode::StoreUnavailable,
            format!("{} store is unavailable", store),
            reason.to_string(),
        )
    }

    /// Create a conflict error (lost an optimistic concurrency race).
    pub fn conflict(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Create a precondition error.
    pub fn precondition(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, message)
    }

    /// Create a cancelled-scope error.
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Operation cancelled")
    }

    /// Create a deadline-exceeded error.
    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorCode::DeadlineExceeded, "Operation deadline exceeded")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "request failed"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "request failed"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "request rejected"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "stacker_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Whether the request was successful (always false for errors)
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code
    pub numeric_code: u32,

    /// User-friendly error message
    pub message: String,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&StackerError> for ErrorResponse {
    fn from(error: &StackerError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for StackerError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite result codes signalling a concurrent writer (BUSY, LOCKED and their
/// extended variants).
const SQLITE_CONTENTION_CODES: &[&str] = &["5", "6", "261", "262", "517"];

impl From<sqlx::Error> for StackerError {
    fn from(error: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::NotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => match db_err.kind() {
                ErrorKind::UniqueViolation => (
                    ErrorCode::DuplicateRecord,
                    "A record with this identifier already exists",
                ),
                ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => (
                    ErrorCode::ConstraintViolation,
                    "The record violates a store constraint",
                ),
                _ if db_err
                    .code()
                    .is_some_and(|c| SQLITE_CONTENTION_CODES.contains(&c.as_ref())) =>
                {
                    (
                        ErrorCode::Conflict,
                        "The record is being modified by a concurrent writer",
                    )
                }
                _ => (ErrorCode::DatabaseError, "A database error occurred"),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::StoreUnavailable,
                "Unable to reach the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for StackerError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::StoreUnavailable,
            "Failed to apply store migrations",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for StackerError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::ValidationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for StackerError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::DeadlineExceeded,
            "Operation deadline exceeded",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for StackerError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<anyhow::Error> for StackerError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<StackerError>() {
            Ok(stacker_error) => stacker_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for StackerError {
    fn from(error: config::ConfigError) -> Self {
        let message = match &error {
            config::ConfigError::NotFound(key) => {
                format!("missing required configuration option `{}`", key)
            }
            other => format!("invalid configuration: {}", other),
        };
        Self::new(ErrorCode::ConfigInvalid, message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl StackerError {
    /// A transition that the job state graph does not allow.
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidTransition,
            format!("invalid job transition from {} to {}", from, to),
        )
        .with_context("from", from.to_string())
        .with_context("to", to.to_string())
    }

    /// An aggregate update that would lower the number of folded images.
    pub fn image_count_decreased(current: i64, requested: i64) -> Self {
        Self::new(
            ErrorCode::ImageCountDecreased,
            format!(
                "image count cannot decrease (stored {}, requested {})",
                current, requested
            ),
        )
        .with_context("current", current)
        .with_context("requested", requested)
    }

    /// A listener socket could not be bound.
    pub fn listener_bind_failure(listener: &str, address: &str, source: std::io::Error) -> Self {
        Self::with_internal(
            ErrorCode::ListenerBindFailure,
            format!("failed to bind {} listener to {}", listener, address),
            source.to_string(),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("listener", listener)
                .with_context("address", address),
        )
        .with_source(source)
    }

    /// `start()` called on a group that has already left the created state.
    pub fn already_started(state: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::AlreadyStarted,
            format!("listener group already started (state: {})", state),
        )
    }

    /// One or more listeners did not drain before the shutdown deadline.
    pub fn shutdown_timeout(failures: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ShutdownTimeout,
            format!("listeners failed to drain in time: {}", failures.join("; ")),
        )
        .with_context("failures", failures)
    }

    /// Name of the listener a bind failure refers to, if any.
    pub fn listener_name(&self) -> Option<&str> {
        match self.details.entity_type.as_deref() {
            Some("listener") => self.details.entity_id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::InvalidTransition.http_status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::Conflict.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::ImageCountDecreased.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorCode::InternalError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::InvalidTransition.category(), "job");
        assert_eq!(ErrorCode::ShutdownTimeout.category(), "listener");
        assert_eq!(ErrorCode::DuplicateRecord.category(), "store");
        assert_eq!(ErrorCode::Cancelled.category(), "scope");
        assert_eq!(ErrorCode::ConfigInvalid.category(), "configuration");
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::Conflict.is_retryable());
        assert!(!ErrorCode::InvalidTransition.is_retryable());
        assert!(!ErrorCode::ConfigInvalid.is_retryable());
    }

    #[test]
    fn test_invalid_transition_names_states() {
        let err = StackerError::invalid_transition("pending", "stacked");
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        assert!(err.user_message().contains("pending"));
        assert!(err.user_message().contains("stacked"));
        assert_eq!(err.details().context["to"], "stacked");
    }

    #[test]
    fn test_bind_failure_names_listener() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = StackerError::listener_bind_failure("metrics", "127.0.0.1:9000", io);
        assert_eq!(err.code(), ErrorCode::ListenerBindFailure);
        assert_eq!(err.listener_name(), Some("metrics"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_response_hides_internal_message() {
        let err = StackerError::internal("connection string postgres://secret@db");
        let response = ErrorResponse::from(&err);
        assert!(!response.success);
        assert_eq!(response.error.code, ErrorCode::InternalError);
        assert!(!response.error.message.contains("secret"));
        assert!(response.error.details.is_none());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = StackerError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_pool_timeout_maps_to_unavailable() {
        let err = StackerError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
        assert!(err.is_retryable());
    }
}
