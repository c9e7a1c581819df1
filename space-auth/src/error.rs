//! Error types and HTTP response conversion

use axum::{
    http::{header::HeaderValue, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::SessionRejection;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Authentication subsystem error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Email/password combination did not match a user
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Account is currently locked out
    #[error("account locked, retry in {retry_after_secs} seconds")]
    AccountLocked {
        /// Seconds until the lock expires
        retry_after_secs: u64,
    },

    /// Too many recent failures for this username or origin
    #[error("too many failed login attempts, retry in {retry_after_secs} seconds")]
    TooManyAttempts {
        /// Length of the counting window in seconds
        retry_after_secs: u64,
    },

    /// Token authenticated correctly but is past its expiry
    #[error("token has expired")]
    TokenExpired,

    /// Token failed authentication or is malformed
    #[error("token is invalid")]
    TokenInvalidSignature,

    /// Token could not be serialized or encrypted
    #[error("failed to create token: {0}")]
    TokenCreationFailed(String),

    /// Refresh token does not map to a usable session.
    ///
    /// The rejection reason is kept for logging only; `Display` never
    /// reveals it.
    #[error("session is invalid")]
    SessionInvalid(SessionRejection),

    /// Malformed input
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Requested record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence layer failure
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Missing or malformed authorization header
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error belongs to the collapsed "authentication failed" class
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Error::InvalidCredentials
                | Error::TokenExpired
                | Error::TokenInvalidSignature
                | Error::SessionInvalid(_)
                | Error::Unauthorized(_)
        )
    }
}

// ============================================================================
// Structured storage errors
// ============================================================================

/// Storage operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOperation {
    /// Establishing a connection or pool
    Connect,
    /// Reading rows
    Query,
    /// Inserting rows
    Insert,
    /// Updating rows
    Update,
    /// Deleting rows
    Delete,
    /// Transaction begin/commit
    Transaction,
    /// Schema creation
    Migration,
}

impl fmt::Display for StorageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Query => "query",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Transaction => "transaction",
            Self::Migration => "migration",
        };
        f.write_str(s)
    }
}

/// Category of storage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorKind {
    /// Could not reach the database
    ConnectionFailed,
    /// Pool had no free connection in time
    PoolExhausted,
    /// Unique or foreign key constraint violated
    ConstraintViolation,
    /// Statement failed
    QueryFailed,
    /// Column could not be decoded
    TypeConversion,
    /// Operation timed out
    Timeout,
    /// Anything else
    Other,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionFailed => "connection_failed",
            Self::PoolExhausted => "pool_exhausted",
            Self::ConstraintViolation => "constraint_violation",
            Self::QueryFailed => "query_failed",
            Self::TypeConversion => "type_conversion",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Storage error with the failing operation and a category
#[derive(Debug, Clone)]
pub struct StorageError {
    /// Operation being performed
    pub operation: StorageOperation,
    /// Failure category
    pub kind: StorageErrorKind,
    /// Detail message (never returned to clients)
    pub message: String,
}

impl StorageError {
    /// Create a new storage error
    pub fn new(
        operation: StorageOperation,
        kind: StorageErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
        }
    }

    /// Constraint violation, e.g. a duplicate refresh token
    pub fn constraint(operation: StorageOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StorageErrorKind::ConstraintViolation, message)
    }

    /// Whether a caller further up could reasonably retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            StorageErrorKind::ConnectionFailed
                | StorageErrorKind::PoolExhausted
                | StorageErrorKind::Timeout
        )
    }

    /// Attach the operation to an error converted from the driver
    #[cfg(feature = "database")]
    pub(crate) fn from_sqlx(operation: StorageOperation, err: sqlx::Error) -> Self {
        let mut converted = Self::from(err);
        if converted.operation == StorageOperation::Query {
            converted.operation = operation;
        }
        converted
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} failed: {}", self.operation, self.kind, self.message)
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::RowNotFound => Self::new(
                StorageOperation::Query,
                StorageErrorKind::QueryFailed,
                "Row not found",
            ),
            E::PoolTimedOut => Self::new(
                StorageOperation::Connect,
                StorageErrorKind::PoolExhausted,
                "Connection pool timed out",
            ),
            E::PoolClosed => Self::new(
                StorageOperation::Connect,
                StorageErrorKind::ConnectionFailed,
                "Connection pool is closed",
            ),
            E::Io(e) => Self::new(
                StorageOperation::Connect,
                StorageErrorKind::ConnectionFailed,
                e.to_string(),
            ),
            E::Tls(e) => Self::new(
                StorageOperation::Connect,
                StorageErrorKind::ConnectionFailed,
                format!("TLS error: {}", e),
            ),
            E::ColumnDecode { index, source } => Self::new(
                StorageOperation::Query,
                StorageErrorKind::TypeConversion,
                format!("Failed to decode column {}: {}", index, source),
            ),
            E::Decode(e) => Self::new(
                StorageOperation::Query,
                StorageErrorKind::TypeConversion,
                e.to_string(),
            ),
            E::Database(db_err) => {
                let kind = if db_err.is_unique_violation()
                    || db_err.is_foreign_key_violation()
                    || db_err.is_check_violation()
                {
                    StorageErrorKind::ConstraintViolation
                } else {
                    StorageErrorKind::QueryFailed
                };
                Self::new(StorageOperation::Query, kind, db_err.to_string())
            }
            other => Self::new(
                StorageOperation::Query,
                StorageErrorKind::Other,
                other.to_string(),
            ),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(StorageError::from(err))
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

// ============================================================================
// HTTP responses
// ============================================================================

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Machine-readable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create an error response with a code
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

const AUTHENTICATION_FAILED: &str = "Authentication failed";

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut retry_after = None;

        let (status, error_response) = match self {
            Error::InvalidCredentials
            | Error::TokenInvalidSignature
            | Error::SessionInvalid(_)
            | Error::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(
                    StatusCode::UNAUTHORIZED,
                    "AUTHENTICATION_FAILED",
                    AUTHENTICATION_FAILED,
                ),
            ),

            Error::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED", "Token has expired"),
            ),

            Error::AccountLocked { retry_after_secs } => {
                retry_after = Some(retry_after_secs);
                (
                    StatusCode::LOCKED,
                    ErrorResponse::with_code(
                        StatusCode::LOCKED,
                        "ACCOUNT_LOCKED",
                        format!("Account locked. Try again in {} seconds", retry_after_secs),
                    ),
                )
            }

            Error::TooManyAttempts { retry_after_secs } => {
                retry_after = Some(retry_after_secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    ErrorResponse::with_code(
                        StatusCode::TOO_MANY_REQUESTS,
                        "TOO_MANY_ATTEMPTS",
                        "Too many failed login attempts",
                    ),
                )
            }

            Error::ValidationError(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            ),

            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ),

            Error::Storage(ref e) => {
                tracing::error!(
                    operation = %e.operation,
                    kind = %e.kind,
                    retriable = e.is_retriable(),
                    "Storage error: {}", e.message
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "STORAGE_ERROR",
                        "Storage operation failed",
                    ),
                )
            }

            Error::TokenCreationFailed(msg) | Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "Internal server error",
                    ),
                )
            }

            Error::Config(e) => {
                tracing::error!("Configuration error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "CONFIG_ERROR",
                        "Service misconfigured",
                    ),
                )
            }

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "IO_ERROR",
                        "I/O operation failed",
                    ),
                )
            }
        };

        let mut response = (status, Json(error_response)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("retry-after"), value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_invalid_display_hides_reason() {
        let err = Error::SessionInvalid(SessionRejection::Blocked);
        assert_eq!(err.to_string(), "session is invalid");

        let err = Error::SessionInvalid(SessionRejection::Unknown);
        assert_eq!(err.to_string(), "session is invalid");
    }

    #[test]
    fn test_authentication_failures_share_status_and_code() {
        let errors = [
            Error::InvalidCredentials,
            Error::TokenInvalidSignature,
            Error::SessionInvalid(SessionRejection::Expired),
            Error::SessionInvalid(SessionRejection::Unknown),
        ];
        for err in errors {
            assert!(err.is_authentication_failure());
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_account_locked_sets_retry_after() {
        let response = Error::AccountLocked {
            retry_after_secs: 120,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert_eq!(
            response.headers().get("retry-after").and_then(|v| v.to_str().ok()),
            Some("120")
        );
    }

    #[test]
    fn test_validation_maps_to_bad_request() {
        let response = Error::ValidationError("email is required".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_storage_error_is_server_error() {
        let err = Error::Storage(StorageError::new(
            StorageOperation::Update,
            StorageErrorKind::ConnectionFailed,
            "connection refused",
        ));
        assert!(!err.is_authentication_failure());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_storage_error_retriable() {
        let err = StorageError::new(
            StorageOperation::Connect,
            StorageErrorKind::PoolExhausted,
            "timed out",
        );
        assert!(err.is_retriable());

        let err = StorageError::constraint(StorageOperation::Insert, "duplicate");
        assert!(!err.is_retriable());
        assert_eq!(err.to_string(), "insert constraint_violation failed: duplicate");
    }
}
