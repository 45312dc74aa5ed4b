//! Error types for the tabula request pipeline

use thiserror::Error;

/// Tabula error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    // Validation Errors
    #[error("{0}")]
    Validation(String),

    #[error("Invalid table: {0}")]
    InvalidTable(String),

    #[error("Invalid column: {0}")]
    InvalidColumn(String),

    #[error("Invalid sort expression: {0}")]
    InvalidSort(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Bulk write failed: {0}")]
    BulkWriteFailed(String),

    // Authentication Errors
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    // Authorization Errors
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Lookup Errors
    #[error("{0}")]
    NotFound(String),

    #[error("Method {method} not allowed for action '{action}'")]
    MethodNotAllowed { method: String, action: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        limit: u32,
        remaining: u32,
        reset: u64,
        window: u64,
    },

    // Internal Errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Hook failed: {0}")]
    Hook(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for tabula operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP status code for each error type
impl Error {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::Validation(_)
            | Self::InvalidTable(_)
            | Self::InvalidColumn(_)
            | Self::InvalidSort(_)
            | Self::InvalidAction(_)
            | Self::BulkWriteFailed(_) => 400,

            // 401 Unauthorized
            Self::Unauthorized
            | Self::InvalidCredentials
            | Self::InvalidToken
            | Self::TokenExpired => 401,

            // 403 Forbidden
            Self::Forbidden(_) => 403,

            // 404 Not Found
            Self::NotFound(_) => 404,

            // 405 Method Not Allowed
            Self::MethodNotAllowed { .. } => 405,

            // 429 Too Many Requests
            Self::RateLimitExceeded { .. } => 429,

            // 500 Internal Server Error
            Self::Database(_)
            | Self::Config(_)
            | Self::Internal(_)
            | Self::Hook(_)
            | Self::Io(_)
            | Self::Json(_) => 500,
        }
    }

    /// Stable machine-readable error code
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InvalidTable(_) => "invalid_table",
            Self::InvalidColumn(_) => "invalid_column",
            Self::InvalidSort(_) => "invalid_sort",
            Self::InvalidAction(_) => "invalid_action",
            Self::BulkWriteFailed(_) => "bulk_write_failed",
            Self::Unauthorized => "unauthorized",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Database(_) => "database_error",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
            Self::Hook(_) => "hook_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Whether this error escaped the handled taxonomy and maps to a 500
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.status_code() >= 500
    }
}
