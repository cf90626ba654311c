//! Error types for the job runtime.

use std::time::Duration;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised synchronously while accepting a job or schedule submission.
///
/// None of these ever reach the store.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid value for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Job type {name} is unavailable: {reason}")]
    TypeUnavailable { name: String, reason: String },

    #[error("Idempotency key {key} was already used with a different request")]
    IdempotencyConflict { key: String },

    #[error("Idempotency key {key} is held by a submission that has not finished")]
    IdempotencyInFlight { key: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SubmitError {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Machine-readable code surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::TypeUnavailable { .. } => "TYPE_UNAVAILABLE",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::IdempotencyInFlight { .. } => "IDEMPOTENCY_IN_FLIGHT",
            Self::Database(_) => "INTERNAL_ERROR",
        }
    }
}

/// Handler lookup errors from the type registry.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Job type {name} not found")]
    NotFound { name: String },

    #[error("Job type {name} is disabled")]
    Disabled { name: String },

    #[error("Job type {name} references unknown handler {handler_key}")]
    MissingHandler { name: String, handler_key: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Callback delivery errors. Never escalated to job state.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Callback to {url} failed: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("Callback to {url} returned HTTP {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Callback to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Callback could not be signed: {0}")]
    Signing(#[from] crate::callbacks::signing::SignatureError),

    #[error("Callback payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
