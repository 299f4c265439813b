//! Unified error handling for kiln-core

use thiserror::Error;

/// Stable, client-visible error codes.
///
/// These strings are part of the wire contract: every 4xx/5xx response body
/// carries one of them, and batch rows persist them in `error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Input
    ValidationError,
    TooLarge,
    ModelMismatchInBatch,
    DuplicateCustomId,
    // Admission
    QueueFull,
    MaintenanceMode,
    RateLimited,
    // Resource
    GpuUnhealthy,
    InsufficientMemory,
    ModelLoadFailed,
    FileMissing,
    // Runtime
    InferenceError,
    Timeout,
    InternalError,
    // Lifecycle
    AlreadyTerminal,
    NotFound,
    FileInUse,
    // Webhook (internal only, never surfaced over HTTP)
    WebhookRetryable,
    WebhookPermanent,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::TooLarge => "too_large",
            ErrorCode::ModelMismatchInBatch => "model_mismatch_in_batch",
            ErrorCode::DuplicateCustomId => "duplicate_custom_id",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::MaintenanceMode => "maintenance_mode",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::GpuUnhealthy => "gpu_unhealthy",
            ErrorCode::InsufficientMemory => "insufficient_memory",
            ErrorCode::ModelLoadFailed => "model_load_failed",
            ErrorCode::FileMissing => "file_missing",
            ErrorCode::InferenceError => "inference_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::AlreadyTerminal => "already_terminal",
            ErrorCode::NotFound => "not_found",
            ErrorCode::FileInUse => "file_in_use",
            ErrorCode::WebhookRetryable => "webhook_retryable",
            ErrorCode::WebhookPermanent => "webhook_permanent",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for kiln
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Input too large: {0}")]
    TooLarge(String),

    #[error("Model mismatch in batch: {0}")]
    ModelMismatch(String),

    #[error("Duplicate custom_id: {0}")]
    DuplicateCustomId(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Maintenance mode: {0}")]
    Maintenance(String),

    #[error("GPU unhealthy: {0}")]
    GpuUnhealthy(String),

    #[error("Insufficient memory: {0}")]
    InsufficientMemory(String),

    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("File missing: {0}")]
    FileMissing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("File in use: {0}")]
    FileInUse(String),

    #[error("Already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for kiln-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// The stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) => ErrorCode::ValidationError,
            Error::TooLarge(_) => ErrorCode::TooLarge,
            Error::ModelMismatch(_) => ErrorCode::ModelMismatchInBatch,
            Error::DuplicateCustomId(_) => ErrorCode::DuplicateCustomId,
            Error::QueueFull(_) => ErrorCode::QueueFull,
            Error::Maintenance(_) => ErrorCode::MaintenanceMode,
            Error::GpuUnhealthy(_) => ErrorCode::GpuUnhealthy,
            Error::InsufficientMemory(_) => ErrorCode::InsufficientMemory,
            Error::ModelLoadFailed(_) => ErrorCode::ModelLoadFailed,
            Error::FileMissing(_) => ErrorCode::FileMissing,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::FileInUse(_) => ErrorCode::FileInUse,
            Error::AlreadyTerminal(_) => ErrorCode::AlreadyTerminal,
            Error::Database(_) | Error::Io(_) | Error::Json(_) | Error::Config(_) | Error::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::validation("missing custom_id");
        assert_eq!(err.to_string(), "Validation error: missing custom_id");
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(Error::validation("x").code(), ErrorCode::ValidationError);
        assert_eq!(Error::QueueFull("depth 100".into()).code(), ErrorCode::QueueFull);
        assert_eq!(Error::internal("boom").code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_code_wire_strings() {
        assert_eq!(ErrorCode::ModelMismatchInBatch.as_str(), "model_mismatch_in_batch");
        assert_eq!(ErrorCode::RateLimited.to_string(), "rate_limited");
    }
}
