//! Core error types for the collector.

use thiserror::Error;

/// Core error type for configuration and startup.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Logging could not be set up
    #[error("Logging error: {0}")]
    Logging(#[from] observability::ObservabilityError),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
