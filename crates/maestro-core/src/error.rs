//! Error types for `Maestro` core library.

use thiserror::Error;

use crate::template::TemplateError;

/// Result type alias using `Maestro` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Maestro` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Template resolution or mutation error
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
