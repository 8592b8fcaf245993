//! Error types shared across tripload crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, TriploadError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum TriploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
