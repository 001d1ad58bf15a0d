//! Error types for dogood
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in dogood
#[derive(Debug, Error)]
pub enum DogoodError {
    /// Store unavailable after the retry budget was exhausted
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invariant violation — a logic bug, not a runtime condition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Rate limit category was never registered
    #[error("Unknown rate category: {0}")]
    UnknownCategory(String),

    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for dogood operations
pub type Result<T> = std::result::Result<T, DogoodError>;
