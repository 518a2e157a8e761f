//! Common error types for Veil.

use thiserror::Error;

/// Result type alias using Veil's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the shared collaborator layer.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backing store unavailable or corrupt
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a storage error from any displayable type.
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
