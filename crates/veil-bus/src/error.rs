//! Transport error types.

use thiserror::Error;
use veil_crypto::{CryptoError, EnvelopeError};

/// Errors from broker links, sessions and request/reply.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached or rejected the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("session disconnected")]
    Disconnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A request would have gone out without the protection it needs.
    #[error("refusing to send: {0}")]
    InsecureRefused(String),

    #[error(transparent)]
    Store(#[from] veil_common::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
