//! Crypto error types.

use thiserror::Error;

/// Errors from the primitive layer (keys, RSA, AES).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key too small: {bits} bits (minimum {min})")]
    KeyTooSmall { bits: usize, min: usize },

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The ciphertext was not produced for this keypair.
    #[error("decryption failed: ciphertext was not produced for this key")]
    Decryption,

    #[error("invalid symmetric key length: {0} bits")]
    InvalidKeyLength(usize),

    #[error("invalid initialization vector length: {0} bits")]
    InvalidIvLength(usize),

    /// Malformed block-cipher ciphertext or padding.
    #[error("invalid padding")]
    Padding,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from opening or sealing an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// No version tag: not produced by this protocol.
    #[error("unknown protocol: no version tag present")]
    UnknownProtocol,

    /// The envelope declared another protocol version and could not be
    /// decoded with the local rules.
    #[error("version mismatch: local {local} vs. remote {remote}")]
    VersionMismatch { local: u64, remote: u64 },

    /// The wrapped key was not encrypted for this keypair.
    #[error("envelope was not encrypted for this key")]
    Unauthorized,

    /// The envelope was sealed by this instance for someone else.
    #[error("own message")]
    OwnMessage,

    #[error("invalid signature")]
    SignatureMismatch,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
