//! Cryptographic primitives for Veil.
//!
//! This crate provides:
//! - RSA identity keys (PKCS#1 PEM), signatures and key wrapping
//! - AES-CBC body encryption with per-message key rotation
//! - The secure envelope protocol that combines both
//!
//! # Design
//!
//! Every message body is encrypted with a fresh symmetric key. That key is
//! wrapped with the recipient's RSA public key and the plaintext is signed
//! with the sender's RSA private key, so a peer can tell apart traffic that
//! was not addressed to it from traffic whose signature does not match.

#![forbid(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod identity;
pub mod symmetric;

pub use envelope::{Envelope, Opened, SecureEnvelope, Unsealed, PROTOCOL_VERSION};
pub use error::{CryptoError, EnvelopeError};
pub use identity::{
    asymmetric_decrypt, asymmetric_encrypt, generate_keypair, sign, verify, KeyPair, PublicKey,
    DEFAULT_KEY_BITS, MIN_KEY_BITS, PUBLIC_KEY_MARKER,
};
pub use symmetric::{generate_symmetric_material, symmetric_decrypt, symmetric_encrypt, SymmetricKey};
