//! Secure envelope protocol.
//!
//! An envelope is the JSON text actually put on the wire:
//!
//! ```text
//! {"version": 1, "secure": true,  "data": {"m": <body>, "s": <signature>, "k": <wrapped key>}}
//! {"version": 1, "secure": false, "data": <message verbatim>}
//! ```
//!
//! In secure mode the serialized message is signed with the sender's private
//! key, encrypted with a fresh AES key, and that AES key (plus IV) is wrapped
//! with the recipient's RSA public key. All binary fields are standard base64.
//!
//! Opening an envelope is a two-phase operation. [`SecureEnvelope::classify`]
//! unwraps and decrypts without enforcing the signature and reports what it
//! found as an [`Unsealed`] variant; signature policy is then up to the caller.
//! [`SecureEnvelope::decrypt`] is the strict shortcut built on top of it.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{CryptoError, EnvelopeError};
use crate::identity::{KeyPair, PublicKey};
use crate::symmetric::SymmetricKey;

/// Protocol version written into every envelope.
pub const PROTOCOL_VERSION: u64 = 1;

/// How many recently sealed wrapped keys are remembered for own-message detection.
const SEALED_HISTORY: usize = 256;

/// Wire form of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u64,
    pub secure: bool,
    pub data: Value,
}

/// `data` of a secure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// AES-CBC ciphertext of the message.
    pub m: String,
    /// Signature over the plaintext message.
    pub s: String,
    /// RSA-wrapped `{"key", "iv"}` document.
    pub k: String,
}

#[derive(Serialize, Deserialize)]
struct WrappedKey {
    key: String,
    iv: String,
}

/// A successfully opened envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Opened {
    /// The envelope with `data` replaced by the decrypted text for secure
    /// envelopes, or untouched for insecure ones.
    pub envelope: Envelope,
    /// The message as text. For insecure envelopes this is `data` re-serialized.
    pub plaintext: String,
}

/// Result of opening an envelope without enforcing the signature.
#[derive(Debug)]
pub enum Unsealed {
    /// Opened, and the signature matched the remote key.
    Decrypted(Opened),
    /// An insecure envelope. It carries no signature, so it proves nothing about its sender.
    Plain(Opened),
    /// Opened, but the signature did not match the remote key.
    BadSignature(Opened),
    /// Encrypted for another keypair.
    NotForMe,
    /// Sealed by this instance for another keypair.
    OwnMessage,
    /// Could not be parsed or decrypted.
    Malformed(EnvelopeError),
}

/// Seals and opens envelopes for one local identity and one optional remote peer.
pub struct SecureEnvelope {
    keys: Arc<KeyPair>,
    remote: Option<PublicKey>,
    symmetric: SymmetricKey,
    rotate: bool,
    sealed: VecDeque<[u8; 32]>,
}

impl SecureEnvelope {
    /// Create an envelope codec.
    ///
    /// The envelope is secure iff `remote_pem` is present and starts with the
    /// PKCS#1 public key marker. Anything else silently selects insecure mode;
    /// a marker followed by an unparseable key is an error.
    pub fn new(
        keys: Arc<KeyPair>,
        remote_pem: Option<&str>,
        rotate: bool,
    ) -> Result<Self, EnvelopeError> {
        let remote = match remote_pem {
            Some(pem) if PublicKey::looks_like_pem(pem) => Some(PublicKey::from_pem(pem)?),
            Some(_) => {
                debug!("remote key is not a public key, using insecure mode");
                None
            }
            None => None,
        };
        Ok(Self {
            keys,
            remote,
            symmetric: SymmetricKey::generate(),
            rotate,
            sealed: VecDeque::with_capacity(SEALED_HISTORY),
        })
    }

    pub fn is_secure(&self) -> bool {
        self.remote.is_some()
    }

    pub fn rotates(&self) -> bool {
        self.rotate
    }

    pub fn remote_key(&self) -> Option<&PublicKey> {
        self.remote.as_ref()
    }

    pub fn keys(&self) -> &Arc<KeyPair> {
        &self.keys
    }

    /// Replace the symmetric key and IV with fresh random material.
    pub fn rotate_symmetric(&mut self) {
        self.symmetric = SymmetricKey::generate();
    }

    /// Seal a structured message. The message is serialized to JSON first.
    pub fn encrypt<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<String, EnvelopeError> {
        let value = serde_json::to_value(message)?;
        let text = serde_json::to_string(&value)?;
        self.seal(value, text.as_bytes())
    }

    /// Seal a message that is already text.
    pub fn encrypt_str(&mut self, message: &str) -> Result<String, EnvelopeError> {
        self.seal(Value::String(message.to_string()), message.as_bytes())
    }

    fn seal(&mut self, raw: Value, message: &[u8]) -> Result<String, EnvelopeError> {
        if self.rotate {
            self.rotate_symmetric();
        }

        let data = match &self.remote {
            None => raw,
            Some(remote) => {
                let signature = self.keys.sign(message)?;
                let body = self.symmetric.encrypt(message)?;
                let wrapped = Zeroizing::new(serde_json::to_vec(&WrappedKey {
                    key: STANDARD.encode(self.symmetric.key()),
                    iv: STANDARD.encode(self.symmetric.iv()),
                })?);
                let wrapped = remote.encrypt(&wrapped)?;
                remember_sealed(&mut self.sealed, &wrapped);
                serde_json::to_value(SealedPayload {
                    m: STANDARD.encode(body),
                    s: STANDARD.encode(signature),
                    k: STANDARD.encode(wrapped),
                })?
            }
        };

        let envelope = Envelope {
            version: PROTOCOL_VERSION,
            secure: self.remote.is_some(),
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    fn sealed_by_me(&self, wrapped: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(wrapped).into();
        self.sealed.contains(&digest)
    }

    /// Open an envelope without enforcing its signature.
    pub fn classify(&self, text: &str) -> Unsealed {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return Unsealed::Malformed(EnvelopeError::Malformed(e.to_string())),
        };
        let Some(object) = value.as_object() else {
            return Unsealed::Malformed(EnvelopeError::Malformed("not an object".into()));
        };
        let Some(version) = object.get("version") else {
            return Unsealed::Malformed(EnvelopeError::UnknownProtocol);
        };
        let Some(version) = version.as_u64() else {
            return Unsealed::Malformed(EnvelopeError::UnknownProtocol);
        };
        if version != PROTOCOL_VERSION {
            warn!(
                local = PROTOCOL_VERSION,
                remote = version,
                "envelope version mismatch, decoding best-effort"
            );
        }

        match self.open(version, object.get("secure"), object.get("data")) {
            Err(e) if version != PROTOCOL_VERSION => {
                debug!(error = %e, "failed to decode foreign envelope version");
                Unsealed::Malformed(EnvelopeError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: version,
                })
            }
            Err(e) => Unsealed::Malformed(e),
            Ok(unsealed) => unsealed,
        }
    }

    fn open(
        &self,
        version: u64,
        secure: Option<&Value>,
        data: Option<&Value>,
    ) -> Result<Unsealed, EnvelopeError> {
        let secure = secure
            .and_then(Value::as_bool)
            .ok_or_else(|| EnvelopeError::Malformed("missing 'secure' flag".into()))?;
        let data = data.cloned().unwrap_or(Value::Null);

        if !secure {
            let plaintext = serde_json::to_string(&data)?;
            return Ok(Unsealed::Plain(Opened {
                envelope: Envelope {
                    version,
                    secure,
                    data,
                },
                plaintext,
            }));
        }

        let sealed: SealedPayload = serde_json::from_value(data)
            .map_err(|e| EnvelopeError::Malformed(format!("secure payload: {}", e)))?;
        let body = decode_field("m", &sealed.m)?;
        let signature = decode_field("s", &sealed.s)?;
        let wrapped = decode_field("k", &sealed.k)?;

        let unwrapped = match self.keys.decrypt(&wrapped) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(CryptoError::Decryption) if self.sealed_by_me(&wrapped) => {
                return Ok(Unsealed::OwnMessage)
            }
            Err(CryptoError::Decryption) => return Ok(Unsealed::NotForMe),
            Err(e) => return Err(e.into()),
        };
        let wrapped_key: WrappedKey = serde_json::from_slice(&unwrapped)
            .map_err(|e| EnvelopeError::Malformed(format!("wrapped key: {}", e)))?;
        let symmetric = SymmetricKey::from_parts(
            decode_field("key", &wrapped_key.key)?,
            decode_field("iv", &wrapped_key.iv)?,
        )?;

        let message = symmetric.decrypt(&body)?;
        let signature_valid = self
            .remote
            .as_ref()
            .map(|remote| remote.verify(&message, &signature))
            .unwrap_or(false);
        let plaintext = String::from_utf8(message)
            .map_err(|_| EnvelopeError::Malformed("message is not UTF-8".into()))?;

        let opened = Opened {
            envelope: Envelope {
                version,
                secure,
                data: Value::String(plaintext.clone()),
            },
            plaintext,
        };
        Ok(if signature_valid {
            Unsealed::Decrypted(opened)
        } else {
            Unsealed::BadSignature(opened)
        })
    }

    /// Open an envelope and return the message text.
    ///
    /// With `ignore_invalid_signature` a signature that does not match the
    /// remote key is tolerated; otherwise it fails with
    /// [`EnvelopeError::SignatureMismatch`].
    pub fn decrypt(&self, text: &str, ignore_invalid_signature: bool) -> Result<String, EnvelopeError> {
        self.decrypt_raw(text, ignore_invalid_signature)
            .map(|opened| opened.plaintext)
    }

    /// Like [`decrypt`](Self::decrypt) but returns the whole opened envelope.
    pub fn decrypt_raw(&self, text: &str, ignore_invalid_signature: bool) -> Result<Opened, EnvelopeError> {
        match self.classify(text) {
            Unsealed::Decrypted(opened) | Unsealed::Plain(opened) => Ok(opened),
            Unsealed::BadSignature(opened) if ignore_invalid_signature => Ok(opened),
            Unsealed::BadSignature(_) => Err(EnvelopeError::SignatureMismatch),
            Unsealed::NotForMe => Err(EnvelopeError::Unauthorized),
            Unsealed::OwnMessage => Err(EnvelopeError::OwnMessage),
            Unsealed::Malformed(e) => Err(e),
        }
    }

    /// `false` only when the envelope opens but its signature does not match.
    pub fn check_signature(&self, text: &str) -> bool {
        !matches!(
            self.decrypt(text, false),
            Err(EnvelopeError::SignatureMismatch)
        )
    }
}

impl std::fmt::Debug for SecureEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureEnvelope")
            .field("secure", &self.is_secure())
            .field("rotate", &self.rotate)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

fn remember_sealed(history: &mut VecDeque<[u8; 32]>, wrapped: &[u8]) {
    if history.len() == SEALED_HISTORY {
        history.pop_front();
    }
    history.push_back(Sha256::digest(wrapped).into());
}

fn decode_field(name: &str, encoded: &str) -> Result<Vec<u8>, EnvelopeError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| EnvelopeError::Malformed(format!("field '{}': {}", name, e)))
}
