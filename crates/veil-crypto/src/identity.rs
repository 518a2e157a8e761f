//! RSA identity keys.
//!
//! Every peer owns one RSA keypair. Keys travel as PKCS#1 PEM text: the
//! public half is what peers exchange during the key handshake, the private
//! half never leaves the peer.
//!
//! - Signatures: PKCS#1 v1.5 over SHA-512
//! - Key wrapping: OAEP with SHA-256
//!
//! # Example
//!
//! ```no_run
//! use veil_crypto::identity::KeyPair;
//!
//! let keypair = KeyPair::generate(4096).unwrap();
//! let signature = keypair.sign(b"hello").unwrap();
//! assert!(keypair.public_key().verify(b"hello", &signature));
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Recommended modulus size.
pub const DEFAULT_KEY_BITS: usize = 4096;

/// Smallest modulus accepted for new keys.
pub const MIN_KEY_BITS: usize = 2048;

/// First line of a PKCS#1 PEM public key.
pub const PUBLIC_KEY_MARKER: &str = "-----BEGIN RSA PUBLIC KEY-----";

/// An RSA public key with its verifier.
#[derive(Clone)]
pub struct PublicKey {
    key: RsaPublicKey,
    verifying: VerifyingKey<Sha512>,
}

impl PublicKey {
    fn from_rsa(key: RsaPublicKey) -> Self {
        let verifying = VerifyingKey::<Sha512>::new(key.clone());
        Self { key, verifying }
    }

    /// Structural check: does `pem` start with the PKCS#1 public key marker?
    ///
    /// This decides whether a peer can run in secure mode; it does not
    /// establish trust in the key.
    pub fn looks_like_pem(pem: &str) -> bool {
        pem.trim_start().starts_with(PUBLIC_KEY_MARKER)
    }

    /// Parse a PKCS#1 (or SPKI) PEM public key.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_pkcs1_pem(pem.trim())
            .or_else(|_| RsaPublicKey::from_public_key_pem(pem.trim()))
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self::from_rsa(key))
    }

    /// Encode as PKCS#1 PEM.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.key.size() * 8
    }

    /// Short, stable identifier: base64url SHA-256 of the PKCS#1 DER encoding.
    pub fn fingerprint(&self) -> String {
        match self.key.to_pkcs1_der() {
            Ok(der) => URL_SAFE_NO_PAD.encode(Sha256::digest(der.as_bytes())),
            Err(_) => String::new(),
        }
    }

    /// Verify a signature. Never fails: any fault resolves to `false`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let sig = match Signature::try_from(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.verifying.verify(message, &sig).is_ok()
    }

    /// Encrypt a short message (such as a symmetric key) for this key's owner.
    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), message)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    /// Load a public key from a PEM file.
    pub fn load(public_path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let pem = fs::read_to_string(public_path)?;
        Self::from_pem(&pem)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// RSA identity keypair.
///
/// The private key is zeroized on drop by the `rsa` crate.
pub struct KeyPair {
    private: RsaPrivateKey,
    signing: SigningKey<Sha512>,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyTooSmall {
                bits,
                min: MIN_KEY_BITS,
            });
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_rsa(private))
    }

    fn from_rsa(private: RsaPrivateKey) -> Self {
        let public = PublicKey::from_rsa(private.to_public_key());
        let signing = SigningKey::<Sha512>::new(private.clone());
        Self {
            private,
            signing,
            public,
        }
    }

    /// Parse a PKCS#1 (or PKCS#8) PEM private key.
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs1_pem(pem.trim())
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem.trim()))
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_rsa(private))
    }

    /// Encode the private key as PKCS#1 PEM.
    ///
    /// # Security
    /// Handle with care! This text recreates the identity.
    pub fn private_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        self.private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))
    }

    /// Encode the public key as PKCS#1 PEM.
    pub fn public_pem(&self) -> Result<String, CryptoError> {
        self.public.to_pem()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature = self
            .signing
            .try_sign(message)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(signature.to_vec())
    }

    /// Decrypt a message that was encrypted for this identity.
    ///
    /// Fails with [`CryptoError::Decryption`] when the ciphertext was produced
    /// for a different key, which is how a peer tells that broadcast traffic
    /// was not addressed to it.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Save keypair to PEM files.
    ///
    /// Private key is saved with restricted permissions (0600 on Unix).
    pub fn save(
        &self,
        private_path: impl AsRef<Path>,
        public_path: impl AsRef<Path>,
    ) -> Result<(), CryptoError> {
        let private_path = private_path.as_ref();
        let private_pem = self.private_pem()?;

        fs::write(private_path, private_pem.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(private_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(private_path, perms)?;
        }

        fs::write(public_path, self.public_pem()?)?;

        Ok(())
    }

    /// Load keypair from a private key PEM file.
    pub fn load(private_path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let pem = Zeroizing::new(fs::read_to_string(private_path)?);
        Self::from_private_pem(&pem)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Generate a keypair and return it as `(private_pem, public_pem)`.
pub fn generate_keypair(bits: usize) -> Result<(Zeroizing<String>, String), CryptoError> {
    let keypair = KeyPair::generate(bits)?;
    Ok((keypair.private_pem()?, keypair.public_pem()?))
}

/// Sign `message` with a PEM private key.
pub fn sign(message: &[u8], private_pem: &str) -> Result<Vec<u8>, CryptoError> {
    KeyPair::from_private_pem(private_pem)?.sign(message)
}

/// Verify `signature` with a PEM public key. Malformed keys verify nothing.
pub fn verify(message: &[u8], signature: &[u8], public_pem: &str) -> bool {
    match PublicKey::from_pem(public_pem) {
        Ok(key) => key.verify(message, signature),
        Err(_) => false,
    }
}

/// Encrypt `message` for the owner of a PEM public key.
pub fn asymmetric_encrypt(message: &[u8], public_pem: &str) -> Result<Vec<u8>, CryptoError> {
    PublicKey::from_pem(public_pem)?.encrypt(message)
}

/// Decrypt `ciphertext` with a PEM private key.
pub fn asymmetric_decrypt(ciphertext: &[u8], private_pem: &str) -> Result<Vec<u8>, CryptoError> {
    KeyPair::from_private_pem(private_pem)?.decrypt(ciphertext)
}
