//! AES-CBC body encryption.
//!
//! Message bodies are encrypted with AES in CBC mode and PKCS#7 padding. The
//! key is 128, 192 or 256 bits; the initialization vector is one AES block.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Default symmetric key size in bits.
pub const DEFAULT_KEY_BITS: usize = 256;

/// Initialization vector size in bits (one AES block).
pub const IV_BITS: usize = 128;

/// Symmetric key and initialization vector. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl SymmetricKey {
    /// Build from existing material, validating both lengths.
    pub fn from_parts(key: Vec<u8>, iv: Vec<u8>) -> Result<Self, CryptoError> {
        check_key(&key)?;
        check_iv(&iv)?;
        Ok(Self { key, iv })
    }

    /// Fresh random 256-bit key and IV.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = vec![0u8; DEFAULT_KEY_BITS / 8];
        let mut iv = vec![0u8; IV_BITS / 8];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        symmetric_encrypt(plaintext, &self.key, &self.iv)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        symmetric_decrypt(ciphertext, &self.key, &self.iv)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey({} bits)", self.key.len() * 8)
    }
}

/// Generate random symmetric material of the requested sizes.
///
/// `key_bits` must be 128, 192 or 256 and `iv_bits` must be 128.
pub fn generate_symmetric_material(
    key_bits: usize,
    iv_bits: usize,
) -> Result<SymmetricKey, CryptoError> {
    if !matches!(key_bits, 128 | 192 | 256) {
        return Err(CryptoError::InvalidKeyLength(key_bits));
    }
    if iv_bits != IV_BITS {
        return Err(CryptoError::InvalidIvLength(iv_bits));
    }
    let mut rng = rand::thread_rng();
    let mut key = vec![0u8; key_bits / 8];
    let mut iv = vec![0u8; iv_bits / 8];
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut iv);
    Ok(SymmetricKey { key, iv })
}

/// Encrypt with AES-CBC, PKCS#7 padded. The cipher width follows the key length.
pub fn symmetric_encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    check_iv(iv)?;
    let invalid = |_| CryptoError::InvalidKeyLength(key.len() * 8);
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        _ => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    };
    Ok(ciphertext)
}

/// Decrypt AES-CBC ciphertext and strip PKCS#7 padding.
///
/// Fails with [`CryptoError::Padding`] when the ciphertext is not block
/// aligned or the padding is malformed.
pub fn symmetric_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    check_iv(iv)?;
    let invalid = |_| CryptoError::InvalidKeyLength(key.len() * 8);
    let plaintext = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        _ => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
    };
    plaintext.map_err(|_| CryptoError::Padding)
}

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        n => Err(CryptoError::InvalidKeyLength(n * 8)),
    }
}

fn check_iv(iv: &[u8]) -> Result<(), CryptoError> {
    if iv.len() * 8 == IV_BITS {
        Ok(())
    } else {
        Err(CryptoError::InvalidIvLength(iv.len() * 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_key_sizes() {
        for bits in [128, 192, 256] {
            let material = generate_symmetric_material(bits, 128).unwrap();
            assert_eq!(material.key().len() * 8, bits);

            let ciphertext = material.encrypt(b"attack at dawn").unwrap();
            assert_eq!(ciphertext.len() % 16, 0);
            assert_eq!(material.decrypt(&ciphertext).unwrap(), b"attack at dawn");
        }
    }

    #[test]
    fn test_empty_plaintext_gets_full_padding_block() {
        let material = SymmetricKey::generate();
        let ciphertext = material.encrypt(b"").unwrap();
        assert_eq!(ciphertext.len(), 16);
        assert!(material.decrypt(&ciphertext).unwrap().is_empty());
    }

    #[test]
    fn test_material_is_random() {
        let a = SymmetricKey::generate();
        let b = SymmetricKey::generate();
        assert_ne!(a.key(), b.key());
        assert_ne!(a.iv(), b.iv());
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(matches!(
            generate_symmetric_material(100, 128),
            Err(CryptoError::InvalidKeyLength(100))
        ));
        assert!(matches!(
            generate_symmetric_material(256, 96),
            Err(CryptoError::InvalidIvLength(96))
        ));
        assert!(matches!(
            symmetric_encrypt(b"x", &[0u8; 10], &[0u8; 16]),
            Err(CryptoError::InvalidKeyLength(80))
        ));
        assert!(SymmetricKey::from_parts(vec![0u8; 32], vec![0u8; 8]).is_err());
    }

    #[test]
    fn test_malformed_ciphertext_is_padding_error() {
        let material = SymmetricKey::generate();

        // Not block aligned
        let result = material.decrypt(&[1, 2, 3]);
        assert!(matches!(result, Err(CryptoError::Padding)));

        // Block aligned but decrypted with the wrong key: padding is garbage
        // with overwhelming probability, or the plaintext differs.
        let ciphertext = material.encrypt(b"sixteen byte msg").unwrap();
        let other = SymmetricKey::generate();
        match other.decrypt(&ciphertext) {
            Err(CryptoError::Padding) => {}
            Ok(plaintext) => assert_ne!(plaintext, b"sixteen byte msg"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
