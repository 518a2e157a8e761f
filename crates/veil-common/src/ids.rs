//! Random identifier generation.
//!
//! Identifiers are lowercase hex strings drawn from the thread-local CSPRNG.
//! Reply topics and broker client ids are built from these.

use rand::Rng;

/// Named identifier lengths, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdSize {
    Micro,
    Mini,
    #[default]
    Small,
    Medium,
    Large,
    Critical,
}

impl IdSize {
    pub fn length(self) -> usize {
        match self {
            IdSize::Micro => 8,
            IdSize::Mini => 16,
            IdSize::Small => 32,
            IdSize::Medium => 64,
            IdSize::Large => 128,
            IdSize::Critical => 256,
        }
    }
}

/// Generate `len` random lowercase hex characters.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::thread_rng().fill(bytes.as_mut_slice());
    let mut id = hex::encode(bytes);
    id.truncate(len);
    id
}

/// Generate a random id of the given size, prefixed with `begin`.
pub fn random_id(size: IdSize, begin: &str) -> String {
    let mut id = String::with_capacity(begin.len() + size.length());
    id.push_str(begin);
    id.push_str(&random_hex(size.length()));
    id
}

/// Check that `s` is non-empty lowercase hex.
pub fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_hex_length_and_alphabet() {
        for len in [0, 1, 16, 64] {
            let id = random_hex(len);
            assert_eq!(id.len(), len);
            assert!(len == 0 || is_lower_hex(&id));
        }
    }

    #[test]
    fn test_random_id_prefix() {
        let id = random_id(IdSize::Medium, "tmp/");
        assert!(id.starts_with("tmp/"));
        assert_eq!(id.len(), 4 + 64);
        assert!(is_lower_hex(&id[4..]));
    }

    #[test]
    fn test_ids_differ() {
        assert_ne!(random_hex(32), random_hex(32));
    }

    #[test]
    fn test_id_sizes() {
        assert_eq!(IdSize::Mini.length(), 16);
        assert_eq!(IdSize::default().length(), 32);
    }

    #[test]
    fn test_is_lower_hex() {
        assert!(is_lower_hex("00ff"));
        assert!(!is_lower_hex("00FF"));
        assert!(!is_lower_hex(""));
        assert!(!is_lower_hex("xyz"));
    }
}
