use std::sync::Arc;

use rand::{thread_rng, Rng};
use serde_json::json;
use veil_crypto::{KeyPair, SecureEnvelope, Unsealed, MIN_KEY_BITS};

fn envelopes() -> (SecureEnvelope, SecureEnvelope) {
    let alice = Arc::new(KeyPair::generate(MIN_KEY_BITS).unwrap());
    let bob = Arc::new(KeyPair::generate(MIN_KEY_BITS).unwrap());
    let sender = SecureEnvelope::new(alice.clone(), Some(&bob.public_pem().unwrap()), true).unwrap();
    let receiver = SecureEnvelope::new(bob, Some(&alice.public_pem().unwrap()), true).unwrap();
    (sender, receiver)
}

#[test]
fn fuzz_classify_random_bytes_never_panics() {
    let (_, receiver) = envelopes();
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..512);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let text = String::from_utf8_lossy(&data);
        let _ = receiver.classify(&text);
        let _ = receiver.decrypt(&text, false);
    }
}

#[test]
fn random_mutation_of_valid_envelope_is_handled() {
    let (mut sender, receiver) = envelopes();
    let valid = sender.encrypt(&json!({"t": "ping", "p": {}, "c": "a"})).unwrap();
    assert!(matches!(receiver.classify(&valid), Unsealed::Decrypted(_)));

    let original = receiver.decrypt(&valid, false).unwrap();

    let mut rng = thread_rng();
    let bytes = valid.into_bytes();
    for _ in 0..200 {
        let mut mutated = bytes.clone();
        let flip_count = rng.gen_range(1..4);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] = rng.gen_range(b' '..=b'~');
        }
        let text = String::from_utf8_lossy(&mutated);
        // Whatever survives the signature check is the original message
        if let Unsealed::Decrypted(opened) = receiver.classify(&text) {
            assert_eq!(opened.plaintext, original);
        }
    }
}
