//! Property-based tests for the ratchet primitives
//!
//! 1. **Determinism**: same seed and suite always produce the same step
//! 2. **Non-repetition**: a chain of steps never repeats a key
//! 3. **Round-trip**: unwrap(wrap(k)) == k for every message key
//! 4. **Direction separation**: diversified seeds of two devices never match

use keyratchet_crypto::{
    AuthenticatedEncryptionKey, CryptoKeyId, CryptoSuite, KEY_SIZE, NONCE_SIZE, SEED_SIZE, Seed,
    UID_SIZE, Uid, compose_header, parse_header, self_ratchet, unwrap_key, wrap_key,
};
use proptest::prelude::*;

fn seed_strategy() -> impl Strategy<Value = Seed> {
    prop::array::uniform32(any::<u8>()).prop_map(Seed::from_bytes)
}

fn uid_strategy() -> impl Strategy<Value = Uid> {
    prop::array::uniform32(any::<u8>()).prop_map(Uid::from_bytes)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_self_ratchet_deterministic(seed in seed_strategy()) {
        let a = self_ratchet(&seed, 0).unwrap();
        let b = self_ratchet(&seed, 0).unwrap();

        prop_assert_eq!(a.next_seed, b.next_seed);
        prop_assert_eq!(a.key_id, b.key_id);
        prop_assert_eq!(a.key, b.key);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_chain_never_repeats(seed in seed_strategy(), steps in 2usize..40) {
        let mut current = seed;
        let mut seen: Vec<(CryptoKeyId, [u8; KEY_SIZE])> = Vec::with_capacity(steps);

        for _ in 0..steps {
            let out = self_ratchet(&current, 0).unwrap();
            let pair = (out.key_id, *out.key.key());
            prop_assert!(!seen.contains(&pair), "ratchet step repeated a key");
            seen.push(pair);
            current = out.next_seed;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_wrap_unwrap_roundtrip(
        seed in seed_strategy(),
        message in prop::array::uniform32(any::<u8>()),
        nonce in prop::collection::vec(any::<u8>(), NONCE_SIZE..=NONCE_SIZE),
    ) {
        let step = self_ratchet(&seed, 0).unwrap();
        let message_key = AuthenticatedEncryptionKey::new(CryptoSuite::V0, message);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(&nonce);

        let header = compose_header(&step.key_id, &wrap_key(&message_key, &step.key, nonce_bytes));
        let (key_id, ciphertext) = parse_header(&header).unwrap();

        prop_assert_eq!(key_id, step.key_id);
        prop_assert_eq!(unwrap_key(ciphertext, &step.key).unwrap(), message_key);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_directions_are_separated(
        raw in prop::array::uniform32(any::<u8>()),
        alice in uid_strategy(),
        bob in uid_strategy(),
    ) {
        prop_assume!(alice != bob);
        let seed = Seed::from_bytes(raw);

        let a = seed.diversify(&alice, 0).unwrap();
        let b = seed.diversify(&bob, 0).unwrap();
        prop_assert_ne!(a, b);
    }

    #[test]
    fn prop_short_headers_rejected(len in 0usize..CryptoKeyId::LENGTH) {
        let header = vec![0u8; len];
        prop_assert!(parse_header(&header).is_err());
    }
}

#[test]
fn sizes_are_stable() {
    assert_eq!(SEED_SIZE, 32);
    assert_eq!(UID_SIZE, 32);
    assert_eq!(CryptoKeyId::LENGTH, 8);
}
