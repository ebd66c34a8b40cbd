//! Fuzz target for the ratchet primitive
//!
//! # Strategy
//!
//! - Arbitrary seeds, device uids and suite versions
//! - Ratchet chains of up to 64 steps from one diversified seed
//!
//! # Invariants
//!
//! - Unknown suites are rejected with an error, NEVER a panic
//! - Same inputs produce the same chain
//! - No key id repeats within a chain
//! - Distinct device uids diversify to distinct seeds
//! - A key wrapped with a chain key only opens with that key

#![no_main]

use std::collections::HashSet;

use arbitrary::Arbitrary;
use keyratchet_crypto::{
    AuthenticatedEncryptionKey, CryptoSuite, NONCE_SIZE, Seed, Uid, self_ratchet, unwrap_key,
    wrap_key,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
struct RatchetInput {
    seed: [u8; 32],
    device: [u8; 32],
    other_device: [u8; 32],
    suite_version: u32,
    steps: u8,
    message_key: [u8; 32],
    nonce: [u8; NONCE_SIZE],
}

fuzz_target!(|input: RatchetInput| {
    let seed = Seed::from_bytes(input.seed);
    let device = Uid::from_bytes(input.device);

    let Ok(diversified) = seed.diversify(&device, input.suite_version) else {
        assert!(CryptoSuite::from_version(input.suite_version).is_err());
        return;
    };
    let again = seed.diversify(&device, input.suite_version).expect("diversify is deterministic");
    assert_eq!(diversified, again);

    if input.device != input.other_device {
        let other = seed
            .diversify(&Uid::from_bytes(input.other_device), input.suite_version)
            .expect("same suite");
        assert_ne!(diversified, other, "two devices share a seed");
    }

    let mut current = diversified;
    let mut key_ids = HashSet::new();
    let mut keys = Vec::new();
    for _ in 0..(input.steps % 64) {
        let output = self_ratchet(&current, input.suite_version).expect("suite already accepted");
        let replay = self_ratchet(&current, input.suite_version).expect("suite already accepted");
        assert_eq!(output.key_id, replay.key_id);
        assert_eq!(output.key, replay.key);

        assert!(key_ids.insert(output.key_id), "key id repeated within a chain");
        keys.push(output.key);
        current = output.next_seed;
    }

    let suite = CryptoSuite::from_version(input.suite_version).expect("suite already accepted");
    let message_key = AuthenticatedEncryptionKey::new(suite, input.message_key);
    for (index, key) in keys.iter().enumerate() {
        let wrapped = wrap_key(&message_key, key, input.nonce);
        assert_eq!(unwrap_key(&wrapped, key).expect("own key opens"), message_key);
        if let Some(neighbour) = keys.get(index + 1) {
            assert!(unwrap_key(&wrapped, neighbour).is_err(), "next chain key opened the wrap");
        }
    }
});
