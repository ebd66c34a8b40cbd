//! Fuzz target for wrapped key headers
//!
//! # Strategy
//!
//! - Random bytes: arbitrary headers of any length
//! - Forged key id: a real key id of the receiving store in front of random
//!   ciphertext
//! - Bit flips: a genuine header with one byte altered
//!
//! # Invariants
//!
//! - `parse_header` and `unwrap` NEVER panic
//! - Malformed or foreign headers are `Ok(None)`, never `Err`
//! - Only the untouched genuine header opens, to the key that was wrapped
//! - A failed attempt consumes nothing

#![no_main]

use arbitrary::Arbitrary;
use keyratchet_core::{EngineConfig, storage::Storage};
use keyratchet_crypto::{CryptoKeyId, compose_header, parse_header};
use keyratchet_harness::{Material, PeerPair};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum HeaderAttack {
    RandomBytes { bytes: Vec<u8> },
    ForgedKeyId { ciphertext: Vec<u8> },
    BitFlip { position: u16, mask: u8 },
}

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    seed: u64,
    attack: HeaderAttack,
}

fuzz_target!(|scenario: Scenario| {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(2));
    let mut material = Material::new(scenario.seed);
    if pair.establish(&material.seed()).is_err() {
        return;
    }

    let key = material.message_key();
    let Ok(genuine) = pair.alice.engine.wrap(&pair.alice_to_bob(), &key) else {
        return;
    };
    let keys_before = pair.bob.engine.storage().key_material_count();

    let (header, untouched) = match scenario.attack {
        HeaderAttack::RandomBytes { bytes } => {
            let untouched = bytes == genuine.wrapped_key;
            (bytes, untouched)
        },
        HeaderAttack::ForgedKeyId { ciphertext } => {
            let Ok((key_id, _)) = parse_header(&genuine.wrapped_key) else {
                return;
            };
            let header = compose_header(&key_id, &ciphertext);
            let untouched = header == genuine.wrapped_key;
            (header, untouched)
        },
        HeaderAttack::BitFlip { position, mask } => {
            let mut header = genuine.wrapped_key.clone();
            let index = usize::from(position) % header.len();
            header[index] ^= mask;
            (header, mask == 0)
        },
    };

    // Parsing alone must hold up
    if header.len() >= CryptoKeyId::LENGTH {
        assert!(parse_header(&header).is_ok(), "long enough header rejected");
    }

    let opened = pair
        .bob
        .engine
        .unwrap(&header, &pair.bob.device_uid)
        .expect("unwrap returned an error for a bad header");

    match opened {
        Some(unwrapped) => {
            assert!(untouched, "altered header opened");
            assert_eq!(unwrapped.message_key, key, "header opened to the wrong key");
        },
        None => {
            assert!(!untouched, "genuine header did not open");
            assert_eq!(
                pair.bob.engine.storage().key_material_count(),
                keys_before,
                "failed unwrap consumed a key"
            );
        },
    }
});
