//! Fuzz target for the channel engine under storage failures
//!
//! Two devices talk over stores wrapped in ChaoticStorage while the fuzzer
//! picks the operations, the delivery order and the failure rate.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%)
//! - Wraps, out-of-order deliveries, replays, clock jumps, collection passes
//!   and full ratchets in any order
//!
//! # Invariants
//!
//! - The engine NEVER panics on storage errors
//! - A header opens at most once, and only to the key that was wrapped
//! - The inner stores pass every structural invariant after each operation

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use keyratchet_core::{
    EngineConfig,
    storage::{ChaoticStorage, MemoryStorage},
};
use keyratchet_harness::{InvariantRegistry, Material, PeerPair, StoreSnapshot};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for keys and seeds
    seed: u64,
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Sequence of operations to perform
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Alice wraps a message for Bob
    AliceSends,
    /// Bob wraps a message for Alice
    BobSends,
    /// Deliver (and forget) a pending message
    Deliver { index: u8 },
    /// Deliver a pending message but keep it for a replay
    Replay { index: u8 },
    /// Move the clock forward by up to a day
    Advance { minutes: u16 },
    /// Run a collection pass on both devices
    Collect,
    /// Complete a full ratchet of Alice's send seed
    FullRatchet,
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let chaotic =
        |salt: u64| ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed ^ salt);
    let config = EngineConfig {
        expiration_grace_period: Duration::from_secs(3600),
        ..EngineConfig::default()
    }
    .with_receive_window(4);
    let pair = PeerPair::with_storages(config, chaotic(1), chaotic(2));
    let mut material = Material::new(scenario.seed);

    let seed = material.seed();
    let _ = pair.alice.engine.create_channel(pair.alice_to_bob(), &seed, 0);
    let _ = pair.bob.engine.create_channel(pair.bob_to_alice(), &seed, 0);

    let registry = InvariantRegistry::standard();
    // (addressed to Bob, message key, header, opened already)
    let mut pending = Vec::new();

    for operation in scenario.operations.into_iter().take(64) {
        match operation {
            ChaosOperation::AliceSends => {
                let key = material.message_key();
                if let Ok(wrapped) = pair.alice.engine.wrap(&pair.alice_to_bob(), &key) {
                    pending.push((true, key, wrapped.wrapped_key, false));
                }
            },
            ChaosOperation::BobSends => {
                let key = material.message_key();
                if let Ok(wrapped) = pair.bob.engine.wrap(&pair.bob_to_alice(), &key) {
                    pending.push((false, key, wrapped.wrapped_key, false));
                }
            },
            ChaosOperation::Deliver { index } | ChaosOperation::Replay { index } if !pending.is_empty() => {
                let position = usize::from(index) % pending.len();
                let replay = matches!(operation, ChaosOperation::Replay { .. });
                let (to_bob, key, header, opened_before) = pending[position].clone();
                let receiver = if to_bob { &pair.bob } else { &pair.alice };

                if let Ok(Some(unwrapped)) = receiver.engine.unwrap(&header, &receiver.device_uid) {
                    assert!(!opened_before, "header opened twice");
                    assert_eq!(unwrapped.message_key, key, "header opened to the wrong key");
                    pending[position].3 = true;
                }
                if !replay {
                    pending.remove(position);
                }
            },
            ChaosOperation::Deliver { .. } | ChaosOperation::Replay { .. } => {},
            ChaosOperation::Advance { minutes } => {
                pair.env.advance(Duration::from_secs(u64::from(minutes % 1440) * 60));
            },
            ChaosOperation::Collect => {
                let _ = pair.alice.engine.finalize_initialization();
                let _ = pair.bob.engine.finalize_initialization();
            },
            ChaosOperation::FullRatchet => {
                let renewed = material.seed();
                if pair.bob.engine.create_new_provision(&pair.bob_to_alice(), &renewed).is_ok() {
                    let _ = pair.alice.engine.update_send_seed(&pair.alice_to_bob(), &renewed);
                }
            },
        }

        for storage in [pair.alice.engine.storage().inner(), pair.bob.engine.storage().inner()] {
            let snapshot = StoreSnapshot::capture(storage).expect("inner store never fails");
            if let Err(violations) = registry.check_all(&snapshot) {
                panic!("invariants violated: {violations:?}");
            }
        }
    }
});
