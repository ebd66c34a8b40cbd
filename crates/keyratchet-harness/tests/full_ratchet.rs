//! Full-ratchet decisions and seed renewal, driven through the engine.

use std::time::Duration;

use keyratchet_core::{EngineConfig, storage::Storage};
use keyratchet_harness::{InvariantRegistry, Material, PeerPair, ReceiveWindowFilled};

fn config() -> EngineConfig {
    EngineConfig {
        max_encrypted_per_full_ratchet: 10,
        max_decrypted_since_full_ratchet_message: 4,
        ..EngineConfig::default()
    }
    .with_receive_window(6)
}

#[test]
fn encrypted_budget_boundary() {
    let config = config();
    let pair = PeerPair::new(config.clone());
    let mut material = Material::new(10);
    pair.establish(&material.seed()).unwrap();
    let channel = pair.alice_to_bob();

    for _ in 0..config.max_encrypted_per_full_ratchet - 1 {
        pair.alice.engine.wrap(&channel, &material.message_key()).unwrap();
    }
    assert!(!pair.alice.engine.requires_full_ratchet(&channel).unwrap());
    assert!(pair.alice.starter.starts().is_empty());

    pair.alice.engine.wrap(&channel, &material.message_key()).unwrap();
    assert!(pair.alice.engine.requires_full_ratchet(&channel).unwrap());
    assert_eq!(pair.alice.starter.starts(), vec![channel]);
}

#[test]
fn seed_lineage_expires_with_time() {
    let config = config();
    let pair = PeerPair::new(config.clone());
    let mut material = Material::new(11);
    pair.establish(&material.seed()).unwrap();
    let channel = pair.alice_to_bob();

    pair.env.advance(config.full_ratchet_validity - Duration::from_secs(1));
    assert!(!pair.alice.engine.requires_full_ratchet(&channel).unwrap());

    pair.env.advance(Duration::from_secs(1));
    assert!(pair.alice.engine.requires_full_ratchet(&channel).unwrap());

    // The next state-affecting operation hands it to the starter
    pair.alice.engine.wrap(&channel, &material.message_key()).unwrap();
    assert_eq!(pair.alice.starter.take(), vec![channel]);
}

#[test]
fn sending_the_full_ratchet_message_enters_in_progress() {
    let config = config();
    let pair = PeerPair::new(config.clone());
    let mut material = Material::new(12);
    pair.establish(&material.seed()).unwrap();
    let channel = pair.alice_to_bob();

    for _ in 0..config.max_encrypted_per_full_ratchet {
        pair.alice.engine.wrap(&channel, &material.message_key()).unwrap();
    }
    assert!(pair.alice.engine.requires_full_ratchet(&channel).unwrap());

    pair.alice.engine.notify_full_ratchet_message_sent(&channel).unwrap();
    assert!(!pair.alice.engine.requires_full_ratchet(&channel).unwrap());
    pair.alice.starter.take();

    // T3 wraps since the message: the peer risks losing keys, restart
    for _ in 0..config.max_encrypted_since_full_ratchet_message - 1 {
        pair.alice.engine.wrap(&channel, &material.message_key()).unwrap();
    }
    assert!(pair.alice.starter.starts().is_empty());
    pair.alice.engine.wrap(&channel, &material.message_key()).unwrap();
    assert_eq!(pair.alice.starter.take(), vec![channel]);
}

#[test]
fn unanswered_full_ratchet_message_times_out() {
    let config = config();
    let pair = PeerPair::new(config.clone());
    let mut material = Material::new(13);
    pair.establish(&material.seed()).unwrap();
    let channel = pair.alice_to_bob();

    pair.alice.engine.notify_full_ratchet_message_sent(&channel).unwrap();
    pair.env.advance(config.full_ratchet_message_timeout - Duration::from_secs(1));
    assert!(!pair.alice.engine.requires_full_ratchet(&channel).unwrap());

    pair.env.advance(Duration::from_secs(1));
    assert!(pair.alice.engine.requires_full_ratchet(&channel).unwrap());

    // Re-sending restarts the clock
    pair.alice.engine.notify_full_ratchet_message_sent(&channel).unwrap();
    assert!(!pair.alice.engine.requires_full_ratchet(&channel).unwrap());
}

#[test]
fn unresponsive_peer_is_detected_on_receive() {
    let config = config();
    let pair = PeerPair::new(config.clone());
    let mut material = Material::new(14);
    pair.establish(&material.seed()).unwrap();
    let bob_channel = pair.bob_to_alice();

    // Bob started a renegotiation; Alice keeps talking but never answers it
    pair.bob.engine.notify_full_ratchet_message_sent(&bob_channel).unwrap();

    for received in 1..=config.max_decrypted_since_full_ratchet_message {
        let wrapped =
            pair.alice.engine.wrap(&pair.alice_to_bob(), &material.message_key()).unwrap();
        pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap().unwrap();

        let restarted = !pair.bob.starter.starts().is_empty();
        assert_eq!(restarted, received == config.max_decrypted_since_full_ratchet_message);
    }
}

#[test]
fn completed_full_ratchet_moves_both_sides_to_a_new_generation() {
    let config = config();
    let pair = PeerPair::new(config.clone());
    let mut material = Material::new(15);
    pair.establish(&material.seed()).unwrap();
    let channel = pair.alice_to_bob();

    // An old-generation message still in flight
    let in_flight = material.message_key();
    let old = pair.alice.engine.wrap(&channel, &in_flight).unwrap();

    pair.alice.engine.notify_full_ratchet_message_sent(&channel).unwrap();
    let renewed = material.seed();
    let generation = pair.bob.engine.create_new_provision(&pair.bob_to_alice(), &renewed).unwrap();
    assert_eq!(generation, 1);
    pair.alice.engine.update_send_seed(&channel, &renewed).unwrap();

    let record = pair.alice.engine.storage().load_channel(&channel).unwrap().unwrap().record;
    assert!(!record.full_ratchet_in_progress);
    assert_eq!(record.encrypted_messages_since_last_full_ratchet(), 0);
    assert!(!pair.alice.engine.requires_full_ratchet(&channel).unwrap());

    let fresh = material.message_key();
    let new = pair.alice.engine.wrap(&channel, &fresh).unwrap();
    let opened = pair.bob.engine.unwrap(&new.wrapped_key, &pair.bob.device_uid).unwrap();
    assert_eq!(opened.map(|u| u.message_key), Some(fresh));

    // Old generation keys are now expiring, but still open in-flight
    // messages until collected
    let keys = pair.bob.engine.storage().load_key_materials(&pair.bob_to_alice()).unwrap();
    assert!(
        keys.iter()
            .filter(|(key, _)| key.full_ratcheting_count == 0)
            .all(|(_, material)| !material.record.is_active())
    );
    let opened = pair.bob.engine.unwrap(&old.wrapped_key, &pair.bob.device_uid).unwrap();
    assert_eq!(opened.map(|u| u.message_key), Some(in_flight));
}

#[test]
fn old_generation_keeps_opening_past_the_window() {
    let config = EngineConfig::default().with_receive_window(3);
    let pair = PeerPair::new(config.clone());
    let mut material = Material::new(17);
    pair.establish(&material.seed()).unwrap();
    let alice_channel = pair.alice_to_bob();
    let bob_channel = pair.bob_to_alice();

    // Bob is ready for the new seed before Alice has switched to it
    let renewed = material.seed();
    pair.bob.engine.create_new_provision(&bob_channel, &renewed).unwrap();

    for sent in 0..2 * config.receive_window {
        let key = material.message_key();
        let wrapped = pair.alice.engine.wrap(&alice_channel, &key).unwrap();
        let opened = pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap();
        assert_eq!(opened.map(|u| u.message_key), Some(key), "message {sent} did not open");
    }

    let mut registry = InvariantRegistry::standard();
    registry.add(ReceiveWindowFilled { receive_window: config.receive_window });
    registry.assert_store(pair.bob.engine.storage(), "while generation 0 is still in use");

    // Once Alice switches, the new generation takes over
    pair.alice.engine.update_send_seed(&alice_channel, &renewed).unwrap();
    let key = material.message_key();
    let wrapped = pair.alice.engine.wrap(&alice_channel, &key).unwrap();
    let opened = pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap();
    assert_eq!(opened.map(|u| u.message_key), Some(key));

    let keys = pair.bob.engine.storage().load_key_materials(&bob_channel).unwrap();
    assert!(
        keys.iter()
            .filter(|(key, _)| key.full_ratcheting_count == 0)
            .all(|(_, material)| !material.record.is_active())
    );
}

#[test]
fn failing_starter_does_not_fail_the_wrap() {
    let config = config();
    let pair = PeerPair::new(config.clone());
    let mut material = Material::new(16);
    pair.establish(&material.seed()).unwrap();
    let channel = pair.alice_to_bob();

    pair.alice.starter.set_failing(true);
    for _ in 0..=config.max_encrypted_per_full_ratchet {
        pair.alice.engine.wrap(&channel, &material.message_key()).unwrap();
    }

    // Requested on every wrap at or past the threshold, never retried
    // within one wrap
    assert_eq!(pair.alice.starter.starts().len(), 2);
}
