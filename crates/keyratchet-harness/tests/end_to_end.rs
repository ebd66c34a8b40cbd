//! End-to-end wrap and unwrap between two devices.

use keyratchet_core::{ChannelEvent, EngineConfig, storage::Storage};
use keyratchet_crypto::{CryptoKeyId, Seed, Uid};
use keyratchet_harness::{InvariantRegistry, Material, PeerPair, ReceiveWindowFilled};

fn check_invariants<S: Storage>(pair: &PeerPair<S>, receive_window: u32, context: &str) {
    let mut registry = InvariantRegistry::standard();
    registry.add(ReceiveWindowFilled { receive_window });

    for storage in [pair.alice.engine.storage(), pair.bob.engine.storage()] {
        registry.assert_store(storage, context);
    }
}

#[test]
fn first_message_consumes_step_zero_and_confirms() {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(1));
    let mut material = Material::new(1);
    pair.establish(&material.seed()).unwrap();

    let k1 = material.message_key();
    let wrapped = pair.alice.engine.wrap(&pair.alice_to_bob(), &k1).unwrap();
    assert_eq!(wrapped.to_identity, pair.bob.identity);
    assert_eq!(wrapped.remote_device_uid, pair.bob.device_uid);

    let unwrapped =
        pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap().unwrap();
    assert_eq!(unwrapped.message_key, k1);
    assert_eq!(unwrapped.channel, pair.bob_to_alice());

    // Generation 0 now holds only the replacement minted at step 1
    let keys = pair.bob.engine.storage().load_key_materials(&pair.bob_to_alice()).unwrap();
    let positions: Vec<_> =
        keys.iter().map(|(key, _)| (key.full_ratcheting_count, key.self_ratcheting_count)).collect();
    assert_eq!(positions, vec![(0, 1)]);

    assert!(pair.bob.engine.confirmed_channel_exists(&pair.bob_to_alice()).unwrap());
    assert_eq!(pair.bob.events.events(), vec![ChannelEvent::NewConfirmedChannel(pair.bob_to_alice())]);

    // Alice's side learns nothing from sending
    assert!(!pair.alice.engine.confirmed_channel_exists(&pair.alice_to_bob()).unwrap());
    assert!(pair.alice.events.events().is_empty());

    check_invariants(&pair, 1, "after first message");
}

#[test]
fn header_opens_at_most_once() {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(3));
    let mut material = Material::new(2);
    pair.establish(&material.seed()).unwrap();

    let wrapped = pair.alice.engine.wrap(&pair.alice_to_bob(), &material.message_key()).unwrap();

    assert!(pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap().is_some());
    assert!(pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap().is_none());
}

#[test]
fn conversation_in_both_directions() {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(4));
    let mut material = Material::new(3);
    pair.establish(&material.seed()).unwrap();

    for round in 0..10 {
        let to_bob = material.message_key();
        let wrapped = pair.alice.engine.wrap(&pair.alice_to_bob(), &to_bob).unwrap();
        let got = pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap();
        assert_eq!(got.map(|u| u.message_key), Some(to_bob), "round {round} to bob");

        let to_alice = material.message_key();
        let wrapped = pair.bob.engine.wrap(&pair.bob_to_alice(), &to_alice).unwrap();
        let got = pair.alice.engine.unwrap(&wrapped.wrapped_key, &pair.alice.device_uid).unwrap();
        assert_eq!(got.map(|u| u.message_key), Some(to_alice), "round {round} to alice");

        check_invariants(&pair, 4, &format!("after round {round}"));
    }

    // Confirmation is announced once per channel, not per message
    assert_eq!(pair.bob.events.events().len(), 1);
    assert_eq!(pair.alice.events.events().len(), 1);
}

#[test]
fn own_direction_does_not_open() {
    // Alice's send stream is diversified with her uid, her receive stream
    // with Bob's, so her own header never matches her own keys
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(4));
    let mut material = Material::new(4);
    pair.establish(&material.seed()).unwrap();

    let wrapped = pair.alice.engine.wrap(&pair.alice_to_bob(), &material.message_key()).unwrap();
    assert!(pair.alice.engine.unwrap(&wrapped.wrapped_key, &pair.alice.device_uid).unwrap().is_none());
}

#[test]
fn malformed_and_foreign_headers_are_not_errors() {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(2));
    let mut material = Material::new(5);
    pair.establish(&material.seed()).unwrap();

    let short = vec![0u8; CryptoKeyId::LENGTH - 1];
    assert!(pair.bob.engine.unwrap(&short, &pair.bob.device_uid).unwrap().is_none());

    let foreign = vec![0xEE; 80];
    assert!(pair.bob.engine.unwrap(&foreign, &pair.bob.device_uid).unwrap().is_none());

    // Right key id, tampered ciphertext
    let wrapped = pair.alice.engine.wrap(&pair.alice_to_bob(), &material.message_key()).unwrap();
    let mut tampered = wrapped.wrapped_key.clone();
    if let Some(last) = tampered.last_mut() {
        *last ^= 0x01;
    }
    assert!(pair.bob.engine.unwrap(&tampered, &pair.bob.device_uid).unwrap().is_none());

    // The untampered header still opens: failed attempts consumed nothing
    assert!(pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap().is_some());
}

#[test]
fn unwrap_only_searches_the_given_device() {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(2));
    let mut material = Material::new(6);
    pair.establish(&material.seed()).unwrap();

    let wrapped = pair.alice.engine.wrap(&pair.alice_to_bob(), &material.message_key()).unwrap();
    let elsewhere = Uid::from_bytes([0x77; 32]);
    assert!(pair.bob.engine.unwrap(&wrapped.wrapped_key, &elsewhere).unwrap().is_none());
    assert!(
        pair.bob
            .engine
            .unwrap_for_owned_identity(&wrapped.wrapped_key, &pair.bob.identity)
            .unwrap()
            .is_some()
    );
}

#[test]
fn different_seeds_do_not_interoperate() {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(2));
    pair.alice
        .engine
        .create_channel(pair.alice_to_bob(), &Seed::from_bytes([1; 32]), 0)
        .unwrap();
    pair.bob.engine.create_channel(pair.bob_to_alice(), &Seed::from_bytes([2; 32]), 0).unwrap();

    let mut material = Material::new(7);
    let wrapped = pair.alice.engine.wrap(&pair.alice_to_bob(), &material.message_key()).unwrap();
    assert!(pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap().is_none());
}
