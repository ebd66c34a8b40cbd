//! Concurrent callers over one store.
//!
//! The engine holds no locks; these tests check that the store's version
//! checks alone keep send keys unique and receive keys single-use.

use std::{thread, time::Duration};

use keyratchet_core::{
    EngineConfig, Environment,
    storage::{MemoryStorage, Storage},
};
use keyratchet_crypto::parse_header;
use keyratchet_harness::{
    HookedStorage, InvariantRegistry, Material, PeerPair, ReadPoint, ReceiveWindowFilled,
    StoreSnapshot,
};

const THREADS: usize = 8;

#[test]
fn concurrent_unwraps_of_one_header_open_it_once() {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(4));
    let mut material = Material::new(20);
    pair.establish(&material.seed()).unwrap();

    let wrapped = pair.alice.engine.wrap(&pair.alice_to_bob(), &material.message_key()).unwrap();

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let engine = pair.bob.engine.clone();
                let header = wrapped.wrapped_key.clone();
                let device = pair.bob.device_uid;
                scope.spawn(move || engine.unwrap(&header, &device))
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let opened = results.iter().filter(|result| matches!(result, Ok(Some(_)))).count();
    let errors: Vec<_> = results.iter().filter_map(|result| result.as_ref().err()).collect();
    assert_eq!(opened, 1, "exactly one unwrap must win");
    assert!(errors.is_empty(), "losers must see the key gone, got {errors:?}");

    // Confirmation is posted once
    assert_eq!(pair.bob.events.events().len(), 1);

    let snapshot = StoreSnapshot::capture(pair.bob.engine.storage()).unwrap();
    InvariantRegistry::standard().assert_all(&snapshot, "after concurrent unwraps");
}

#[test]
fn concurrent_wraps_never_reuse_a_send_key() {
    let pair = PeerPair::new(EngineConfig::default().with_receive_window(THREADS as u32));
    let mut material = Material::new(21);
    pair.establish(&material.seed()).unwrap();
    let channel = pair.alice_to_bob();

    let keys: Vec<_> = (0..THREADS).map(|_| material.message_key()).collect();
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = keys
            .iter()
            .map(|key| {
                let engine = pair.alice.engine.clone();
                let channel = channel.clone();
                scope.spawn(move || (key.clone(), engine.wrap(&channel, key)))
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let mut wrapped = Vec::new();
    for (key, result) in results {
        match result {
            Ok(header) => wrapped.push((key, header)),
            Err(e) => assert!(e.is_conflict(), "unexpected error {e}"),
        }
    }
    assert!(!wrapped.is_empty());

    // Every successful wrap advanced the counter by exactly one
    let record = pair.alice.engine.storage().load_channel(&channel).unwrap().unwrap().record;
    assert_eq!(record.number_of_encrypted_messages, wrapped.len() as u64);

    let mut key_ids: Vec<_> =
        wrapped.iter().map(|(_, header)| parse_header(&header.wrapped_key).unwrap().0).collect();
    key_ids.sort_by_key(|id| *id.as_bytes());
    key_ids.dedup();
    assert_eq!(key_ids.len(), wrapped.len(), "two wraps used the same send key");

    for (key, header) in wrapped {
        let opened = pair.bob.engine.unwrap(&header.wrapped_key, &pair.bob.device_uid).unwrap();
        assert_eq!(opened.map(|u| u.message_key), Some(key));
    }
}

#[test]
fn collection_races_with_consumption() {
    let config = EngineConfig::default().with_receive_window(4);
    let grace = config.expiration_grace_period;
    let pair = PeerPair::new(config);
    let mut material = Material::new(22);
    pair.establish(&material.seed()).unwrap();
    let channel = pair.alice_to_bob();

    let headers: Vec<_> = (0..4)
        .map(|_| pair.alice.engine.wrap(&channel, &material.message_key()).unwrap())
        .collect();

    // The last message expires the first three
    pair.bob.engine.unwrap(&headers[3].wrapped_key, &pair.bob.device_uid).unwrap().unwrap();
    pair.env.advance(grace + Duration::from_secs(1));

    let (gc, unwraps) = thread::scope(|scope| {
        let collector = {
            let engine = pair.bob.engine.clone();
            let env = pair.env.clone();
            scope.spawn(move || engine.run_garbage_collection(env.now()))
        };
        let consumer = {
            let engine = pair.bob.engine.clone();
            let device = pair.bob.device_uid;
            let late: Vec<_> = headers[..3].iter().map(|h| h.wrapped_key.clone()).collect();
            scope.spawn(move || {
                late.iter().map(|header| engine.unwrap(header, &device)).collect::<Vec<_>>()
            })
        };
        (collector.join().unwrap(), consumer.join().unwrap())
    });

    // Either side may win each key, but never both and never with an error
    // other than a conflict the caller can retry
    let report = gc.unwrap();
    let opened = unwraps
        .iter()
        .filter(|result| match result {
            Ok(opened) => opened.is_some(),
            Err(e) => {
                assert!(e.is_conflict(), "unexpected error {e}");
                false
            },
        })
        .count();
    assert!(report.key_materials_deleted + opened <= 3);

    let snapshot = StoreSnapshot::capture(pair.bob.engine.storage()).unwrap();
    InvariantRegistry::standard().assert_all(&snapshot, "after collection race");
}

fn hooked_pair(config: EngineConfig) -> PeerPair<HookedStorage<MemoryStorage>> {
    PeerPair::with_storages(
        config,
        HookedStorage::new(MemoryStorage::new()),
        HookedStorage::new(MemoryStorage::new()),
    )
}

fn generations<S: Storage>(storage: &S, channel: &keyratchet_core::ChannelId) -> Vec<u32> {
    storage.load_provisions(channel).unwrap().iter().map(|(key, _)| key.full_ratcheting_count).collect()
}

#[test]
fn collection_during_a_full_ratchet_keeps_the_new_generation() {
    let config = EngineConfig::default().with_receive_window(2);
    let grace = config.expiration_grace_period;
    let pair = hooked_pair(config);
    let mut material = Material::new(23);
    pair.establish(&material.seed()).unwrap();
    let alice_channel = pair.alice_to_bob();
    let bob_channel = pair.bob_to_alice();

    // A first full ratchet completes and leaves generation 0 expiring
    let renewed = material.seed();
    pair.bob.engine.create_new_provision(&bob_channel, &renewed).unwrap();
    pair.alice.engine.update_send_seed(&alice_channel, &renewed).unwrap();
    let wrapped = pair.alice.engine.wrap(&alice_channel, &material.message_key()).unwrap();
    pair.bob.engine.unwrap(&wrapped.wrapped_key, &pair.bob.device_uid).unwrap().unwrap();
    pair.env.advance(grace + Duration::from_secs(1));

    // A second one commits while the collector is between its reads
    let engine = pair.bob.engine.clone();
    let channel = bob_channel.clone();
    let next = material.seed();
    pair.bob.engine.storage().arm(ReadPoint::LoadKeyMaterials, move || {
        assert_eq!(engine.create_new_provision(&channel, &next).unwrap(), 2);
    });
    let report = pair.bob.engine.run_garbage_collection(pair.env.now()).unwrap();
    assert!(!pair.bob.engine.storage().is_armed());

    assert_eq!(report.key_materials_deleted, 2);
    assert_eq!(report.provisions_deleted, 0);
    assert_eq!(report.conflicts_skipped, 1);
    assert_eq!(generations(pair.bob.engine.storage(), &bob_channel), vec![0, 1, 2]);

    let mut registry = InvariantRegistry::standard();
    registry.add(ReceiveWindowFilled { receive_window: 2 });
    registry.assert_store(pair.bob.engine.storage(), "after the interrupted pass");

    // The next pass sees the new generation and drops only the empty one
    let report = pair.bob.engine.run_garbage_collection(pair.env.now()).unwrap();
    assert_eq!(report.provisions_deleted, 1);
    assert_eq!(generations(pair.bob.engine.storage(), &bob_channel), vec![1, 2]);
    registry.assert_store(pair.bob.engine.storage(), "after the retried pass");
}

#[test]
fn consumption_racing_a_full_ratchet_message_counts_the_decryption() {
    let pair = hooked_pair(EngineConfig::default().with_receive_window(4));
    let mut material = Material::new(24);
    pair.establish(&material.seed()).unwrap();
    let alice_channel = pair.alice_to_bob();
    let bob_channel = pair.bob_to_alice();

    // Confirm Bob's channel so the next unwrap leaves its record unchanged
    let first = pair.alice.engine.wrap(&alice_channel, &material.message_key()).unwrap();
    pair.bob.engine.unwrap(&first.wrapped_key, &pair.bob.device_uid).unwrap().unwrap();

    let key = material.message_key();
    let second = pair.alice.engine.wrap(&alice_channel, &key).unwrap();

    // Bob sends a full-ratchet message while the unwrap holds a stale record
    let engine = pair.bob.engine.clone();
    let channel = bob_channel.clone();
    pair.bob.engine.storage().arm(ReadPoint::LoadKeyMaterials, move || {
        engine.notify_full_ratchet_message_sent(&channel).unwrap();
    });
    let raced = pair.bob.engine.unwrap(&second.wrapped_key, &pair.bob.device_uid);
    assert!(raced.is_err_and(|e| e.is_conflict()));

    // The key is still there; a retry opens it against the fresh record
    let opened = pair.bob.engine.unwrap(&second.wrapped_key, &pair.bob.device_uid).unwrap();
    assert_eq!(opened.map(|u| u.message_key), Some(key));

    let record = pair.bob.engine.storage().load_channel(&bob_channel).unwrap().unwrap().record;
    assert!(record.full_ratchet_in_progress);
    assert_eq!(record.number_of_decrypted_messages_since_last_full_ratchet_sent_message, 1);
}
