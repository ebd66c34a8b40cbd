//! Two-device scenarios.
//!
//! A [`PeerPair`] is two devices, Alice's and Bob's, each with its own
//! engine, store, directory and recorders, sharing one simulated clock.
//! [`PeerPair::establish`] plays the part of the key agreement: both sides
//! create their channel from the same seed.

use std::sync::Arc;

use keyratchet_core::{
    ChannelEngine, ChannelId, Collaborators, CryptoIdentity, EngineConfig, EngineError, SimEnv,
    storage::{MemoryStorage, Storage},
};
use keyratchet_crypto::{AuthenticatedEncryptionKey, CryptoSuite, Seed, Uid};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::{RecordingEvents, RecordingStarter, StaticDirectory};

/// Start of simulated time, an arbitrary date well after the epoch.
pub const SCENARIO_START_SECS: u64 = 1_700_000_000;

/// One device and its engine.
pub struct Peer<S: Storage> {
    /// Owned identity of the device
    pub identity: CryptoIdentity,
    /// Device uid
    pub device_uid: Uid,
    /// Engine over the device's store
    pub engine: ChannelEngine<SimEnv, S>,
    /// Directory the engine consults
    pub directory: StaticDirectory,
    /// Events the engine posted
    pub events: Arc<RecordingEvents>,
    /// Full ratchets the engine requested
    pub starter: Arc<RecordingStarter>,
}

impl<S: Storage> Peer<S> {
    /// Build a device whose engine uses `storage`.
    pub fn new(
        identity: CryptoIdentity,
        device_uid: Uid,
        env: SimEnv,
        storage: S,
        config: EngineConfig,
    ) -> Self {
        let directory = StaticDirectory::new();
        directory.add_owned_identity(identity.clone(), device_uid, Vec::new());
        let events = Arc::new(RecordingEvents::new());
        let starter = Arc::new(RecordingStarter::new());

        let collaborators =
            Collaborators::new(Arc::new(directory.clone()), events.clone(), starter.clone());
        let engine = ChannelEngine::new(env, storage, config, collaborators);

        Self { identity, device_uid, engine, directory, events, starter }
    }

    /// Id of this device's channel to `other`.
    pub fn channel_to<T: Storage>(&self, other: &Peer<T>) -> ChannelId {
        ChannelId::new(self.device_uid, other.identity.clone(), other.device_uid)
    }
}

/// Alice's and Bob's devices under one simulated clock.
pub struct PeerPair<S: Storage> {
    /// Shared clock and randomness
    pub env: SimEnv,
    /// First device
    pub alice: Peer<S>,
    /// Second device
    pub bob: Peer<S>,
}

impl PeerPair<MemoryStorage> {
    /// Two devices with in-memory stores.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_storages(config, MemoryStorage::new(), MemoryStorage::new())
    }
}

impl<S: Storage> PeerPair<S> {
    /// Two devices over the given stores.
    pub fn with_storages(config: EngineConfig, alice_storage: S, bob_storage: S) -> Self {
        let env = SimEnv::new(SCENARIO_START_SECS, 0x5EED);

        let alice = Peer::new(
            CryptoIdentity::new(b"alice".to_vec()),
            Uid::from_bytes([0xA1; 32]),
            env.clone(),
            alice_storage,
            config.clone(),
        );
        let bob = Peer::new(
            CryptoIdentity::new(b"bob".to_vec()),
            Uid::from_bytes([0xB1; 32]),
            env.clone(),
            bob_storage,
            config,
        );

        alice.directory.add_contact(&alice.identity, bob.identity.clone(), vec![bob.device_uid]);
        bob.directory.add_contact(&bob.identity, alice.identity.clone(), vec![alice.device_uid]);

        Self { env, alice, bob }
    }

    /// Alice's channel to Bob.
    pub fn alice_to_bob(&self) -> ChannelId {
        self.alice.channel_to(&self.bob)
    }

    /// Bob's channel to Alice.
    pub fn bob_to_alice(&self) -> ChannelId {
        self.bob.channel_to(&self.alice)
    }

    /// Create both channels from `seed`, as a completed key agreement
    /// would.
    pub fn establish(&self, seed: &Seed) -> Result<(), EngineError> {
        self.alice.engine.create_channel(self.alice_to_bob(), seed, CryptoSuite::LATEST.version())?;
        self.bob.engine.create_channel(self.bob_to_alice(), seed, CryptoSuite::LATEST.version())?;
        Ok(())
    }
}

/// Deterministic source of seeds and message keys.
pub struct Material {
    rng: ChaCha20Rng,
}

impl Material {
    /// Source seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self { rng: ChaCha20Rng::seed_from_u64(seed) }
    }

    /// Fresh shared seed.
    pub fn seed(&mut self) -> Seed {
        let mut bytes = [0u8; 32];
        self.rng.fill_bytes(&mut bytes);
        Seed::from_bytes(bytes)
    }

    /// Fresh message key.
    pub fn message_key(&mut self) -> AuthenticatedEncryptionKey {
        let mut bytes = [0u8; 32];
        self.rng.fill_bytes(&mut bytes);
        AuthenticatedEncryptionKey::new(CryptoSuite::LATEST, bytes)
    }

    /// Fresh device uid.
    pub fn device_uid(&mut self) -> Uid {
        let mut bytes = [0u8; 32];
        self.rng.fill_bytes(&mut bytes);
        Uid::from_bytes(bytes)
    }
}
