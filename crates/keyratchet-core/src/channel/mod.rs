//! The channel aggregate.
//!
//! A [`Channel`] is one channel record together with its provisions and key
//! materials, loaded at known versions. Every mutation is staged in memory
//! and only reaches the store through [`Channel::change_set`], which turns
//! the staged records into a single [`ChangeSet`] whose operations carry
//! the versions that were read. The store then applies all of it or none.

pub mod full_ratchet;
mod receive;
mod send;

use std::collections::BTreeMap;

use keyratchet_crypto::{CryptoError, Seed};

use crate::{
    ChannelId, Timestamp,
    storage::{
        ChangeSet, ChannelRecord, KeyMaterialKey, KeyMaterialRecord, ProvisionKey, ProvisionRecord,
        Storage, StorageError, Versioned,
    },
};

/// A record as loaded, plus what happened to it since.
#[derive(Debug, Clone)]
struct Tracked<T> {
    /// Version read from the store; `None` for records created in memory
    version: Option<u64>,
    record: T,
    dirty: bool,
    deleted: bool,
    /// Written or not, the commit fails if the stored version moved
    pinned: bool,
}

impl<T> Tracked<T> {
    fn loaded(versioned: Versioned<T>) -> Self {
        Self {
            version: Some(versioned.version),
            record: versioned.record,
            dirty: false,
            deleted: false,
            pinned: false,
        }
    }

    fn created(record: T) -> Self {
        Self { version: None, record, dirty: true, deleted: false, pinned: false }
    }

    fn get(&self) -> &T {
        &self.record
    }

    fn get_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.record
    }

    fn delete(&mut self) {
        self.deleted = true;
    }

    fn pin(&mut self) {
        self.pinned = true;
    }

    fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// A channel with its provisions and key materials.
#[derive(Debug, Clone)]
pub(crate) struct Channel {
    id: ChannelId,
    record: Tracked<ChannelRecord>,
    /// Keyed by generation
    provisions: BTreeMap<u32, Tracked<ProvisionRecord>>,
    /// Keyed by `(generation, sequence number)`
    key_materials: BTreeMap<(u32, u32), Tracked<KeyMaterialRecord>>,
}

impl Channel {
    /// Build a brand new channel.
    ///
    /// The send seed is the shared seed diversified with the local device
    /// uid, the generation-0 receive seed the shared seed diversified with
    /// the remote device uid, and generation 0 is provisioned with
    /// `receive_window` keys right away. Nothing is stored yet.
    ///
    /// # Errors
    ///
    /// - `UnsupportedSuite` if `crypto_suite_version` is unknown
    pub(crate) fn create(
        id: ChannelId,
        seed: &Seed,
        crypto_suite_version: u32,
        now: Timestamp,
        receive_window: u32,
    ) -> Result<Self, CryptoError> {
        let send_seed = seed.diversify(&id.current_device_uid, crypto_suite_version)?;
        let receive_seed = seed.diversify(&id.remote_device_uid, crypto_suite_version)?;

        let record = ChannelRecord {
            is_confirmed: false,
            crypto_suite_version,
            seed_for_next_send_key: send_seed,
            number_of_encrypted_messages: 0,
            number_of_encrypted_messages_at_last_full_ratchet: 0,
            number_of_decrypted_messages_since_last_full_ratchet_sent_message: 0,
            number_of_encrypted_messages_since_last_full_ratchet_sent_message: 0,
            timestamp_of_last_full_ratchet: now,
            timestamp_of_last_full_ratchet_sent_message: now,
            full_ratchet_in_progress: false,
            full_ratcheting_count_of_last_provision: 0,
        };

        let mut channel = Self {
            id,
            record: Tracked::created(record),
            provisions: BTreeMap::new(),
            key_materials: BTreeMap::new(),
        };
        channel.add_provision(0, receive_seed, receive_window)?;
        Ok(channel)
    }

    /// Load a channel and everything it owns.
    ///
    /// Returns `None` if the channel record does not exist.
    pub(crate) fn load<S: Storage>(
        storage: &S,
        id: &ChannelId,
    ) -> Result<Option<Self>, StorageError> {
        let Some(record) = storage.load_channel(id)? else {
            return Ok(None);
        };

        let provisions = storage
            .load_provisions(id)?
            .into_iter()
            .map(|(key, provision)| (key.full_ratcheting_count, Tracked::loaded(provision)))
            .collect();

        let key_materials = storage
            .load_key_materials(id)?
            .into_iter()
            .map(|(key, material)| {
                ((key.full_ratcheting_count, key.self_ratcheting_count), Tracked::loaded(material))
            })
            .collect();

        Ok(Some(Self { id: id.clone(), record: Tracked::loaded(record), provisions, key_materials }))
    }

    /// Aggregate over the channel record alone.
    ///
    /// Provisions and key materials are neither loaded nor touched, so the
    /// change set only ever writes the channel record and records created in
    /// memory. Enough for the send side and for starting a new generation.
    pub(crate) fn from_record(id: ChannelId, record: Versioned<ChannelRecord>) -> Self {
        Self {
            id,
            record: Tracked::loaded(record),
            provisions: BTreeMap::new(),
            key_materials: BTreeMap::new(),
        }
    }

    pub(crate) fn id(&self) -> &ChannelId {
        &self.id
    }

    pub(crate) fn record(&self) -> &ChannelRecord {
        self.record.get()
    }

    /// Version of the channel record as loaded; `None` if created in memory.
    #[cfg(test)]
    pub(crate) fn version(&self) -> Option<u64> {
        self.record.version
    }

    /// Version of a key material as loaded, if it is still live in memory.
    pub(crate) fn key_material_version(&self, key: &KeyMaterialKey) -> Option<u64> {
        self.key_materials
            .get(&(key.full_ratcheting_count, key.self_ratcheting_count))
            .filter(|material| material.is_live())
            .and_then(|material| material.version)
    }

    /// Generations of the live provisions, oldest first.
    #[cfg(test)]
    pub(crate) fn provision_generations(&self) -> impl Iterator<Item = u32> + '_ {
        self.provisions.iter().filter(|(_, p)| p.is_live()).map(|(generation, _)| *generation)
    }

    /// Live key materials, oldest first.
    #[cfg(test)]
    pub(crate) fn key_materials(&self) -> impl Iterator<Item = (KeyMaterialKey, &KeyMaterialRecord)> {
        self.key_materials.iter().filter(|(_, m)| m.is_live()).map(|((generation, sequence), m)| {
            (self.key_material_key(*generation, *sequence), m.get())
        })
    }

    /// Mark the channel confirmed. Returns true if it was not confirmed yet.
    pub(crate) fn confirm(&mut self) -> bool {
        if self.record.get().is_confirmed {
            return false;
        }
        self.record.get_mut().is_confirmed = true;
        true
    }

    /// Stage the removal of the channel and everything it owns.
    pub(crate) fn delete(&mut self) {
        self.record.delete();
        for provision in self.provisions.values_mut() {
            provision.delete();
        }
        for material in self.key_materials.values_mut() {
            material.delete();
        }
    }

    /// Operations persisting everything staged since the load.
    ///
    /// Untouched records produce no operation unless pinned, in which case
    /// they are checked at the version read. Created records are put with
    /// `None` (must not exist), changed records with the version read, and
    /// deleted records are deleted at the version read.
    pub(crate) fn change_set(&self) -> ChangeSet {
        let mut changes = ChangeSet::new();

        for ((generation, sequence), material) in &self.key_materials {
            let key = self.key_material_key(*generation, *sequence);
            stage(&mut changes, material, key, |changes, key, record, expected| {
                changes.put_key_material(key, record, expected);
            });
        }

        for (generation, provision) in &self.provisions {
            let key = self.provision_key(*generation);
            stage(&mut changes, provision, key, |changes, key, record, expected| {
                changes.put_provision(key, record, expected);
            });
        }

        stage(&mut changes, &self.record, self.id.clone(), |changes, id, record, expected| {
            changes.put_channel(id, record, expected);
        });

        changes
    }

    fn provision_key(&self, generation: u32) -> ProvisionKey {
        ProvisionKey { channel: self.id.clone(), full_ratcheting_count: generation }
    }

    fn key_material_key(&self, generation: u32, sequence: u32) -> KeyMaterialKey {
        KeyMaterialKey {
            channel: self.id.clone(),
            full_ratcheting_count: generation,
            self_ratcheting_count: sequence,
        }
    }
}

/// Queue the operation persisting one tracked record, if any.
fn stage<K, T, F>(changes: &mut ChangeSet, tracked: &Tracked<T>, key: K, put: F)
where
    K: Into<crate::storage::RecordKey>,
    T: Clone,
    F: FnOnce(&mut ChangeSet, K, T, Option<u64>),
{
    if tracked.deleted {
        // Created and deleted in memory: never existed for the store
        if let Some(version) = tracked.version {
            changes.delete(key, version);
        }
    } else if tracked.dirty {
        put(changes, key, tracked.record.clone(), tracked.version);
    } else if tracked.pinned {
        changes.check(key, tracked.version);
    }
}

#[cfg(test)]
mod tests {
    use keyratchet_crypto::Uid;

    use super::*;
    use crate::{CryptoIdentity, storage::MemoryStorage};

    pub(super) fn channel_id() -> ChannelId {
        ChannelId::new(
            Uid::from_bytes([1; 32]),
            CryptoIdentity::new(b"bob".to_vec()),
            Uid::from_bytes([2; 32]),
        )
    }

    pub(super) fn now() -> Timestamp {
        Timestamp::from_secs(1_700_000_000)
    }

    #[test]
    fn create_provisions_generation_zero() {
        let channel = Channel::create(channel_id(), &Seed::from_bytes([7; 32]), 0, now(), 4).unwrap();

        assert_eq!(channel.provision_generations().collect::<Vec<_>>(), vec![0]);
        let keys: Vec<_> = channel.key_materials().map(|(key, _)| key.self_ratcheting_count).collect();
        assert_eq!(keys, vec![0, 1, 2, 3]);
        assert!(channel.key_materials().all(|(_, material)| material.is_active()));

        let record = channel.record();
        assert!(!record.is_confirmed);
        assert_eq!(record.timestamp_of_last_full_ratchet, now());
        assert_eq!(record.timestamp_of_last_full_ratchet_sent_message, now());
    }

    #[test]
    fn create_rejects_unknown_suite() {
        let result = Channel::create(channel_id(), &Seed::from_bytes([7; 32]), 99, now(), 4);
        assert_eq!(result.unwrap_err(), CryptoError::UnsupportedSuite { version: 99 });
    }

    #[test]
    fn directions_are_diversified_apart() {
        let channel = Channel::create(channel_id(), &Seed::from_bytes([7; 32]), 0, now(), 1).unwrap();
        let send = channel.record().seed_for_next_send_key.clone();
        let receive = channel.provisions[&0].get().seed_for_next_provisioned_receive_key.clone();
        assert_ne!(send, receive);
    }

    #[test]
    fn load_round_trips_a_committed_channel() {
        let storage = MemoryStorage::new();
        let created = Channel::create(channel_id(), &Seed::from_bytes([7; 32]), 0, now(), 3).unwrap();
        storage.commit(created.change_set()).unwrap();

        let loaded = Channel::load(&storage, &channel_id()).unwrap().unwrap();
        assert_eq!(loaded.record(), created.record());
        assert_eq!(loaded.key_materials().count(), 3);
        assert!(loaded.version().is_some());
        assert!(loaded.change_set().is_empty(), "untouched aggregate must not write");
    }

    #[test]
    fn load_missing_channel_is_none() {
        let storage = MemoryStorage::new();
        assert!(Channel::load(&storage, &channel_id()).unwrap().is_none());
    }

    #[test]
    fn delete_cascades_to_owned_records() {
        let storage = MemoryStorage::new();
        let created = Channel::create(channel_id(), &Seed::from_bytes([7; 32]), 0, now(), 3).unwrap();
        storage.commit(created.change_set()).unwrap();

        let mut loaded = Channel::load(&storage, &channel_id()).unwrap().unwrap();
        loaded.delete();
        // 1 channel + 1 provision + 3 keys
        assert_eq!(loaded.change_set().len(), 5);
        storage.commit(loaded.change_set()).unwrap();

        assert_eq!(storage.channel_count(), 0);
        assert_eq!(storage.provision_count(), 0);
        assert_eq!(storage.key_material_count(), 0);
    }

    #[test]
    fn stale_aggregate_cannot_commit() {
        let storage = MemoryStorage::new();
        let created = Channel::create(channel_id(), &Seed::from_bytes([7; 32]), 0, now(), 1).unwrap();
        storage.commit(created.change_set()).unwrap();

        let mut first = Channel::load(&storage, &channel_id()).unwrap().unwrap();
        let mut second = first.clone();

        assert!(first.confirm());
        storage.commit(first.change_set()).unwrap();

        assert!(second.confirm());
        assert!(storage.commit(second.change_set()).unwrap_err().is_conflict());
    }

    #[test]
    fn confirm_is_idempotent() {
        let mut channel = Channel::create(channel_id(), &Seed::from_bytes([7; 32]), 0, now(), 1).unwrap();
        assert!(channel.confirm());
        assert!(!channel.confirm());
    }
}
