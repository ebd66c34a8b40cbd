//! Store snapshots for invariant checking.

use std::collections::BTreeMap;

use keyratchet_core::{
    ChannelId,
    storage::{ChannelRecord, KeyMaterialRecord, ProvisionRecord, Storage, StorageError},
};

/// Everything one channel owns, as read from the store.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    /// The channel record
    pub record: ChannelRecord,
    /// Provisions by generation
    pub provisions: BTreeMap<u32, ProvisionRecord>,
    /// Key materials by `(generation, sequence number)`
    pub key_materials: BTreeMap<(u32, u32), KeyMaterialRecord>,
}

impl ChannelSnapshot {
    /// Active key materials of one generation.
    pub fn active_keys_in(&self, generation: u32) -> usize {
        self.key_materials
            .iter()
            .filter(|((g, _), material)| *g == generation && material.is_active())
            .count()
    }
}

/// Observable state of a whole store.
///
/// Orphans (provisions or keys whose channel record is gone) are collected
/// separately so invariants can flag them.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Channels by id
    pub channels: BTreeMap<ChannelId, ChannelSnapshot>,
    /// Channels listed by the store whose record could not be loaded
    pub dangling_channel_ids: Vec<ChannelId>,
}

impl StoreSnapshot {
    /// Read the whole store.
    pub fn capture<S: Storage>(storage: &S) -> Result<Self, StorageError> {
        let mut snapshot = Self::default();

        for id in storage.list_channels()? {
            let Some(record) = storage.load_channel(&id)? else {
                snapshot.dangling_channel_ids.push(id);
                continue;
            };

            let provisions = storage
                .load_provisions(&id)?
                .into_iter()
                .map(|(key, provision)| (key.full_ratcheting_count, provision.record))
                .collect();

            let key_materials = storage
                .load_key_materials(&id)?
                .into_iter()
                .map(|(key, material)| {
                    ((key.full_ratcheting_count, key.self_ratcheting_count), material.record)
                })
                .collect();

            snapshot
                .channels
                .insert(id, ChannelSnapshot { record: record.record, provisions, key_materials });
        }

        Ok(snapshot)
    }

    /// Total key materials across all channels.
    pub fn key_material_count(&self) -> usize {
        self.channels.values().map(|channel| channel.key_materials.len()).sum()
    }
}
