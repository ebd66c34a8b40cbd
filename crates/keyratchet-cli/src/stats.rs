//! Store statistics.

use keyratchet_core::{
    ChannelId, Timestamp,
    storage::{Storage, StorageError},
};

/// What one channel holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    /// Channel id
    pub id: ChannelId,
    /// Confirmed by the remote device
    pub confirmed: bool,
    /// Crypto suite of the channel
    pub suite: u32,
    /// Wraps since creation
    pub encrypted: u64,
    /// A full-ratchet message is awaiting its answer
    pub full_ratchet_in_progress: bool,
    /// Provision generations present
    pub provisions: usize,
    /// Keys waiting for a message
    pub active_keys: usize,
    /// Keys marked for collection
    pub expiring_keys: usize,
    /// Expiring keys already past their deadline
    pub collectable_keys: usize,
}

/// Totals over a whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Per-channel figures, in channel order
    pub channels: Vec<ChannelStats>,
}

impl StoreStats {
    /// Read every channel of `storage`, judging deadlines against `now`.
    pub fn collect<S: Storage>(storage: &S, now: Timestamp) -> Result<Self, StorageError> {
        let mut channels = Vec::new();
        for id in storage.list_channels()? {
            let Some(channel) = storage.load_channel(&id)? else {
                // Deleted since listing
                continue;
            };
            let provisions = storage.load_provisions(&id)?.len();
            let keys = storage.load_key_materials(&id)?;

            let expiring: Vec<_> =
                keys.iter().filter_map(|(_, m)| m.record.expiration).collect();
            let collectable = expiring.iter().filter(|at| **at < now).count();

            channels.push(ChannelStats {
                id,
                confirmed: channel.record.is_confirmed,
                suite: channel.record.crypto_suite_version,
                encrypted: channel.record.number_of_encrypted_messages,
                full_ratchet_in_progress: channel.record.full_ratchet_in_progress,
                provisions,
                active_keys: keys.len() - expiring.len(),
                expiring_keys: expiring.len(),
                collectable_keys: collectable,
            });
        }
        Ok(Self { channels })
    }

    /// Confirmed channels.
    pub fn confirmed(&self) -> usize {
        self.channels.iter().filter(|c| c.confirmed).count()
    }

    /// Active keys over all channels.
    pub fn active_keys(&self) -> usize {
        self.channels.iter().map(|c| c.active_keys).sum()
    }

    /// Expiring keys over all channels.
    pub fn expiring_keys(&self) -> usize {
        self.channels.iter().map(|c| c.expiring_keys).sum()
    }

    /// Keys the next collection pass would delete.
    pub fn collectable_keys(&self) -> usize {
        self.channels.iter().map(|c| c.collectable_keys).sum()
    }

    /// Log the figures, one line per channel then the totals.
    pub fn log(&self) {
        for channel in &self.channels {
            tracing::info!(
                channel = %channel.id,
                confirmed = channel.confirmed,
                suite = channel.suite,
                encrypted = channel.encrypted,
                full_ratchet_in_progress = channel.full_ratchet_in_progress,
                provisions = channel.provisions,
                active_keys = channel.active_keys,
                expiring_keys = channel.expiring_keys,
                "Channel"
            );
        }
        tracing::info!(
            channels = self.channels.len(),
            confirmed = self.confirmed(),
            active_keys = self.active_keys(),
            expiring_keys = self.expiring_keys(),
            collectable_keys = self.collectable_keys(),
            "Store totals"
        );
    }
}
