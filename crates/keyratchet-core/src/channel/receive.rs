//! Receive side: provisioning one-time keys and consuming them.
//!
//! A provision mints keys by self-ratcheting its receive seed, exactly as
//! the peer's send seed is ratcheted, so the n-th minted key of a
//! generation is the key the peer used for its n-th wrap under that
//! generation's seed.

use std::time::Duration;

use keyratchet_crypto::{CryptoError, Seed, self_ratchet};

use super::{Channel, Tracked};
use crate::{
    Timestamp,
    storage::{KeyMaterialKey, KeyMaterialRecord, ProvisionRecord},
};

impl Channel {
    /// Start a new provision generation from a full-ratchet seed.
    ///
    /// Older generations are kept so in-flight messages under the previous
    /// send seed still find their key; their keys expire through the usual
    /// consumption path and collection.
    pub(crate) fn create_new_provision(
        &mut self,
        seed: &Seed,
        receive_window: u32,
    ) -> Result<u32, CryptoError> {
        let suite = self.record.get().crypto_suite_version;
        let receive_seed = seed.diversify(&self.id.remote_device_uid, suite)?;

        let generation = self.record.get().full_ratcheting_count_of_last_provision.saturating_add(1);
        self.add_provision(generation, receive_seed, receive_window)?;
        self.record.get_mut().full_ratcheting_count_of_last_provision = generation;
        Ok(generation)
    }

    pub(super) fn add_provision(
        &mut self,
        generation: u32,
        receive_seed: Seed,
        receive_window: u32,
    ) -> Result<(), CryptoError> {
        self.provisions.insert(
            generation,
            Tracked::created(ProvisionRecord {
                seed_for_next_provisioned_receive_key: receive_seed,
                self_ratcheting_count_of_next_key: 0,
            }),
        );
        self.replenish(generation, receive_window)
    }

    /// Consume a key material after it decrypted a message.
    ///
    /// Stages, in one unit: marking every older still-active key of the
    /// channel as expiring at `now + grace`, bumping the decrypt counter of
    /// an in-progress full ratchet, deleting the consumed key, topping the
    /// owning provision back up to `receive_window` active keys, and
    /// confirming the channel. A key that was already expiring belongs to a
    /// generation the peer has moved past, so its provision is only topped
    /// up if it is the newest.
    ///
    /// The channel record is pinned even when nothing in it changes: the
    /// decrypt counter and the newest generation are read from it.
    ///
    /// Returns true if the channel became confirmed.
    pub(crate) fn consume(
        &mut self,
        consumed: &KeyMaterialKey,
        now: Timestamp,
        grace: Duration,
        receive_window: u32,
    ) -> Result<bool, CryptoError> {
        let position = (consumed.full_ratcheting_count, consumed.self_ratcheting_count);
        let deadline = now.saturating_add(grace);

        // Keys before the consumed one belong to messages that were skipped
        // or are still in flight
        for (_, material) in self
            .key_materials
            .range_mut(..position)
            .filter(|(_, m)| m.is_live() && m.get().is_active())
        {
            material.get_mut().expiration = Some(deadline);
        }

        if self.record.get().full_ratchet_in_progress {
            let record = self.record.get_mut();
            record.number_of_decrypted_messages_since_last_full_ratchet_sent_message = record
                .number_of_decrypted_messages_since_last_full_ratchet_sent_message
                .saturating_add(1);
        }

        let mut was_active = false;
        if let Some(material) = self.key_materials.get_mut(&position) {
            was_active = material.get().is_active();
            material.delete();
        }
        // An older generation keeps serving the peer's previous send seed
        // until a newer key opens; after that its late keys only drain
        let newest = self.record.get().full_ratcheting_count_of_last_provision;
        if was_active || consumed.full_ratcheting_count == newest {
            self.replenish(consumed.full_ratcheting_count, receive_window)?;
        }

        self.record.pin();
        Ok(self.confirm())
    }

    /// Mint keys until the provision holds `receive_window` active keys.
    fn replenish(&mut self, generation: u32, receive_window: u32) -> Result<(), CryptoError> {
        let active = self
            .key_materials
            .range((generation, 0)..=(generation, u32::MAX))
            .filter(|(_, m)| m.is_live() && m.get().is_active())
            .count();

        let missing = usize::try_from(receive_window).unwrap_or(usize::MAX).saturating_sub(active);
        for _ in 0..missing {
            self.mint(generation)?;
        }
        Ok(())
    }

    fn mint(&mut self, generation: u32) -> Result<(), CryptoError> {
        let suite = self.record.get().crypto_suite_version;
        let Some(provision) = self.provisions.get_mut(&generation).filter(|p| p.is_live()) else {
            tracing::warn!(channel = %self.id, generation, "No provision to mint from");
            return Ok(());
        };

        let output = self_ratchet(&provision.get().seed_for_next_provisioned_receive_key, suite)?;
        let record = provision.get_mut();
        let sequence = record.self_ratcheting_count_of_next_key;
        record.seed_for_next_provisioned_receive_key = output.next_seed;
        record.self_ratcheting_count_of_next_key = sequence.saturating_add(1);

        self.key_materials.insert(
            (generation, sequence),
            Tracked::created(KeyMaterialRecord {
                key_id: output.key_id,
                key: output.key,
                expiration: None,
            }),
        );
        Ok(())
    }
}
