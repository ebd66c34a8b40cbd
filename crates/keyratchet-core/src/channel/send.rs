//! Send side: ratcheting the send seed and the full-ratchet bookkeeping.

use keyratchet_crypto::{
    AuthenticatedEncryptionKey, CryptoError, NONCE_SIZE, Seed, compose_header, self_ratchet,
    wrap_key,
};

use super::Channel;
use crate::Timestamp;

impl Channel {
    /// Ratchet the send seed once and wrap `message_key` under the derived
    /// key.
    ///
    /// Returns the header `key id ‖ nonce ‖ ciphertext`. The seed that
    /// produced the key is replaced in the staged record; it only disappears
    /// from the store once the change set commits.
    pub(crate) fn wrap(
        &mut self,
        message_key: &AuthenticatedEncryptionKey,
        nonce: [u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, CryptoError> {
        let output = {
            let record = self.record.get();
            self_ratchet(&record.seed_for_next_send_key, record.crypto_suite_version)?
        };

        let record = self.record.get_mut();
        record.seed_for_next_send_key = output.next_seed;
        record.number_of_encrypted_messages = record.number_of_encrypted_messages.saturating_add(1);
        record.number_of_encrypted_messages_since_last_full_ratchet_sent_message = record
            .number_of_encrypted_messages_since_last_full_ratchet_sent_message
            .saturating_add(1);

        let ciphertext = wrap_key(message_key, &output.key, nonce);
        Ok(compose_header(&output.key_id, &ciphertext))
    }

    /// Install a send seed obtained by a completed full ratchet.
    ///
    /// The seed is diversified with the local device uid, the wrap counter
    /// baseline and the full-ratchet timestamp are reset, and the channel
    /// leaves the in-progress state.
    pub(crate) fn update_send_seed(&mut self, seed: &Seed, now: Timestamp) -> Result<(), CryptoError> {
        let diversified =
            seed.diversify(&self.id.current_device_uid, self.record.get().crypto_suite_version)?;

        let record = self.record.get_mut();
        record.seed_for_next_send_key = diversified;
        record.number_of_encrypted_messages_at_last_full_ratchet = record.number_of_encrypted_messages;
        record.timestamp_of_last_full_ratchet = now;
        record.full_ratchet_in_progress = false;
        Ok(())
    }

    /// Record that a full-ratchet protocol message was just sent.
    pub(crate) fn mark_full_ratchet_message_sent(&mut self, now: Timestamp) {
        let record = self.record.get_mut();
        record.full_ratchet_in_progress = true;
        record.number_of_decrypted_messages_since_last_full_ratchet_sent_message = 0;
        record.number_of_encrypted_messages_since_last_full_ratchet_sent_message = 0;
        record.timestamp_of_last_full_ratchet_sent_message = now;
    }
}
