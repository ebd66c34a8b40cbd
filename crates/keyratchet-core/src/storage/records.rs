//! Persisted records and their keys.
//!
//! Ownership is expressed through keys rather than pointers: a provision is
//! keyed by its channel id plus generation, a key material by its provision
//! key plus sequence number. Deleting a channel therefore means deleting
//! every record whose key starts with the channel id.

use std::fmt;

use keyratchet_crypto::{AuthenticatedEncryptionKey, CryptoKeyId, Seed};
use serde::{Deserialize, Serialize};

use crate::{ChannelId, Timestamp};

/// A stored record together with the version it was written at.
///
/// Versions are assigned by the store, strictly increase across all writes,
/// and are what [`super::ChangeSet`] operations check against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Store-assigned write version
    pub version: u64,
    /// The record itself
    pub record: T,
}

/// Send-side state and full-ratchet bookkeeping of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Set on first successful decrypt or by explicit confirmation
    pub is_confirmed: bool,
    /// Crypto suite every seed of this channel is derived with
    pub crypto_suite_version: u32,
    /// Consumed and replaced by every wrap
    pub seed_for_next_send_key: Seed,
    /// Total wraps performed on this channel
    pub number_of_encrypted_messages: u64,
    /// Value of `number_of_encrypted_messages` when the send seed was last
    /// replaced by a full ratchet
    pub number_of_encrypted_messages_at_last_full_ratchet: u64,
    /// Decrypts since the last full-ratchet protocol message was sent
    pub number_of_decrypted_messages_since_last_full_ratchet_sent_message: u64,
    /// Wraps since the last full-ratchet protocol message was sent
    pub number_of_encrypted_messages_since_last_full_ratchet_sent_message: u64,
    /// Channel creation or last completed send-seed update
    pub timestamp_of_last_full_ratchet: Timestamp,
    /// Last time a full-ratchet protocol message was sent
    pub timestamp_of_last_full_ratchet_sent_message: Timestamp,
    /// A renegotiation has been started and not completed
    pub full_ratchet_in_progress: bool,
    /// Generation of the newest provision
    pub full_ratcheting_count_of_last_provision: u32,
}

impl ChannelRecord {
    /// Wraps performed since the send seed was last replaced.
    pub fn encrypted_messages_since_last_full_ratchet(&self) -> u64 {
        self.number_of_encrypted_messages
            .saturating_sub(self.number_of_encrypted_messages_at_last_full_ratchet)
    }
}

/// Receive-side seed of one provision generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRecord {
    /// Seed the next receive key is minted from
    pub seed_for_next_provisioned_receive_key: Seed,
    /// Sequence number the next minted key will carry
    pub self_ratcheting_count_of_next_key: u32,
}

/// One-time receive key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterialRecord {
    /// Routing tag senders prefix to the ciphertext
    pub key_id: CryptoKeyId,
    /// Key that unwraps the message key
    pub key: AuthenticatedEncryptionKey,
    /// `None` while active; once set, the key is garbage collected after
    /// this instant but stays usable until then
    pub expiration: Option<Timestamp>,
}

impl KeyMaterialRecord {
    /// Eligible to decrypt and not yet scheduled for removal.
    pub fn is_active(&self) -> bool {
        self.expiration.is_none()
    }
}

/// Key of a provision: `(channel, generation)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProvisionKey {
    /// Owning channel
    pub channel: ChannelId,
    /// Generation index within the channel
    pub full_ratcheting_count: u32,
}

/// Key of a key material: `(channel, generation, sequence number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyMaterialKey {
    /// Owning channel
    pub channel: ChannelId,
    /// Generation of the owning provision
    pub full_ratcheting_count: u32,
    /// Sequence number within the provision
    pub self_ratcheting_count: u32,
}

impl KeyMaterialKey {
    /// Key of the owning provision.
    pub fn provision(&self) -> ProvisionKey {
        ProvisionKey {
            channel: self.channel.clone(),
            full_ratcheting_count: self.full_ratcheting_count,
        }
    }
}

/// Any record key, used by deletes, checks and conflict reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// A channel record
    Channel(ChannelId),
    /// A provision record
    Provision(ProvisionKey),
    /// A key material record
    KeyMaterial(KeyMaterialKey),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "channel {id}"),
            Self::Provision(key) => {
                write!(f, "provision {}#{}", key.channel, key.full_ratcheting_count)
            },
            Self::KeyMaterial(key) => write!(
                f,
                "key material {}#{}.{}",
                key.channel, key.full_ratcheting_count, key.self_ratcheting_count
            ),
        }
    }
}

impl From<ChannelId> for RecordKey {
    fn from(id: ChannelId) -> Self {
        Self::Channel(id)
    }
}

impl From<ProvisionKey> for RecordKey {
    fn from(key: ProvisionKey) -> Self {
        Self::Provision(key)
    }
}

impl From<KeyMaterialKey> for RecordKey {
    fn from(key: KeyMaterialKey) -> Self {
        Self::KeyMaterial(key)
    }
}
