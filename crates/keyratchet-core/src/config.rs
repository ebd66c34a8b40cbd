//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default replenishment target of a provision.
pub const DEFAULT_RECEIVE_WINDOW: u32 = 50;

/// Thresholds and windows driving provisioning, the full-ratchet decision
/// and garbage collection.
///
/// The full-ratchet thresholds are inclusive: a counter equal to its
/// threshold already requires a full ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum number of active keys a provision keeps; also the batch
    /// minted when a provision is created
    pub receive_window: u32,
    /// Wraps since the last full ratchet before a new one is required
    pub max_encrypted_per_full_ratchet: u64,
    /// Age of the send seed lineage before a new full ratchet is required
    pub full_ratchet_validity: Duration,
    /// Decrypts since the last full-ratchet message after which the peer is
    /// presumed not to have answered
    pub max_decrypted_since_full_ratchet_message: u64,
    /// Time since the last full-ratchet message after which it is re-sent
    pub full_ratchet_message_timeout: Duration,
    /// Wraps since the last full-ratchet message after which the peer risks
    /// running out of receive keys for the old generation
    pub max_encrypted_since_full_ratchet_message: u64,
    /// Delay between a key becoming obsolete and its collection
    pub expiration_grace_period: Duration,
    /// Channels on an older crypto suite are never used for posting
    pub min_acceptable_suite_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            receive_window: DEFAULT_RECEIVE_WINDOW,
            max_encrypted_per_full_ratchet: 100,
            full_ratchet_validity: Duration::from_secs(30 * 24 * 3600),
            max_decrypted_since_full_ratchet_message: 20,
            full_ratchet_message_timeout: Duration::from_secs(3600),
            max_encrypted_since_full_ratchet_message: u64::from(DEFAULT_RECEIVE_WINDOW),
            expiration_grace_period: Duration::from_secs(7 * 24 * 3600),
            min_acceptable_suite_version: 0,
        }
    }
}

impl EngineConfig {
    /// Set the receive window, keeping the in-progress wrap threshold in
    /// step with it.
    #[must_use]
    pub fn with_receive_window(mut self, receive_window: u32) -> Self {
        self.receive_window = receive_window;
        self.max_encrypted_since_full_ratchet_message = u64::from(receive_window);
        self
    }
}
