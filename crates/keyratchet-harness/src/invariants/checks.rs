//! Standard invariant checks.
//!
//! These invariants capture structural properties of a ratchet store that
//! must hold after every committed operation, whatever sequence of wraps,
//! unwraps, full ratchets and collections led there.

use super::{Invariant, InvariantResult, StoreSnapshot, Violation};

/// Every listed channel id has a loadable record.
pub struct ChannelsLoadable;

impl Invariant for ChannelsLoadable {
    fn name(&self) -> &'static str {
        "channels_loadable"
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        if let Some(id) = state.dangling_channel_ids.first() {
            return Err(Violation {
                invariant: self.name(),
                message: format!("channel {id} is listed but has no record"),
            });
        }
        Ok(())
    }
}

/// Every key material belongs to a provision of its channel.
///
/// Deleting a channel or collecting a provision must never leave keys
/// behind.
pub struct KeyMaterialHasProvision;

impl Invariant for KeyMaterialHasProvision {
    fn name(&self) -> &'static str {
        "key_material_has_provision"
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        for (id, channel) in &state.channels {
            for (generation, sequence) in channel.key_materials.keys() {
                if !channel.provisions.contains_key(generation) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "channel {id}: key {generation}.{sequence} has no provision"
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The newest provision of a channel exists and nothing is newer.
pub struct NewestProvisionPresent;

impl Invariant for NewestProvisionPresent {
    fn name(&self) -> &'static str {
        "newest_provision_present"
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        for (id, channel) in &state.channels {
            let newest = channel.record.full_ratcheting_count_of_last_provision;
            if !channel.provisions.contains_key(&newest) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("channel {id}: newest provision {newest} missing"),
                });
            }
            if let Some(beyond) = channel.provisions.keys().find(|generation| **generation > newest)
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("channel {id}: provision {beyond} newer than {newest}"),
                });
            }
        }
        Ok(())
    }
}

/// Minted keys are behind their provision's next sequence number.
///
/// A key at or past `self_ratcheting_count_of_next_key` would mean the
/// provision seed was rolled back and the same key could be minted twice.
pub struct SequenceBehindProvision;

impl Invariant for SequenceBehindProvision {
    fn name(&self) -> &'static str {
        "sequence_behind_provision"
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        for (id, channel) in &state.channels {
            for (generation, sequence) in channel.key_materials.keys() {
                let Some(provision) = channel.provisions.get(generation) else {
                    continue;
                };
                if *sequence >= provision.self_ratcheting_count_of_next_key {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "channel {id}: key {generation}.{sequence} not behind next key {}",
                            provision.self_ratcheting_count_of_next_key
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The newest provision keeps at least `receive_window` active keys.
pub struct ReceiveWindowFilled {
    /// Expected number of active keys
    pub receive_window: u32,
}

impl Invariant for ReceiveWindowFilled {
    fn name(&self) -> &'static str {
        "receive_window_filled"
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        let expected = self.receive_window as usize;
        for (id, channel) in &state.channels {
            let newest = channel.record.full_ratcheting_count_of_last_provision;
            let active = channel.active_keys_in(newest);
            if active < expected {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "channel {id}: provision {newest} has {active} active keys, expected {expected}"
                    ),
                });
            }
        }
        Ok(())
    }
}
