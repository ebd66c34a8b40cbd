//! Full-ratchet decision state machine.
//!
//! ```text
//!                  T1 wraps or W1 elapsed
//!  NotInProgress ─────────────────────────► must start
//!        ▲                                     │ full-ratchet message sent
//!        │ send seed updated                   ▼
//!        └────────────────────────────────  InProgress ──► must restart
//!                                    T2 decrypts, W2 elapsed or T3 wraps
//!                                    since the last protocol message
//! ```
//!
//! Evaluation is pure: it reads a [`ChannelRecord`] and the current time and
//! never mutates anything. The engine evaluates after every committed
//! state-affecting transaction and hands a positive decision to the
//! [`crate::FullRatchetStarter`].

use std::{fmt, time::Duration};

use crate::{EngineConfig, Timestamp, storage::ChannelRecord};

/// Whether a renegotiation of the send seed is underway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullRatchetState {
    /// The current send seed lineage is in use, no renegotiation started
    NotInProgress,
    /// A renegotiation message was sent and no new send seed arrived yet
    InProgress,
}

impl ChannelRecord {
    /// Current state of the full-ratchet state machine.
    pub fn full_ratchet_state(&self) -> FullRatchetState {
        if self.full_ratchet_in_progress {
            FullRatchetState::InProgress
        } else {
            FullRatchetState::NotInProgress
        }
    }
}

/// Why a full ratchet is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullRatchetTrigger {
    /// Too many wraps under the current send seed lineage
    EncryptedMessageBudget {
        /// Wraps since the last full ratchet
        count: u64,
    },
    /// The current send seed lineage is too old
    SeedLineageExpired {
        /// Time since the last full ratchet
        age: Duration,
    },
    /// Many messages arrived but the peer never answered the renegotiation
    PeerUnresponsive {
        /// Decrypts since the last full-ratchet message
        count: u64,
    },
    /// The last full-ratchet message is too old
    FullRatchetMessageTimedOut {
        /// Time since the last full-ratchet message
        elapsed: Duration,
    },
    /// Enough wraps since the last full-ratchet message that the peer could
    /// lose keys for in-flight messages once the renegotiation completes
    ReprovisioningRisk {
        /// Wraps since the last full-ratchet message
        count: u64,
    },
}

impl FullRatchetTrigger {
    /// True if the trigger restarts a renegotiation already in progress.
    pub fn is_restart(&self) -> bool {
        matches!(
            self,
            Self::PeerUnresponsive { .. }
                | Self::FullRatchetMessageTimedOut { .. }
                | Self::ReprovisioningRisk { .. }
        )
    }
}

impl fmt::Display for FullRatchetTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncryptedMessageBudget { count } => {
                write!(f, "{count} messages encrypted since the last full ratchet")
            },
            Self::SeedLineageExpired { age } => {
                write!(f, "last full ratchet {}s ago", age.as_secs())
            },
            Self::PeerUnresponsive { count } => {
                write!(f, "{count} messages decrypted since the last full ratchet message")
            },
            Self::FullRatchetMessageTimedOut { elapsed } => {
                write!(f, "last full ratchet message sent {}s ago", elapsed.as_secs())
            },
            Self::ReprovisioningRisk { count } => {
                write!(f, "{count} messages encrypted since the last full ratchet message")
            },
        }
    }
}

/// Decide whether the channel must start (or restart) a full ratchet.
///
/// All thresholds are inclusive: reaching a threshold is enough.
pub fn evaluate(
    record: &ChannelRecord,
    now: Timestamp,
    config: &EngineConfig,
) -> Option<FullRatchetTrigger> {
    match record.full_ratchet_state() {
        FullRatchetState::InProgress => {
            let decrypted = record.number_of_decrypted_messages_since_last_full_ratchet_sent_message;
            if decrypted >= config.max_decrypted_since_full_ratchet_message {
                return Some(FullRatchetTrigger::PeerUnresponsive { count: decrypted });
            }

            let elapsed = now.elapsed_since(record.timestamp_of_last_full_ratchet_sent_message);
            if elapsed >= config.full_ratchet_message_timeout {
                return Some(FullRatchetTrigger::FullRatchetMessageTimedOut { elapsed });
            }

            let encrypted = record.number_of_encrypted_messages_since_last_full_ratchet_sent_message;
            if encrypted >= config.max_encrypted_since_full_ratchet_message {
                return Some(FullRatchetTrigger::ReprovisioningRisk { count: encrypted });
            }

            None
        },
        FullRatchetState::NotInProgress => {
            let encrypted = record.encrypted_messages_since_last_full_ratchet();
            if encrypted >= config.max_encrypted_per_full_ratchet {
                return Some(FullRatchetTrigger::EncryptedMessageBudget { count: encrypted });
            }

            let age = now.elapsed_since(record.timestamp_of_last_full_ratchet);
            if age >= config.full_ratchet_validity {
                return Some(FullRatchetTrigger::SeedLineageExpired { age });
            }

            None
        },
    }
}
