//! External collaborators of the engine.
//!
//! The engine never reaches for process-wide state: the identity directory,
//! the event sink and the full-ratchet starter are handed to
//! [`crate::ChannelEngine::new`] as trait objects.

use std::sync::Arc;

use keyratchet_crypto::Uid;
use thiserror::Error;

use crate::{ChannelId, CryptoIdentity};

/// Failure reported by the identity directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The identity is not an owned identity of this installation
    #[error("unknown owned identity {0:?}")]
    UnknownOwnedIdentity(CryptoIdentity),

    /// The identity is not a contact of the owned identity
    #[error("unknown contact {0:?}")]
    UnknownContact(CryptoIdentity),

    /// The directory could not answer
    #[error("identity directory unavailable: {0}")]
    Unavailable(String),
}

/// Device and identity lookups.
pub trait IdentityDirectory: Send + Sync {
    /// Uid of the local device of an owned identity.
    fn current_device_uid(&self, owned: &CryptoIdentity) -> Result<Uid, DirectoryError>;

    /// True if `identity` is owned by this installation.
    fn is_owned(&self, identity: &CryptoIdentity) -> Result<bool, DirectoryError>;

    /// All device uids of an owned identity, the current one included.
    fn device_uids_of_owned_identity(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<Vec<Uid>, DirectoryError>;

    /// Device uids of an owned identity, the current one excluded.
    fn other_device_uids_of_owned_identity(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<Vec<Uid>, DirectoryError>;

    /// Device uids of a contact of `owned`.
    fn device_uids_of_contact(
        &self,
        contact: &CryptoIdentity,
        owned: &CryptoIdentity,
    ) -> Result<Vec<Uid>, DirectoryError>;

    /// True if `contact` is a contact of `owned`.
    fn is_contact_of(
        &self,
        contact: &CryptoIdentity,
        owned: &CryptoIdentity,
    ) -> Result<bool, DirectoryError>;

    /// True if the contact is active (not revoked or blocked).
    fn is_contact_active(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<bool, DirectoryError>;
}

/// Channel lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel became confirmed
    NewConfirmedChannel(ChannelId),
    /// A confirmed channel was deleted
    DeletedConfirmedChannel(ChannelId),
}

/// Receives [`ChannelEvent`]s, only after the transition committed.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn post(&self, event: ChannelEvent);
}

/// Failure to start a full-ratchet renegotiation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("could not start full ratchet: {0}")]
pub struct StarterError(pub String);

/// Starts the out-of-band renegotiation of fresh seed material.
///
/// Called after the transaction that made the channel require a full ratchet
/// has committed. Implementations are expected to hand the work off (spawn,
/// enqueue) rather than run the protocol inline. Errors are logged, never
/// retried by the engine.
pub trait FullRatchetStarter: Send + Sync {
    /// Start (or restart) the full ratchet of a channel.
    fn start_full_ratchet(&self, channel: &ChannelId) -> Result<(), StarterError>;
}

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    /// Device and identity lookups
    pub directory: Arc<dyn IdentityDirectory>,
    /// Lifecycle notifications
    pub events: Arc<dyn EventSink>,
    /// Full-ratchet protocol starter
    pub full_ratchet_starter: Arc<dyn FullRatchetStarter>,
}

impl Collaborators {
    /// Bundle the three collaborators.
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        events: Arc<dyn EventSink>,
        full_ratchet_starter: Arc<dyn FullRatchetStarter>,
    ) -> Self {
        Self { directory, events, full_ratchet_starter }
    }
}
