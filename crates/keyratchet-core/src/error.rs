//! Engine error types.

use keyratchet_crypto::CryptoError;
use thiserror::Error;

use crate::{ChannelId, collaborators::DirectoryError, storage::StorageError};

/// Errors returned by [`crate::ChannelEngine`] operations.
///
/// "Nothing to decrypt" is not an error: unwrap returns `Ok(None)` for
/// malformed headers and for headers no local key opens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Storage failure. `StorageError::Conflict` means a concurrent writer
    /// won; the caller may retry the whole operation.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Seed derivation failed, typically an unsupported crypto suite
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Identity directory lookup failed
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// No channel with this id
    #[error("no channel {0}")]
    ChannelNotFound(ChannelId),

    /// A channel with this id already exists
    #[error("channel {0} already exists")]
    ChannelAlreadyExists(ChannelId),

    /// The store may merge concurrent writers; wrapping would risk reusing
    /// a send key
    #[error("refusing to ratchet: store does not fail on conflicting writes")]
    UnsafeConflictPolicy,

    /// The directory does not allow this operation
    #[error("not allowed: {reason}")]
    NotAllowed {
        /// What the directory rejected
        reason: String,
    },

    /// The message asks for a channel type this engine does not serve
    #[error("wrong channel type for the channel engine")]
    WrongChannelType,
}

impl EngineError {
    /// True if a concurrent writer caused the failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_conflict())
    }
}
