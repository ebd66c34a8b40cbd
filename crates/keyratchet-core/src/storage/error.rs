//! Storage error types.
//!
//! - `Conflict`: optimistic version check failed, the caller must reload and
//!   retry the whole transaction
//! - `Serialization`: failed to encode/decode a record
//! - `Io`: underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A record changed (or appeared, or vanished) since it was read.
    ///
    /// The whole change set was rejected; nothing was written.
    #[error("write conflict on {key}")]
    Conflict {
        /// Human-readable key of the first conflicting record
        key: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// True for optimistic-concurrency failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
