//! Storage abstraction for the channel ratchet.
//!
//! Reads return [`Versioned`] records. Writes are never applied one at a
//! time: the engine builds a [`ChangeSet`] holding every put, delete and
//! check of one logical operation, each carrying the version it read, and
//! [`Storage::commit`] applies the whole set atomically or rejects it with
//! [`StorageError::Conflict`]. This optimistic scheme is what makes the
//! send-seed read-modify-write and the one-time consumption of receive keys
//! safe under concurrent callers.

mod chaotic;
mod error;
mod memory;
mod records;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
use keyratchet_crypto::{CryptoKeyId, Uid};
pub use memory::MemoryStorage;
pub use records::{
    ChannelRecord, KeyMaterialKey, KeyMaterialRecord, ProvisionKey, ProvisionRecord, RecordKey,
    Versioned,
};

pub use self::redb::RedbStorage;
use crate::{ChannelId, Timestamp};

/// How a store resolves concurrent writers to the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Expected versions are enforced; a stale writer is rejected.
    FailOnConflict,
    /// Expected versions are ignored; the last commit silently wins.
    ///
    /// Unsafe for the send seed: two wraps could ratchet the same seed.
    LastWriterWins,
}

/// One write inside a [`ChangeSet`].
///
/// `expected` is the version the caller read; `None` means the record must
/// not exist yet.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Insert or replace a channel record
    PutChannel {
        /// Channel id
        id: ChannelId,
        /// New contents
        record: ChannelRecord,
        /// Version read by the caller
        expected: Option<u64>,
    },
    /// Insert or replace a provision record
    PutProvision {
        /// Provision key
        key: ProvisionKey,
        /// New contents
        record: ProvisionRecord,
        /// Version read by the caller
        expected: Option<u64>,
    },
    /// Insert or replace a key material record
    PutKeyMaterial {
        /// Key material key
        key: KeyMaterialKey,
        /// New contents
        record: KeyMaterialRecord,
        /// Version read by the caller
        expected: Option<u64>,
    },
    /// Remove a record that must still be at `expected`
    Delete {
        /// Record to remove
        key: RecordKey,
        /// Version read by the caller
        expected: u64,
    },
    /// Write nothing, but fail unless the record is still at `expected`
    Check {
        /// Record to verify
        key: RecordKey,
        /// Version read by the caller
        expected: Option<u64>,
    },
}

impl Operation {
    /// Key this operation touches.
    pub fn key(&self) -> RecordKey {
        match self {
            Self::PutChannel { id, .. } => RecordKey::Channel(id.clone()),
            Self::PutProvision { key, .. } => RecordKey::Provision(key.clone()),
            Self::PutKeyMaterial { key, .. } => RecordKey::KeyMaterial(key.clone()),
            Self::Delete { key, .. } | Self::Check { key, .. } => key.clone(),
        }
    }

    /// Version the record must currently have (`None`: must be absent).
    pub fn expected(&self) -> Option<u64> {
        match self {
            Self::PutChannel { expected, .. }
            | Self::PutProvision { expected, .. }
            | Self::PutKeyMaterial { expected, .. }
            | Self::Check { expected, .. } => *expected,
            Self::Delete { expected, .. } => Some(*expected),
        }
    }
}

/// Ordered batch of operations committed atomically.
///
/// A change set should touch each record at most once.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    operations: Vec<Operation>,
}

impl ChangeSet {
    /// Empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a channel write.
    pub fn put_channel(&mut self, id: ChannelId, record: ChannelRecord, expected: Option<u64>) {
        self.operations.push(Operation::PutChannel { id, record, expected });
    }

    /// Queue a provision write.
    pub fn put_provision(
        &mut self,
        key: ProvisionKey,
        record: ProvisionRecord,
        expected: Option<u64>,
    ) {
        self.operations.push(Operation::PutProvision { key, record, expected });
    }

    /// Queue a key material write.
    pub fn put_key_material(
        &mut self,
        key: KeyMaterialKey,
        record: KeyMaterialRecord,
        expected: Option<u64>,
    ) {
        self.operations.push(Operation::PutKeyMaterial { key, record, expected });
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: impl Into<RecordKey>, expected: u64) {
        self.operations.push(Operation::Delete { key: key.into(), expected });
    }

    /// Queue a version check.
    pub fn check(&mut self, key: impl Into<RecordKey>, expected: Option<u64>) {
        self.operations.push(Operation::Check { key: key.into(), expected });
    }

    /// Queued operations, in order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Consume into the queued operations.
    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    /// True if nothing was queued.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

/// Storage abstraction for channels, provisions and key material
///
/// Must be Clone (shared between the engine and background collectors),
/// Send + Sync (thread-safe), and synchronous (no async methods).
/// Implementations typically share internal state via Arc, so clones access
/// the same underlying storage.
///
/// # Invariants
///
/// - Every successful write assigns a version strictly greater than any
///   previously assigned one
/// - Under [`ConflictPolicy::FailOnConflict`], `commit` applies all of a
///   change set or none of it
pub trait Storage: Clone + Send + Sync + 'static {
    /// Conflict policy enforced by `commit`.
    fn conflict_policy(&self) -> ConflictPolicy;

    /// Load one channel record.
    fn load_channel(&self, id: &ChannelId)
    -> Result<Option<Versioned<ChannelRecord>>, StorageError>;

    /// All channel ids, in key order.
    fn list_channels(&self) -> Result<Vec<ChannelId>, StorageError>;

    /// Provisions of a channel, ordered by generation.
    fn load_provisions(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(ProvisionKey, Versioned<ProvisionRecord>)>, StorageError>;

    /// Key materials of a channel, ordered by generation then sequence
    /// number.
    fn load_key_materials(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError>;

    /// Key materials tagged `key_id` on channels whose local device is
    /// `current_device_uid`.
    ///
    /// Returns active and expiring keys alike; expiring keys stay usable
    /// until collected.
    fn find_key_materials(
        &self,
        key_id: &CryptoKeyId,
        current_device_uid: &Uid,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError>;

    /// Key materials whose expiration is strictly before `now`, with their
    /// versions.
    fn expired_key_materials(
        &self,
        now: Timestamp,
    ) -> Result<Vec<(KeyMaterialKey, u64)>, StorageError>;

    /// Apply a change set atomically.
    ///
    /// # Errors
    ///
    /// - `Conflict` if any operation's expected version does not match (only
    ///   under [`ConflictPolicy::FailOnConflict`])
    fn commit(&self, changes: ChangeSet) -> Result<(), StorageError>;
}
