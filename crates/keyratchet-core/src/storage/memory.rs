#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use keyratchet_crypto::{CryptoKeyId, Uid};

use super::{
    ChangeSet, ChannelRecord, ConflictPolicy, KeyMaterialKey, KeyMaterialRecord, Operation,
    ProvisionKey, ProvisionRecord, RecordKey, Storage, StorageError, Versioned,
};
use crate::{ChannelId, Timestamp};

/// In-memory storage implementation for testing and simulation
///
/// Ordered maps keyed by channel id (then generation, then sequence number)
/// so per-channel loads are range scans. All state is wrapped in
/// Arc<Mutex<>> to allow Clone and concurrent access; a commit holds the
/// lock for its whole validate-then-apply pass, which is what makes it
/// atomic. Uses `lock().expect()`, which panics if the mutex is poisoned -
/// acceptable for test code.
///
/// The conflict policy is configurable so tests can exercise the fail-closed
/// wrap path against a last-writer-wins store.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
    policy: ConflictPolicy,
}

#[derive(Default)]
struct MemoryStorageInner {
    channels: BTreeMap<ChannelId, Versioned<ChannelRecord>>,
    provisions: BTreeMap<ProvisionKey, Versioned<ProvisionRecord>>,
    key_materials: BTreeMap<KeyMaterialKey, Versioned<KeyMaterialRecord>>,

    /// Last version handed out
    last_version: u64,
}

impl MemoryStorageInner {
    fn current_version(&self, key: &RecordKey) -> Option<u64> {
        match key {
            RecordKey::Channel(id) => self.channels.get(id).map(|v| v.version),
            RecordKey::Provision(key) => self.provisions.get(key).map(|v| v.version),
            RecordKey::KeyMaterial(key) => self.key_materials.get(key).map(|v| v.version),
        }
    }

    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn apply(&mut self, operation: Operation) {
        match operation {
            Operation::PutChannel { id, record, .. } => {
                let version = self.next_version();
                self.channels.insert(id, Versioned { version, record });
            },
            Operation::PutProvision { key, record, .. } => {
                let version = self.next_version();
                self.provisions.insert(key, Versioned { version, record });
            },
            Operation::PutKeyMaterial { key, record, .. } => {
                let version = self.next_version();
                self.key_materials.insert(key, Versioned { version, record });
            },
            Operation::Delete { key: RecordKey::Channel(id), .. } => {
                self.channels.remove(&id);
            },
            Operation::Delete { key: RecordKey::Provision(key), .. } => {
                self.provisions.remove(&key);
            },
            Operation::Delete { key: RecordKey::KeyMaterial(key), .. } => {
                self.key_materials.remove(&key);
            },
            Operation::Check { .. } => {},
        }
    }
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage` enforcing expected versions
    pub fn new() -> Self {
        Self::with_policy(ConflictPolicy::FailOnConflict)
    }

    /// Create a new empty `MemoryStorage` with an explicit conflict policy
    pub fn with_policy(policy: ConflictPolicy) -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())), policy }
    }

    /// Number of stored channels.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn channel_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").channels.len()
    }

    /// Number of stored provisions across all channels.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn provision_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").provisions.len()
    }

    /// Number of stored key materials across all channels.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn key_material_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").key_materials.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn provision_range(channel: &ChannelId) -> std::ops::RangeInclusive<ProvisionKey> {
    ProvisionKey { channel: channel.clone(), full_ratcheting_count: 0 }
        ..=ProvisionKey { channel: channel.clone(), full_ratcheting_count: u32::MAX }
}

fn key_material_range(channel: &ChannelId) -> std::ops::RangeInclusive<KeyMaterialKey> {
    KeyMaterialKey { channel: channel.clone(), full_ratcheting_count: 0, self_ratcheting_count: 0 }
        ..=KeyMaterialKey {
            channel: channel.clone(),
            full_ratcheting_count: u32::MAX,
            self_ratcheting_count: u32::MAX,
        }
}

impl Storage for MemoryStorage {
    fn conflict_policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn load_channel(
        &self,
        id: &ChannelId,
    ) -> Result<Option<Versioned<ChannelRecord>>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").channels.get(id).cloned())
    }

    #[allow(clippy::expect_used)]
    fn list_channels(&self) -> Result<Vec<ChannelId>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").channels.keys().cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn load_provisions(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(ProvisionKey, Versioned<ProvisionRecord>)>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .provisions
            .range(provision_range(channel))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    #[allow(clippy::expect_used)]
    fn load_key_materials(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .key_materials
            .range(key_material_range(channel))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    /// Linear scan; the redb backend keeps a secondary index instead.
    #[allow(clippy::expect_used)]
    fn find_key_materials(
        &self,
        key_id: &CryptoKeyId,
        current_device_uid: &Uid,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .key_materials
            .iter()
            .filter(|(key, value)| {
                key.channel.current_device_uid == *current_device_uid
                    && value.record.key_id == *key_id
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    #[allow(clippy::expect_used)]
    fn expired_key_materials(
        &self,
        now: Timestamp,
    ) -> Result<Vec<(KeyMaterialKey, u64)>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .key_materials
            .iter()
            .filter(|(_, value)| value.record.expiration.is_some_and(|at| at < now))
            .map(|(key, value)| (key.clone(), value.version))
            .collect())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn commit(&self, changes: ChangeSet) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        if self.policy == ConflictPolicy::FailOnConflict {
            for operation in changes.operations() {
                let key = operation.key();
                if inner.current_version(&key) != operation.expected() {
                    return Err(StorageError::Conflict { key: key.to_string() });
                }
            }
        }

        for operation in changes.into_operations() {
            inner.apply(operation);
        }

        Ok(())
    }
}
