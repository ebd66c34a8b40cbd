//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations to check that the engine
//! never leaves a channel half-written: every injected failure happens
//! before the inner store is touched, so the inner store must stay
//! consistent whatever the failure pattern.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use keyratchet_crypto::{CryptoKeyId, Uid};

use super::{
    ChangeSet, ChannelRecord, ConflictPolicy, KeyMaterialKey, KeyMaterialRecord, ProvisionKey,
    ProvisionRecord, Storage, StorageError, Versioned,
};
use crate::{ChannelId, Timestamp};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but randomly fails
/// reads and commits based on a configured failure rate. Injected failures
/// are `Io` errors, or `Conflict` errors on commit when conflict injection
/// is enabled. Clones share the RNG and counters.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// Report injected commit failures as conflicts instead of I/O errors
    inject_conflicts: bool,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operations attempted
    operation_count: Arc<AtomicUsize>,
    /// Operations failed by injection
    injected_failures: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator, so chaos runs are reproducible from the
/// seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            inject_conflicts: false,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            injected_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report injected commit failures as `Conflict` (what a racing writer
    /// would cause) rather than `Io`.
    #[must_use]
    pub fn with_injected_conflicts(mut self) -> Self {
        self.inject_conflicts = true;
        self
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Number of operations failed by injection.
    pub fn injected_failures(&self) -> usize {
        self.injected_failures.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether it fails.
    fn roll(&self) -> bool {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        #[allow(clippy::expect_used)]
        let fail = self.rng.lock().expect("ChaoticRng mutex poisoned").next() < self.failure_rate;
        if fail {
            self.injected_failures.fetch_add(1, Ordering::Relaxed);
        }
        fail
    }

    fn injected_read_failure<T>(&self) -> Result<T, StorageError> {
        Err(StorageError::Io("chaotic failure injection".to_string()))
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn conflict_policy(&self) -> ConflictPolicy {
        self.inner.conflict_policy()
    }

    fn load_channel(
        &self,
        id: &ChannelId,
    ) -> Result<Option<Versioned<ChannelRecord>>, StorageError> {
        if self.roll() {
            return self.injected_read_failure();
        }
        self.inner.load_channel(id)
    }

    fn list_channels(&self) -> Result<Vec<ChannelId>, StorageError> {
        if self.roll() {
            return self.injected_read_failure();
        }
        self.inner.list_channels()
    }

    fn load_provisions(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(ProvisionKey, Versioned<ProvisionRecord>)>, StorageError> {
        if self.roll() {
            return self.injected_read_failure();
        }
        self.inner.load_provisions(channel)
    }

    fn load_key_materials(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError> {
        if self.roll() {
            return self.injected_read_failure();
        }
        self.inner.load_key_materials(channel)
    }

    fn find_key_materials(
        &self,
        key_id: &CryptoKeyId,
        current_device_uid: &Uid,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError> {
        if self.roll() {
            return self.injected_read_failure();
        }
        self.inner.find_key_materials(key_id, current_device_uid)
    }

    fn expired_key_materials(
        &self,
        now: Timestamp,
    ) -> Result<Vec<(KeyMaterialKey, u64)>, StorageError> {
        if self.roll() {
            return self.injected_read_failure();
        }
        self.inner.expired_key_materials(now)
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), StorageError> {
        if self.roll() {
            if self.inject_conflicts {
                let key = changes
                    .operations()
                    .first()
                    .map_or_else(|| "empty change set".to_string(), |op| op.key().to_string());
                return Err(StorageError::Conflict { key });
            }
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        self.inner.commit(changes)
    }
}

#[cfg(test)]
mod tests {
    use keyratchet_crypto::Seed;

    use super::*;
    use crate::{CryptoIdentity, storage::MemoryStorage};

    fn put_channel(byte: u8) -> ChangeSet {
        let id = ChannelId::new(
            Uid::from_bytes([byte; 32]),
            CryptoIdentity::new(vec![byte]),
            Uid::from_bytes([0; 32]),
        );
        let record = ChannelRecord {
            is_confirmed: false,
            crypto_suite_version: 0,
            seed_for_next_send_key: Seed::from_bytes([byte; 32]),
            number_of_encrypted_messages: 0,
            number_of_encrypted_messages_at_last_full_ratchet: 0,
            number_of_decrypted_messages_since_last_full_ratchet_sent_message: 0,
            number_of_encrypted_messages_since_last_full_ratchet_sent_message: 0,
            timestamp_of_last_full_ratchet: Timestamp::from_secs(0),
            timestamp_of_last_full_ratchet_sent_message: Timestamp::from_secs(0),
            full_ratchet_in_progress: false,
            full_ratcheting_count_of_last_provision: 0,
        };
        let mut changes = ChangeSet::new();
        changes.put_channel(id, record, None);
        changes
    }

    #[test]
    fn test_chaotic_with_zero_failure_rate() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 0.0);

        for i in 0..100 {
            chaotic.commit(put_channel(i)).expect("should not fail with 0% rate");
        }

        assert_eq!(chaotic.list_channels().unwrap().len(), 100);
        assert_eq!(chaotic.injected_failures(), 0);
        assert_eq!(chaotic.operation_count(), 101);
    }

    #[test]
    fn test_chaotic_with_100_failure_rate() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.0);

        assert!(chaotic.commit(put_channel(1)).is_err());
        assert!(chaotic.list_channels().is_err());
        assert_eq!(chaotic.inner().channel_count(), 0, "failed commit reached the inner store");
    }

    #[test]
    fn test_chaotic_deterministic_with_seed() {
        let chaotic1 = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 42);
        let chaotic2 = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 42);

        for i in 0..100 {
            let result1 = chaotic1.commit(put_channel(i));
            let result2 = chaotic2.commit(put_channel(i));

            assert_eq!(result1.is_ok(), result2.is_ok(), "determinism violated at iteration {i}");
        }
    }

    #[test]
    fn test_injected_conflicts() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.0).with_injected_conflicts();

        assert!(chaotic.commit(put_channel(1)).unwrap_err().is_conflict());
        // Reads still fail as I/O
        assert!(matches!(chaotic.list_channels(), Err(StorageError::Io(_))));
    }

    #[test]
    fn test_policy_is_delegated() {
        let chaotic =
            ChaoticStorage::new(MemoryStorage::with_policy(ConflictPolicy::LastWriterWins), 0.0);
        assert_eq!(chaotic.conflict_policy(), ConflictPolicy::LastWriterWins);
    }

    #[test]
    #[should_panic(expected = "failure_rate must be between 0.0 and 1.0")]
    fn test_chaotic_rejects_invalid_failure_rate() {
        let _chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.5);
    }
}
