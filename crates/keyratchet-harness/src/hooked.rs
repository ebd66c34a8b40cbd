//! Storage wrapper that runs a callback at a chosen read.
//!
//! Threads make races likely, not certain. [`HookedStorage`] makes them
//! certain: arm it with a read and a callback, and the next time that read
//! returns, the callback runs before the caller sees the result. The
//! callback typically drives another engine over the same store, so the
//! caller continues with data that has just gone stale.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::sync::{Arc, Mutex, PoisonError};

use keyratchet_core::{
    ChannelId, Timestamp,
    storage::{
        ChangeSet, ChannelRecord, ConflictPolicy, KeyMaterialKey, KeyMaterialRecord,
        ProvisionKey, ProvisionRecord, Storage, StorageError, Versioned,
    },
};
use keyratchet_crypto::{CryptoKeyId, Uid};

/// Read after which an armed hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPoint {
    /// [`Storage::load_channel`]
    LoadChannel,
    /// [`Storage::load_provisions`]
    LoadProvisions,
    /// [`Storage::load_key_materials`]
    LoadKeyMaterials,
    /// [`Storage::find_key_materials`]
    FindKeyMaterials,
}

type Hook = Box<dyn FnOnce() + Send>;

/// Wrapper around a store that fires a one-shot hook after a read.
#[derive(Clone)]
pub struct HookedStorage<S: Storage> {
    inner: S,
    hook: Arc<Mutex<Option<(ReadPoint, Hook)>>>,
}

impl<S: Storage> HookedStorage<S> {
    /// Wrap `inner` with no hook armed.
    pub fn new(inner: S) -> Self {
        Self { inner, hook: Arc::new(Mutex::new(None)) }
    }

    /// Run `hook` once, right after the next `point` read returns from the
    /// wrapped store. Replaces any hook still armed.
    ///
    /// The hook is disarmed before it runs, so it may use this store.
    pub fn arm(&self, point: ReadPoint, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some((point, Box::new(hook)));
    }

    /// True if a hook is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.hook.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn fire(&self, point: ReadPoint) {
        let hook = {
            let mut armed = self.hook.lock().unwrap_or_else(PoisonError::into_inner);
            match armed.take() {
                Some((at, hook)) if at == point => Some(hook),
                other => {
                    *armed = other;
                    None
                },
            }
        };
        if let Some(hook) = hook {
            tracing::debug!(?point, "Storage hook firing");
            hook();
        }
    }
}

impl<S: Storage> Storage for HookedStorage<S> {
    fn conflict_policy(&self) -> ConflictPolicy {
        self.inner.conflict_policy()
    }

    fn load_channel(
        &self,
        id: &ChannelId,
    ) -> Result<Option<Versioned<ChannelRecord>>, StorageError> {
        let result = self.inner.load_channel(id);
        self.fire(ReadPoint::LoadChannel);
        result
    }

    fn list_channels(&self) -> Result<Vec<ChannelId>, StorageError> {
        self.inner.list_channels()
    }

    fn load_provisions(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(ProvisionKey, Versioned<ProvisionRecord>)>, StorageError> {
        let result = self.inner.load_provisions(channel);
        self.fire(ReadPoint::LoadProvisions);
        result
    }

    fn load_key_materials(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError> {
        let result = self.inner.load_key_materials(channel);
        self.fire(ReadPoint::LoadKeyMaterials);
        result
    }

    fn find_key_materials(
        &self,
        key_id: &CryptoKeyId,
        current_device_uid: &Uid,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError> {
        let result = self.inner.find_key_materials(key_id, current_device_uid);
        self.fire(ReadPoint::FindKeyMaterials);
        result
    }

    fn expired_key_materials(
        &self,
        now: Timestamp,
    ) -> Result<Vec<(KeyMaterialKey, u64)>, StorageError> {
        self.inner.expired_key_materials(now)
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), StorageError> {
        self.inner.commit(changes)
    }
}
