//! Channel engine.
//!
//! [`ChannelEngine`] is the entry point the transport layer talks to. Every
//! operation follows the same shape: load the records it needs at known
//! versions, stage the mutation on a [`Channel`] aggregate, commit the
//! resulting change set in one go, and only then talk to collaborators
//! (event sink, full-ratchet starter). A failed commit leaves no trace and
//! triggers no callback.
//!
//! # Concurrency
//!
//! The engine holds no locks and no caches. Concurrent callers (several
//! engines over clones of one store, or one engine shared across threads)
//! are serialized by the store's version checks:
//!
//! - Two wraps on one channel read the same send seed version; only one
//!   commit succeeds, the other gets `StorageError::Conflict`
//! - Two unwraps consuming the same key both delete it at the version they
//!   read; the loser sees the key gone and moves on to the next candidate

use std::collections::BTreeSet;

use keyratchet_crypto::{
    AuthenticatedEncryptionKey, CryptoError, NONCE_SIZE, Seed, Uid, parse_header, unwrap_key,
};

use crate::{
    ChannelId, Collaborators, CryptoIdentity, EngineConfig, EngineError, Environment, Timestamp,
    channel::{Channel, full_ratchet},
    collaborators::ChannelEvent,
    gc::{GcReport, run_garbage_collection},
    storage::{ChannelRecord, ConflictPolicy, KeyMaterialKey, Storage, StorageError, Versioned},
};

/// A wrapped message key, addressed for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKeyHeader {
    /// Identity owning the receiving device
    pub to_identity: CryptoIdentity,
    /// Receiving device
    pub remote_device_uid: Uid,
    /// `key id ‖ ciphertext`
    pub wrapped_key: Vec<u8>,
}

/// A message key recovered by unwrap, with the channel that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwrappedKey {
    /// The sender's message key
    pub message_key: AuthenticatedEncryptionKey,
    /// Channel whose key material opened the header
    pub channel: ChannelId,
}

/// Forward-secure channel engine over a store and an environment.
#[derive(Clone)]
pub struct ChannelEngine<E: Environment, S: Storage> {
    pub(crate) env: E,
    pub(crate) storage: S,
    pub(crate) config: EngineConfig,
    pub(crate) collaborators: Collaborators,
}

impl<E: Environment, S: Storage> ChannelEngine<E, S> {
    /// Create an engine. Call [`Self::finalize_initialization`] once the
    /// surrounding system is up.
    pub fn new(env: E, storage: S, config: EngineConfig, collaborators: Collaborators) -> Self {
        Self { env, storage, config, collaborators }
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying store.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Start-up hook: collect whatever expired while the process was down.
    pub fn finalize_initialization(&self) -> Result<GcReport, EngineError> {
        let report = self.run_garbage_collection(self.env.now())?;
        tracing::info!(
            key_materials_deleted = report.key_materials_deleted,
            provisions_deleted = report.provisions_deleted,
            "Channel engine initialized"
        );
        Ok(report)
    }

    /// Delete expired key material, then empty provisions.
    pub fn run_garbage_collection(&self, now: Timestamp) -> Result<GcReport, EngineError> {
        Ok(run_garbage_collection(&self.storage, now)?)
    }

    /// Create a channel from a freshly agreed seed.
    ///
    /// # Errors
    ///
    /// - `ChannelAlreadyExists` if a channel with this id exists
    /// - `Crypto(UnsupportedSuite)` if the suite is unknown; nothing is
    ///   stored
    pub fn create_channel(
        &self,
        id: ChannelId,
        seed: &Seed,
        crypto_suite_version: u32,
    ) -> Result<(), EngineError> {
        if self.storage.load_channel(&id)?.is_some() {
            return Err(EngineError::ChannelAlreadyExists(id));
        }

        let channel = Channel::create(
            id.clone(),
            seed,
            crypto_suite_version,
            self.env.now(),
            self.config.receive_window,
        )
        .inspect_err(|e| {
            tracing::warn!(channel = %id, error = %e, "Refusing to create channel");
        })?;

        match self.storage.commit(channel.change_set()) {
            Ok(()) => {},
            Err(e) if e.is_conflict() => return Err(EngineError::ChannelAlreadyExists(id)),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            channel = %id,
            suite = crypto_suite_version,
            receive_window = self.config.receive_window,
            "Channel created"
        );
        self.after_commit(&channel, false);
        Ok(())
    }

    /// Create a channel with a device of a contact or another device of the
    /// owned identity.
    ///
    /// # Errors
    ///
    /// - `NotAllowed` if the remote device is unknown to the directory, the
    ///   contact is inactive, or `remote_identity` is neither a contact nor
    ///   `owned`
    pub fn create_channel_with_device(
        &self,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
        remote_device_uid: Uid,
        seed: &Seed,
        crypto_suite_version: u32,
    ) -> Result<ChannelId, EngineError> {
        let directory = &self.collaborators.directory;
        let current_device_uid = directory.current_device_uid(owned)?;

        if directory.is_contact_of(remote_identity, owned)? {
            if !directory.device_uids_of_contact(remote_identity, owned)?.contains(&remote_device_uid) {
                return Err(not_allowed("remote device is not a device of the contact"));
            }
            if !directory.is_contact_active(owned, remote_identity)? {
                return Err(not_allowed("contact is not active"));
            }
        } else if remote_identity == owned {
            if !directory.other_device_uids_of_owned_identity(owned)?.contains(&remote_device_uid) {
                return Err(not_allowed("remote device is not another device of the owned identity"));
            }
        } else {
            return Err(not_allowed("remote identity is neither a contact nor the owned identity"));
        }

        let id = ChannelId::new(current_device_uid, remote_identity.clone(), remote_device_uid);
        self.create_channel(id.clone(), seed, crypto_suite_version)?;
        Ok(id)
    }

    /// Mark a channel confirmed. Idempotent; the event is posted only on
    /// the transition.
    pub fn confirm_channel(&self, id: &ChannelId) -> Result<(), EngineError> {
        let mut channel = self.load_record(id)?;
        if !channel.confirm() {
            return Ok(());
        }
        self.storage.commit(channel.change_set())?;
        tracing::info!(channel = %id, "Channel confirmed");
        self.after_commit(&channel, true);
        Ok(())
    }

    /// Delete a channel with its provisions and key material.
    ///
    /// Returns false if there was no such channel.
    pub fn delete_channel(&self, id: &ChannelId) -> Result<bool, EngineError> {
        let Some(mut channel) = Channel::load(&self.storage, id)? else {
            return Ok(false);
        };
        let was_confirmed = channel.record().is_confirmed;

        channel.delete();
        self.storage.commit(channel.change_set())?;

        tracing::info!(channel = %id, was_confirmed, "Channel deleted");
        if was_confirmed {
            self.collaborators.events.post(ChannelEvent::DeletedConfirmedChannel(id.clone()));
        }
        Ok(true)
    }

    /// Delete every channel between the current device of `owned` and any
    /// device of `remote_identity`. Returns how many were deleted.
    pub fn delete_all_channels_with(
        &self,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
    ) -> Result<usize, EngineError> {
        let current_device_uid = self.collaborators.directory.current_device_uid(owned)?;

        let mut deleted = 0;
        for id in self.storage.list_channels()? {
            if id.current_device_uid == current_device_uid
                && &id.remote_identity == remote_identity
                && self.delete_channel(&id)?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Ratchet the send seed and wrap `message_key` for the remote device.
    ///
    /// # Errors
    ///
    /// - `UnsafeConflictPolicy` if the store could merge concurrent wraps
    /// - `Storage(Conflict)` if a concurrent wrap won; nothing was consumed
    pub fn wrap(
        &self,
        id: &ChannelId,
        message_key: &AuthenticatedEncryptionKey,
    ) -> Result<WrappedKeyHeader, EngineError> {
        self.ensure_fail_on_conflict()?;

        let mut channel = self.load_record(id)?;
        let mut nonce = [0u8; NONCE_SIZE];
        self.env.random_bytes(&mut nonce);

        let wrapped_key = channel.wrap(message_key, nonce)?;
        self.storage.commit(channel.change_set())?;

        tracing::debug!(
            channel = %id,
            encrypted = channel.record().number_of_encrypted_messages,
            "Wrapped message key"
        );
        self.after_commit(&channel, false);

        Ok(WrappedKeyHeader {
            to_identity: id.remote_identity.clone(),
            remote_device_uid: id.remote_device_uid,
            wrapped_key,
        })
    }

    /// Recover a message key from a header, consuming the key material that
    /// opens it.
    ///
    /// Returns `Ok(None)` for malformed headers and headers no local key
    /// opens; the caller may try other channel types.
    ///
    /// # Errors
    ///
    /// - `UnsafeConflictPolicy` if the store could let a key be consumed
    ///   twice
    /// - `Storage(Conflict)` if a concurrent transaction touched the channel
    ///   while the key was still present; the caller may retry
    pub fn unwrap(
        &self,
        header: &[u8],
        current_device_uid: &Uid,
    ) -> Result<Option<UnwrappedKey>, EngineError> {
        self.ensure_fail_on_conflict()?;

        let (key_id, ciphertext) = match parse_header(header) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed wrapped key header");
                return Ok(None);
            },
        };

        let candidates = self.storage.find_key_materials(&key_id, current_device_uid)?;
        tracing::debug!(key_id = %key_id.to_hex(), candidates = candidates.len(), "Unwrapping");

        for (key, material) in candidates {
            let message_key = match unwrap_key(ciphertext, &material.record.key) {
                Ok(message_key) => message_key,
                Err(CryptoError::MalformedKey { reason }) => {
                    tracing::warn!(
                        channel = %key.channel,
                        key_id = %key_id.to_hex(),
                        reason,
                        "Authentic header carries a malformed message key"
                    );
                    return Ok(None);
                },
                Err(_) => continue,
            };

            if let Some((channel, newly_confirmed)) = self.consume(&key, material.version)? {
                tracing::debug!(
                    channel = %key.channel,
                    generation = key.full_ratcheting_count,
                    sequence = key.self_ratcheting_count,
                    "Consumed key material"
                );
                self.after_commit(&channel, newly_confirmed);
                return Ok(Some(UnwrappedKey { message_key, channel: key.channel }));
            }
        }

        tracing::warn!(key_id = %key_id.to_hex(), "No local key material opens the header");
        Ok(None)
    }

    /// [`Self::unwrap`] for the current device of an owned identity.
    pub fn unwrap_for_owned_identity(
        &self,
        header: &[u8],
        owned: &CryptoIdentity,
    ) -> Result<Option<UnwrappedKey>, EngineError> {
        let current_device_uid = self.collaborators.directory.current_device_uid(owned)?;
        self.unwrap(header, &current_device_uid)
    }

    /// True if the channel must start (or restart) a full ratchet now.
    pub fn requires_full_ratchet(&self, id: &ChannelId) -> Result<bool, EngineError> {
        let record = self.load_channel_record(id)?;
        Ok(full_ratchet::evaluate(&record.record, self.env.now(), &self.config).is_some())
    }

    /// Record that a full-ratchet protocol message for this channel was just
    /// sent, entering (or re-entering) the in-progress state.
    pub fn notify_full_ratchet_message_sent(&self, id: &ChannelId) -> Result<(), EngineError> {
        let mut channel = self.load_record(id)?;
        channel.mark_full_ratchet_message_sent(self.env.now());
        self.storage.commit(channel.change_set())?;

        tracing::info!(channel = %id, "Full ratchet message sent");
        self.after_commit(&channel, false);
        Ok(())
    }

    /// Install the send seed a completed full ratchet produced.
    pub fn update_send_seed(&self, id: &ChannelId, seed: &Seed) -> Result<(), EngineError> {
        self.ensure_fail_on_conflict()?;

        let mut channel = self.load_record(id)?;
        channel.update_send_seed(seed, self.env.now())?;
        self.storage.commit(channel.change_set())?;

        tracing::info!(
            channel = %id,
            encrypted = channel.record().number_of_encrypted_messages,
            "Send seed updated by full ratchet"
        );
        self.after_commit(&channel, false);
        Ok(())
    }

    /// Provision a new receive generation from a full-ratchet seed.
    ///
    /// Returns the new generation.
    pub fn create_new_provision(&self, id: &ChannelId, seed: &Seed) -> Result<u32, EngineError> {
        let mut channel = self.load_record(id)?;
        let generation = channel.create_new_provision(seed, self.config.receive_window)?;
        self.storage.commit(channel.change_set())?;

        tracing::info!(channel = %id, generation, "New provision created");
        self.after_commit(&channel, false);
        Ok(generation)
    }

    /// True if the channel exists.
    pub fn channel_exists(&self, id: &ChannelId) -> Result<bool, EngineError> {
        Ok(self.storage.load_channel(id)?.is_some())
    }

    /// True if the channel exists and is confirmed.
    pub fn confirmed_channel_exists(&self, id: &ChannelId) -> Result<bool, EngineError> {
        Ok(self.storage.load_channel(id)?.is_some_and(|channel| channel.record.is_confirmed))
    }

    /// Remote devices of `remote_identity` with a confirmed channel from the
    /// current device of `owned`.
    pub fn confirmed_remote_devices(
        &self,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
    ) -> Result<Vec<Uid>, EngineError> {
        let current_device_uid = self.collaborators.directory.current_device_uid(owned)?;
        Ok(self
            .confirmed_channels_from(&current_device_uid)?
            .into_iter()
            .filter(|id| &id.remote_identity == remote_identity)
            .map(|id| id.remote_device_uid)
            .collect())
    }

    /// Remote identities, other than `owned` itself, with at least one
    /// confirmed channel from the current device of `owned`.
    pub fn remote_identities_with_confirmed_channels(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<BTreeSet<CryptoIdentity>, EngineError> {
        let current_device_uid = self.collaborators.directory.current_device_uid(owned)?;
        Ok(self
            .confirmed_channels_from(&current_device_uid)?
            .into_iter()
            .map(|id| id.remote_identity)
            .filter(|identity| identity != owned)
            .collect())
    }

    /// Every channel id in the store.
    pub fn all_channel_ids(&self) -> Result<Vec<ChannelId>, EngineError> {
        Ok(self.storage.list_channels()?)
    }

    pub(crate) fn confirmed_channels_from(
        &self,
        current_device_uid: &Uid,
    ) -> Result<Vec<ChannelId>, StorageError> {
        let mut confirmed = Vec::new();
        for id in self.storage.list_channels()? {
            if &id.current_device_uid != current_device_uid {
                continue;
            }
            if self.storage.load_channel(&id)?.is_some_and(|channel| channel.record.is_confirmed) {
                confirmed.push(id);
            }
        }
        Ok(confirmed)
    }

    /// Stage and commit the consumption of one key material.
    ///
    /// Returns `None` if the key is already gone (consumed by a concurrent
    /// unwrap, or its channel deleted).
    fn consume(
        &self,
        key: &KeyMaterialKey,
        version: u64,
    ) -> Result<Option<(Channel, bool)>, EngineError> {
        let Some(mut channel) = Channel::load(&self.storage, &key.channel)? else {
            return Ok(None);
        };
        if channel.key_material_version(key) != Some(version) {
            return Ok(None);
        }

        let newly_confirmed = channel.consume(
            key,
            self.env.now(),
            self.config.expiration_grace_period,
            self.config.receive_window,
        )?;

        match self.storage.commit(channel.change_set()) {
            Ok(()) => Ok(Some((channel, newly_confirmed))),
            Err(e) if e.is_conflict() && !self.key_material_present(key, version)? => {
                tracing::debug!(channel = %key.channel, "Key material consumed concurrently");
                Ok(None)
            },
            Err(e) => Err(e.into()),
        }
    }

    fn key_material_present(&self, key: &KeyMaterialKey, version: u64) -> Result<bool, EngineError> {
        Ok(self
            .storage
            .load_key_materials(&key.channel)?
            .iter()
            .any(|(stored, material)| stored == key && material.version == version))
    }

    /// Collaborator calls owed after a successful commit.
    fn after_commit(&self, channel: &Channel, newly_confirmed: bool) {
        if newly_confirmed {
            self.collaborators.events.post(ChannelEvent::NewConfirmedChannel(channel.id().clone()));
        }
        self.start_full_ratchet_if_required(channel.id(), channel.record());
    }

    fn start_full_ratchet_if_required(&self, id: &ChannelId, record: &ChannelRecord) {
        let Some(trigger) = full_ratchet::evaluate(record, self.env.now(), &self.config) else {
            return;
        };

        tracing::info!(channel = %id, %trigger, restart = trigger.is_restart(), "Full ratchet required");
        if let Err(e) = self.collaborators.full_ratchet_starter.start_full_ratchet(id) {
            tracing::error!(channel = %id, error = %e, "Failed to start full ratchet");
        }
    }

    fn ensure_fail_on_conflict(&self) -> Result<(), EngineError> {
        match self.storage.conflict_policy() {
            ConflictPolicy::FailOnConflict => Ok(()),
            policy => {
                tracing::error!(
                    ?policy,
                    "Refusing to ratchet: store does not reject conflicting writes"
                );
                Err(EngineError::UnsafeConflictPolicy)
            },
        }
    }

    fn load_channel_record(&self, id: &ChannelId) -> Result<Versioned<ChannelRecord>, EngineError> {
        self.storage.load_channel(id)?.ok_or_else(|| EngineError::ChannelNotFound(id.clone()))
    }

    /// Aggregate holding only the channel record.
    fn load_record(&self, id: &ChannelId) -> Result<Channel, EngineError> {
        Ok(Channel::from_record(id.clone(), self.load_channel_record(id)?))
    }
}

fn not_allowed(reason: &str) -> EngineError {
    tracing::warn!(reason, "Channel creation not allowed");
    EngineError::NotAllowed { reason: reason.to_string() }
}
