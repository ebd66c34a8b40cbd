//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Redb
//! serializes write transactions, so a change set is validated and applied
//! inside a single write transaction and either commits whole or is dropped
//! (aborted) on the first version mismatch.

use std::{path::Path, sync::Arc};

use keyratchet_crypto::{CryptoKeyId, UID_SIZE, Uid};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{
    ChangeSet, ChannelRecord, ConflictPolicy, KeyMaterialKey, KeyMaterialRecord, Operation,
    ProvisionKey, ProvisionRecord, RecordKey, Storage, StorageError, Versioned,
};
use crate::{ChannelId, CryptoIdentity, Timestamp};

/// Table: channels
/// Key: encoded channel id (see [`encode_channel_key`])
/// Value: CBOR-encoded `Versioned<ChannelRecord>`
const CHANNELS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("channels");

/// Table: provisions
/// Key: channel key ‖ full_ratcheting_count (4 bytes BE)
/// Value: CBOR-encoded `Versioned<ProvisionRecord>`
const PROVISIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("provisions");

/// Table: key_materials
/// Key: provision key ‖ self_ratcheting_count (4 bytes BE)
/// Value: CBOR-encoded `Versioned<KeyMaterialRecord>`
const KEY_MATERIALS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("key_materials");

/// Table: key_id_index
/// Key: key id (8 bytes) ‖ key material key
/// Value: empty
///
/// The key material key starts with the current device uid, so a lookup by
/// `(key id, current device)` is a single prefix scan.
const KEY_ID_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("key_id_index");

/// Table: meta
/// Key: name
/// Value: last assigned record version (8 bytes BE)
const META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

const LAST_VERSION: &[u8] = b"last_version";

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
/// Always enforces expected versions.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

fn io_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

fn encode_value<T: Serialize>(value: &Versioned<T>) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<Versioned<T>, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn read<T, R>(table: &R, key: &[u8]) -> Result<Option<Versioned<T>>, StorageError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table.get(key).map_err(io_err)? {
        Some(value) => Ok(Some(decode_value(value.value())?)),
        None => Ok(None),
    }
}

/// All `(key, value)` pairs whose key starts with `prefix`, in key order.
fn scan_prefix<R>(table: &R, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>
where
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut entries = Vec::new();
    for result in table.range(prefix..).map_err(io_err)? {
        let (key, value) = result.map_err(io_err)?;
        if !key.value().starts_with(prefix) {
            break;
        }
        entries.push((key.value().to_vec(), value.value().to_vec()));
    }
    Ok(entries)
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        let txn = db.begin_write().map_err(io_err)?;
        {
            let _ = txn.open_table(CHANNELS).map_err(io_err)?;
            let _ = txn.open_table(PROVISIONS).map_err(io_err)?;
            let _ = txn.open_table(KEY_MATERIALS).map_err(io_err)?;
            let _ = txn.open_table(KEY_ID_INDEX).map_err(io_err)?;
            let _ = txn.open_table(META).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy::FailOnConflict
    }

    fn load_channel(
        &self,
        id: &ChannelId,
    ) -> Result<Option<Versioned<ChannelRecord>>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(CHANNELS).map_err(io_err)?;

        read(&table, &encode_channel_key(id)?)
    }

    fn list_channels(&self) -> Result<Vec<ChannelId>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(CHANNELS).map_err(io_err)?;

        let mut channels = Vec::new();
        for result in table.iter().map_err(io_err)? {
            let (key, _) = result.map_err(io_err)?;
            let (id, rest) = decode_channel_key(key.value())?;
            debug_assert!(rest.is_empty());
            channels.push(id);
        }

        Ok(channels)
    }

    fn load_provisions(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(ProvisionKey, Versioned<ProvisionRecord>)>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(PROVISIONS).map_err(io_err)?;

        scan_prefix(&table, &encode_channel_key(channel)?)?
            .into_iter()
            .map(|(key, value)| Ok((decode_provision_key(&key)?, decode_value(&value)?)))
            .collect()
    }

    fn load_key_materials(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(KEY_MATERIALS).map_err(io_err)?;

        scan_prefix(&table, &encode_channel_key(channel)?)?
            .into_iter()
            .map(|(key, value)| Ok((decode_key_material_key(&key)?, decode_value(&value)?)))
            .collect()
    }

    fn find_key_materials(
        &self,
        key_id: &CryptoKeyId,
        current_device_uid: &Uid,
    ) -> Result<Vec<(KeyMaterialKey, Versioned<KeyMaterialRecord>)>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let index = txn.open_table(KEY_ID_INDEX).map_err(io_err)?;
        let table = txn.open_table(KEY_MATERIALS).map_err(io_err)?;

        let mut prefix = Vec::with_capacity(CryptoKeyId::LENGTH + UID_SIZE);
        prefix.extend_from_slice(key_id.as_bytes());
        prefix.extend_from_slice(current_device_uid.as_bytes());

        let mut found = Vec::new();
        for (index_key, _) in scan_prefix(&index, &prefix)? {
            let km_bytes = &index_key[CryptoKeyId::LENGTH..];
            let Some(value) = read::<KeyMaterialRecord, _>(&table, km_bytes)? else {
                tracing::warn!(key_id = %key_id.to_hex(), "dangling key id index entry");
                continue;
            };
            found.push((decode_key_material_key(km_bytes)?, value));
        }

        Ok(found)
    }

    fn expired_key_materials(
        &self,
        now: Timestamp,
    ) -> Result<Vec<(KeyMaterialKey, u64)>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(KEY_MATERIALS).map_err(io_err)?;

        let mut expired = Vec::new();
        for result in table.iter().map_err(io_err)? {
            let (key, value) = result.map_err(io_err)?;
            let value: Versioned<KeyMaterialRecord> = decode_value(value.value())?;
            if value.record.expiration.is_some_and(|at| at < now) {
                expired.push((decode_key_material_key(key.value())?, value.version));
            }
        }

        Ok(expired)
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;

        {
            let mut channels = txn.open_table(CHANNELS).map_err(io_err)?;
            let mut provisions = txn.open_table(PROVISIONS).map_err(io_err)?;
            let mut key_materials = txn.open_table(KEY_MATERIALS).map_err(io_err)?;
            let mut index = txn.open_table(KEY_ID_INDEX).map_err(io_err)?;
            let mut meta = txn.open_table(META).map_err(io_err)?;

            let mut last_version = match meta.get(LAST_VERSION).map_err(io_err)? {
                Some(value) => decode_u64(value.value())?,
                None => 0,
            };

            // Returning early drops `txn` uncommitted, which aborts it
            for operation in changes.into_operations() {
                let key = operation.key();
                let current = match &key {
                    RecordKey::Channel(id) => {
                        read::<ChannelRecord, _>(&channels, &encode_channel_key(id)?)?
                            .map(|v| v.version)
                    },
                    RecordKey::Provision(key) => {
                        read::<ProvisionRecord, _>(&provisions, &encode_provision_key(key)?)?
                            .map(|v| v.version)
                    },
                    RecordKey::KeyMaterial(key) => {
                        read::<KeyMaterialRecord, _>(&key_materials, &encode_key_material_key(key)?)?
                            .map(|v| v.version)
                    },
                };
                if current != operation.expected() {
                    return Err(StorageError::Conflict { key: key.to_string() });
                }

                match operation {
                    Operation::PutChannel { id, record, .. } => {
                        last_version += 1;
                        let bytes = encode_value(&Versioned { version: last_version, record })?;
                        channels
                            .insert(encode_channel_key(&id)?.as_slice(), bytes.as_slice())
                            .map_err(io_err)?;
                    },
                    Operation::PutProvision { key, record, .. } => {
                        last_version += 1;
                        let bytes = encode_value(&Versioned { version: last_version, record })?;
                        provisions
                            .insert(encode_provision_key(&key)?.as_slice(), bytes.as_slice())
                            .map_err(io_err)?;
                    },
                    Operation::PutKeyMaterial { key, record, .. } => {
                        let km_key = encode_key_material_key(&key)?;
                        if let Some(previous) = read::<KeyMaterialRecord, _>(&key_materials, &km_key)? {
                            index
                                .remove(encode_index_key(&previous.record.key_id, &km_key).as_slice())
                                .map_err(io_err)?;
                        }

                        index
                            .insert(encode_index_key(&record.key_id, &km_key).as_slice(), b"".as_slice())
                            .map_err(io_err)?;

                        last_version += 1;
                        let bytes = encode_value(&Versioned { version: last_version, record })?;
                        key_materials.insert(km_key.as_slice(), bytes.as_slice()).map_err(io_err)?;
                    },
                    Operation::Delete { key: RecordKey::Channel(id), .. } => {
                        channels.remove(encode_channel_key(&id)?.as_slice()).map_err(io_err)?;
                    },
                    Operation::Delete { key: RecordKey::Provision(key), .. } => {
                        provisions.remove(encode_provision_key(&key)?.as_slice()).map_err(io_err)?;
                    },
                    Operation::Delete { key: RecordKey::KeyMaterial(key), .. } => {
                        let km_key = encode_key_material_key(&key)?;
                        if let Some(previous) = read::<KeyMaterialRecord, _>(&key_materials, &km_key)? {
                            index
                                .remove(encode_index_key(&previous.record.key_id, &km_key).as_slice())
                                .map_err(io_err)?;
                        }
                        key_materials.remove(km_key.as_slice()).map_err(io_err)?;
                    },
                    Operation::Check { .. } => {},
                }
            }

            meta.insert(LAST_VERSION, last_version.to_be_bytes().as_slice()).map_err(io_err)?;
        }

        txn.commit().map_err(io_err)?;

        Ok(())
    }
}

/// Encode a channel id.
///
/// Layout: [current device uid: 32][remote device uid: 32][identity length:
/// 2 BE][identity bytes]. The length prefix makes channel keys prefix-free,
/// so a channel key is a safe scan prefix for its provisions and keys.
///
/// # Errors
///
/// `Serialization` if the identity does not fit the length prefix.
fn encode_channel_key(id: &ChannelId) -> Result<Vec<u8>, StorageError> {
    let identity = id.remote_identity.as_bytes();
    let len = u16::try_from(identity.len()).map_err(|_| {
        StorageError::Serialization(format!(
            "remote identity of {} bytes exceeds the {} byte key limit",
            identity.len(),
            u16::MAX
        ))
    })?;

    let mut key = Vec::with_capacity(2 * UID_SIZE + 2 + identity.len() + 8);
    key.extend_from_slice(id.current_device_uid.as_bytes());
    key.extend_from_slice(id.remote_device_uid.as_bytes());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(identity);
    Ok(key)
}

fn encode_provision_key(key: &ProvisionKey) -> Result<Vec<u8>, StorageError> {
    let mut bytes = encode_channel_key(&key.channel)?;
    bytes.extend_from_slice(&key.full_ratcheting_count.to_be_bytes());
    Ok(bytes)
}

fn encode_key_material_key(key: &KeyMaterialKey) -> Result<Vec<u8>, StorageError> {
    let mut bytes = encode_channel_key(&key.channel)?;
    bytes.extend_from_slice(&key.full_ratcheting_count.to_be_bytes());
    bytes.extend_from_slice(&key.self_ratcheting_count.to_be_bytes());
    Ok(bytes)
}

fn encode_index_key(key_id: &CryptoKeyId, km_key: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CryptoKeyId::LENGTH + km_key.len());
    bytes.extend_from_slice(key_id.as_bytes());
    bytes.extend_from_slice(km_key);
    bytes
}

fn corrupted_key(what: &str) -> StorageError {
    StorageError::Serialization(format!("corrupted {what} key"))
}

fn split_uid(bytes: &[u8]) -> Option<(Uid, &[u8])> {
    let (head, rest) = bytes.split_at_checked(UID_SIZE)?;
    let mut raw = [0u8; UID_SIZE];
    raw.copy_from_slice(head);
    Some((Uid::from_bytes(raw), rest))
}

fn split_u32(bytes: &[u8]) -> Option<(u32, &[u8])> {
    let (head, rest) = bytes.split_at_checked(4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(head);
    Some((u32::from_be_bytes(raw), rest))
}

/// Decode a channel key, returning the id and the remaining suffix.
fn decode_channel_key(bytes: &[u8]) -> Result<(ChannelId, &[u8]), StorageError> {
    let (current_device_uid, rest) = split_uid(bytes).ok_or_else(|| corrupted_key("channel"))?;
    let (remote_device_uid, rest) = split_uid(rest).ok_or_else(|| corrupted_key("channel"))?;
    let (len, rest) = rest.split_at_checked(2).ok_or_else(|| corrupted_key("channel"))?;
    let len = usize::from(u16::from_be_bytes([len[0], len[1]]));
    let (identity, rest) = rest.split_at_checked(len).ok_or_else(|| corrupted_key("channel"))?;

    let id = ChannelId::new(current_device_uid, CryptoIdentity::new(identity), remote_device_uid);
    Ok((id, rest))
}

fn decode_provision_key(bytes: &[u8]) -> Result<ProvisionKey, StorageError> {
    let (channel, rest) = decode_channel_key(bytes)?;
    match split_u32(rest) {
        Some((full_ratcheting_count, [])) => Ok(ProvisionKey { channel, full_ratcheting_count }),
        _ => Err(corrupted_key("provision")),
    }
}

fn decode_key_material_key(bytes: &[u8]) -> Result<KeyMaterialKey, StorageError> {
    let (channel, rest) = decode_channel_key(bytes)?;
    let (full_ratcheting_count, rest) = split_u32(rest).ok_or_else(|| corrupted_key("key material"))?;
    match split_u32(rest) {
        Some((self_ratcheting_count, [])) => {
            Ok(KeyMaterialKey { channel, full_ratcheting_count, self_ratcheting_count })
        },
        _ => Err(corrupted_key("key material")),
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StorageError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Serialization("meta value is not 8 bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}
