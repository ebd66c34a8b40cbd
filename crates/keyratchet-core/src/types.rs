//! Identifiers shared by the engine and the store.

use std::fmt;

use keyratchet_crypto::Uid;
use serde::{Deserialize, Serialize};

/// Public identity of a user (owned or contact).
///
/// Opaque bytes as far as the channel engine is concerned; the identity
/// directory gives them meaning.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CryptoIdentity(Vec<u8>);

impl CryptoIdentity {
    /// Wrap raw identity bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(6)];
        write!(f, "CryptoIdentity({})", hex::encode(shown))
    }
}

/// Unique key of a channel: one per `(current device, remote identity,
/// remote device)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    /// Device uid of the local (owned) device
    pub current_device_uid: Uid,
    /// Identity owning the remote device
    pub remote_identity: CryptoIdentity,
    /// Device uid of the remote end
    pub remote_device_uid: Uid,
}

impl ChannelId {
    /// Build a channel id.
    pub fn new(current_device_uid: Uid, remote_identity: CryptoIdentity, remote_device_uid: Uid) -> Self {
        Self { current_device_uid, remote_identity, remote_device_uid }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}→{:?}/{}",
            hex::encode(&self.current_device_uid.as_bytes()[..4]),
            self.remote_identity,
            hex::encode(&self.remote_device_uid.as_bytes()[..4]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_order_by_current_device_first() {
        let a = ChannelId::new(Uid::from_bytes([1; 32]), CryptoIdentity::new(vec![9]), Uid::from_bytes([9; 32]));
        let b = ChannelId::new(Uid::from_bytes([2; 32]), CryptoIdentity::new(vec![0]), Uid::from_bytes([0; 32]));
        assert!(a < b);
    }

    #[test]
    fn identity_debug_is_truncated() {
        let identity = CryptoIdentity::new(vec![0xAB; 64]);
        assert_eq!(format!("{identity:?}"), "CryptoIdentity(abababababab)");
    }
}
