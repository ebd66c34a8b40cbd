//! Authenticated encryption keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{CryptoError, CryptoSuite};

/// Size of an authenticated encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Serialized length: algorithm id followed by the key bytes
const ENCODED_SIZE: usize = 1 + KEY_SIZE;

/// Symmetric key for the AEAD of a given suite.
///
/// Used both as the channel key produced by the ratchet and as the
/// per-message key that the channel wraps.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedEncryptionKey {
    suite: CryptoSuite,
    key: [u8; KEY_SIZE],
}

impl AuthenticatedEncryptionKey {
    /// Build a key from raw bytes.
    pub fn new(suite: CryptoSuite, key: [u8; KEY_SIZE]) -> Self {
        Self { suite, key }
    }

    /// Suite whose AEAD this key is meant for.
    pub fn suite(&self) -> CryptoSuite {
        self.suite
    }

    /// Raw key bytes.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Serialize as `algorithm id ‖ key`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODED_SIZE);
        out.push(self.suite.algorithm_id());
        out.extend_from_slice(&self.key);
        out
    }

    /// Parse the encoding produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ENCODED_SIZE {
            return Err(CryptoError::MalformedKey {
                reason: format!("expected {ENCODED_SIZE} bytes, got {}", bytes.len()),
            });
        }
        let suite = CryptoSuite::from_algorithm_id(bytes[0])?;
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes[1..]);
        Ok(Self { suite, key })
    }
}

impl fmt::Debug for AuthenticatedEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedEncryptionKey").field("suite", &self.suite).finish_non_exhaustive()
    }
}

impl Drop for AuthenticatedEncryptionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_prefixes_algorithm_id() {
        let key = AuthenticatedEncryptionKey::new(CryptoSuite::V0, [0xAA; KEY_SIZE]);
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), ENCODED_SIZE);
        assert_eq!(bytes[0], 0x00);
        assert_eq!(AuthenticatedEncryptionKey::from_bytes(&bytes).unwrap(), key);
    }

    #[test]
    fn truncated_encoding_is_rejected() {
        let result = AuthenticatedEncryptionKey::from_bytes(&[0x00; 10]);
        assert!(matches!(result, Err(CryptoError::MalformedKey { .. })));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let mut bytes = vec![0xEE];
        bytes.extend_from_slice(&[0u8; KEY_SIZE]);
        assert!(AuthenticatedEncryptionKey::from_bytes(&bytes).is_err());
    }
}
