//! Crypto suite versions.
//!
//! The suite version decides which generator backs `self_ratchet`, which
//! label set `diversify` uses and which AEAD wraps the message key. A channel
//! records the version it was created with and never changes it.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Serialize};

use crate::{CryptoError, key::KEY_SIZE};

/// Supported crypto suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CryptoSuite {
    /// HKDF-SHA256 seeded generator, XChaCha20-Poly1305 key wrapping
    V0,
}

impl CryptoSuite {
    /// Most recent suite implemented by this build.
    pub const LATEST: Self = Self::V0;

    /// Resolve a persisted suite version.
    pub fn from_version(version: u32) -> Result<Self, CryptoError> {
        match version {
            0 => Ok(Self::V0),
            _ => Err(CryptoError::UnsupportedSuite { version }),
        }
    }

    /// Numeric version, as persisted alongside channels.
    pub fn version(self) -> u32 {
        match self {
            Self::V0 => 0,
        }
    }

    /// Byte identifying the authenticated encryption algorithm in serialized
    /// keys.
    pub(crate) fn algorithm_id(self) -> u8 {
        match self {
            Self::V0 => 0x00,
        }
    }

    pub(crate) fn from_algorithm_id(id: u8) -> Result<Self, CryptoError> {
        match id {
            0x00 => Ok(Self::V0),
            other => Err(CryptoError::MalformedKey {
                reason: format!("unknown algorithm id {other:#04x}"),
            }),
        }
    }

    /// Domain label mixed into every derivation of this suite.
    pub(crate) fn label(self) -> &'static [u8] {
        match self {
            Self::V0 => b"keyratchetV0",
        }
    }

    pub(crate) fn seal(
        self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; 24],
        plaintext: &[u8],
    ) -> Vec<u8> {
        match self {
            Self::V0 => {
                let cipher = XChaCha20Poly1305::new(key.into());
                let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), plaintext) else {
                    unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
                };
                ciphertext
            },
        }
    }

    pub(crate) fn open(
        self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; 24],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::V0 => {
                let cipher = XChaCha20Poly1305::new(key.into());
                cipher
                    .decrypt(XNonce::from_slice(nonce), ciphertext)
                    .map_err(|_| CryptoError::DecryptionFailed)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_zero_resolves() {
        assert_eq!(CryptoSuite::from_version(0), Ok(CryptoSuite::V0));
        assert_eq!(CryptoSuite::V0.version(), 0);
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert_eq!(
            CryptoSuite::from_version(7),
            Err(CryptoError::UnsupportedSuite { version: 7 })
        );
    }

    #[test]
    fn algorithm_id_roundtrip() {
        let id = CryptoSuite::V0.algorithm_id();
        assert_eq!(CryptoSuite::from_algorithm_id(id), Ok(CryptoSuite::V0));
        assert!(CryptoSuite::from_algorithm_id(0xFF).is_err());
    }
}
