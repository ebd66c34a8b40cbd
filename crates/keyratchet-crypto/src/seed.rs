//! Seeds and device-specific diversification.

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{CryptoError, CryptoSuite};

/// Size of a seed in bytes
pub const SEED_SIZE: usize = 32;

/// Size of a device uid in bytes
pub const UID_SIZE: usize = 32;

/// Label for per-device diversification
const DIVERSIFY_LABEL: &[u8] = b"diversify";

/// Opaque secret material driving a ratchet lineage.
///
/// A seed is either a channel's send seed, a provision's next-receive seed,
/// or an ephemeral value consumed once by [`crate::self_ratchet`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed([u8; SEED_SIZE]);

impl Seed {
    /// Wrap raw seed bytes (e.g. the output of a key agreement).
    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        &self.0
    }

    /// Derive a per-device seed.
    ///
    /// Deterministic and one-way. Diversifying the same raw seed with two
    /// different device uids yields unrelated seeds, which is what keeps the
    /// two directions of a channel apart.
    pub fn diversify(&self, device_uid: &Uid, suite_version: u32) -> Result<Seed, CryptoError> {
        let suite = CryptoSuite::from_version(suite_version)?;
        let hkdf = Hkdf::<Sha256>::new(Some(suite.label()), &self.0);

        let mut info = Vec::with_capacity(DIVERSIFY_LABEL.len() + UID_SIZE);
        info.extend_from_slice(DIVERSIFY_LABEL);
        info.extend_from_slice(device_uid.as_bytes());

        let mut out = [0u8; SEED_SIZE];
        let Ok(()) = hkdf.expand(&info, &mut out) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };
        Ok(Seed(out))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(..)")
    }
}

impl Drop for Seed {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Device (or other entity) unique identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid([u8; UID_SIZE]);

impl Uid {
    /// Wrap raw uid bytes.
    pub fn from_bytes(bytes: [u8; UID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw uid bytes.
    pub fn as_bytes(&self) -> &[u8; UID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seed() -> Seed {
        let mut bytes = [0u8; SEED_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Seed::from_bytes(bytes)
    }

    #[test]
    fn diversify_is_deterministic() {
        let uid = Uid::from_bytes([7u8; UID_SIZE]);
        let a = test_seed().diversify(&uid, 0).unwrap();
        let b = test_seed().diversify(&uid, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_devices_produce_different_seeds() {
        let alice = Uid::from_bytes([1u8; UID_SIZE]);
        let bob = Uid::from_bytes([2u8; UID_SIZE]);

        let seed = test_seed();
        assert_ne!(seed.diversify(&alice, 0).unwrap(), seed.diversify(&bob, 0).unwrap());
    }

    #[test]
    fn diversified_seed_differs_from_input() {
        let seed = test_seed();
        let diversified = seed.diversify(&Uid::from_bytes([0u8; UID_SIZE]), 0).unwrap();
        assert_ne!(seed, diversified);
    }

    #[test]
    fn unsupported_suite_fails() {
        let result = test_seed().diversify(&Uid::from_bytes([0u8; UID_SIZE]), 1);
        assert_eq!(result, Err(CryptoError::UnsupportedSuite { version: 1 }));
    }

    #[test]
    fn debug_does_not_leak_seed() {
        assert_eq!(format!("{:?}", test_seed()), "Seed(..)");
    }
}
