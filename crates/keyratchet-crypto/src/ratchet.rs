//! Self-ratchet primitive.
//!
//! # Security Properties
//!
//! - One-way: the consumed seed cannot be recovered from the next seed, the
//!   key id or the key
//! - Determinism: same seed and suite always produce the same output
//! - Independence: the three outputs are drawn from distinct generator
//!   blocks and are uncorrelated

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{
    AuthenticatedEncryptionKey, CryptoError, CryptoSuite, KEY_SIZE, SEED_SIZE, Seed,
};

/// Label for the self-ratchet generator
const RATCHET_LABEL: &[u8] = b"self-ratchet";

/// Routing tag prefixed to wrapped keys.
///
/// Lets a receiver shortlist candidate keys without trial-decrypting against
/// everything it holds. Not globally unique: a receiver may still have to try
/// several candidates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CryptoKeyId([u8; CryptoKeyId::LENGTH]);

impl CryptoKeyId {
    /// Length of a key id in bytes
    pub const LENGTH: usize = 8;

    /// Wrap raw key id bytes.
    pub fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw key id bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }

    /// Lowercase hex rendering, for logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CryptoKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoKeyId({})", self.to_hex())
    }
}

/// Everything one self-ratchet step produces.
#[derive(Debug, Clone)]
pub struct RatchetOutput {
    /// Seed replacing the consumed one
    pub next_seed: Seed,
    /// Routing tag for the key
    pub key_id: CryptoKeyId,
    /// One-time channel key
    pub key: AuthenticatedEncryptionKey,
}

/// Deterministic generator seeded from a [`Seed`].
///
/// Each draw expands a fresh HKDF block with a distinct counter, so
/// successive draws are independent.
struct SeededPrng {
    hkdf: Hkdf<Sha256>,
    suite: CryptoSuite,
    counter: u32,
}

impl SeededPrng {
    fn new(seed: &Seed, suite: CryptoSuite) -> Self {
        Self { hkdf: Hkdf::<Sha256>::new(Some(suite.label()), seed.as_bytes()), suite, counter: 0 }
    }

    fn fill(&mut self, out: &mut [u8]) {
        let mut info = Vec::with_capacity(RATCHET_LABEL.len() + 4);
        info.extend_from_slice(RATCHET_LABEL);
        info.extend_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);

        let Ok(()) = self.hkdf.expand(&info, out) else {
            unreachable!("draws are far below the HKDF-SHA256 output limit");
        };
    }

    fn next_seed(&mut self) -> Seed {
        let mut bytes = [0u8; SEED_SIZE];
        self.fill(&mut bytes);
        Seed::from_bytes(bytes)
    }

    fn next_key_id(&mut self) -> CryptoKeyId {
        let mut bytes = [0u8; CryptoKeyId::LENGTH];
        self.fill(&mut bytes);
        CryptoKeyId(bytes)
    }

    fn next_key(&mut self) -> AuthenticatedEncryptionKey {
        let mut bytes = [0u8; KEY_SIZE];
        self.fill(&mut bytes);
        AuthenticatedEncryptionKey::new(self.suite, bytes)
    }
}

/// Turn a seed into `(next seed, key id, key)`.
///
/// The generator is seeded from `seed`, then draws the next seed, the key id
/// and the key, in that order.
pub fn self_ratchet(seed: &Seed, suite_version: u32) -> Result<RatchetOutput, CryptoError> {
    let suite = CryptoSuite::from_version(suite_version)?;
    let mut prng = SeededPrng::new(seed, suite);

    let next_seed = prng.next_seed();
    let key_id = prng.next_key_id();
    let key = prng.next_key();

    Ok(RatchetOutput { next_seed, key_id, key })
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
    fn ratchet_is_deterministic() {
        let a = self_ratchet(&test_seed(), 0).unwrap();
        let b = self_ratchet(&test_seed(), 0).unwrap();

        assert_eq!(a.next_seed, b.next_seed);
        assert_eq!(a.key_id, b.key_id);
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn next_seed_differs_from_input() {
        let out = self_ratchet(&test_seed(), 0).unwrap();
        assert_ne!(out.next_seed, test_seed());
    }

    #[test]
    fn chained_steps_produce_unique_keys() {
        let mut seed = test_seed();
        let mut ids = Vec::new();
        let mut keys = Vec::new();

        for _ in 0..32 {
            let out = self_ratchet(&seed, 0).unwrap();
            ids.push(out.key_id);
            keys.push(out.key.key().to_owned());
            seed = out.next_seed;
        }

        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j], "steps {i} and {j} must differ");
                assert_ne!(ids[i], ids[j], "steps {i} and {j} must differ");
            }
        }
    }

    #[test]
    fn different_seeds_produce_different_outputs() {
        let a = self_ratchet(&Seed::from_bytes([1u8; SEED_SIZE]), 0).unwrap();
        let b = self_ratchet(&Seed::from_bytes([2u8; SEED_SIZE]), 0).unwrap();

        assert_ne!(a.key, b.key);
        assert_ne!(a.key_id, b.key_id);
        assert_ne!(a.next_seed, b.next_seed);
    }

    #[test]
    fn key_carries_suite() {
        let out = self_ratchet(&test_seed(), 0).unwrap();
        assert_eq!(out.key.suite(), CryptoSuite::V0);
    }

    #[test]
    fn unsupported_suite_is_rejected() {
        let result = self_ratchet(&test_seed(), 42);
        assert!(matches!(result, Err(CryptoError::UnsupportedSuite { version: 42 })));
    }

    #[test]
    fn key_id_hex_rendering() {
        let id = CryptoKeyId::from_bytes([0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
        assert_eq!(id.to_hex(), "0123456789abcdef");
    }
}
