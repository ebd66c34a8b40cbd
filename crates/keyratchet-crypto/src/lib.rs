//! Keyratchet Cryptographic Primitives
//!
//! Cryptographic building blocks for the secure-channel ratchet. Pure
//! functions with deterministic outputs. Callers provide random bytes (AEAD
//! nonces) for deterministic testing.
//!
//! # Key Lifecycle
//!
//! A raw shared seed agreed out of band is diversified once per device id.
//! The sending side self-ratchets its diversified seed on every message, the
//! receiving side self-ratchets the matching seed ahead of time to provision
//! one-time receive keys.
//!
//! ```text
//! Raw Seed (key agreement / full ratchet)
//!        │
//!        ▼
//! diversify(device uid) → Send Seed / Receive Seed
//!        │
//!        ▼
//! self_ratchet → (Next Seed, CryptoKeyId, Channel Key)
//!        │
//!        ▼
//! AEAD wrap of the Message Key → keyId ‖ ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - A seed is consumed by `self_ratchet` and replaced by the next seed; the
//!   previous seed cannot be recomputed from its successor
//! - Channel keys are zeroized on drop
//!
//! Domain Separation:
//! - Both ends derive from the same raw seed, but each direction is
//!   diversified with the sender's device uid, so the two key streams never
//!   coincide
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD, a failed tag means "not this key"

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod key;
mod ratchet;
mod seed;
mod suite;
mod wrap;

pub use error::CryptoError;
pub use key::{AuthenticatedEncryptionKey, KEY_SIZE};
pub use ratchet::{CryptoKeyId, RatchetOutput, self_ratchet};
pub use seed::{SEED_SIZE, Seed, UID_SIZE, Uid};
pub use suite::CryptoSuite;
pub use wrap::{NONCE_SIZE, compose_header, parse_header, unwrap_key, wrap_key};
