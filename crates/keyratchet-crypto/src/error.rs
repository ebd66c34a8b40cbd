//! Error types for the ratchet primitives.

use thiserror::Error;

/// Errors from seed diversification, ratcheting and key wrapping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The crypto suite version is not implemented by this build
    #[error("unsupported crypto suite version {version}")]
    UnsupportedSuite {
        /// Requested suite version
        version: u32,
    },

    /// Wrapped key header shorter than the key id
    #[error("header too short: {len} bytes, need at least {min}")]
    HeaderTooShort {
        /// Length of the received header
        len: usize,
        /// Minimum acceptable length
        min: usize,
    },

    /// Authentication tag mismatch or truncated ciphertext
    #[error("decryption failed")]
    DecryptionFailed,

    /// Decrypted bytes are not a valid serialized key
    #[error("malformed key: {reason}")]
    MalformedKey {
        /// What was wrong with the encoding
        reason: String,
    },
}
