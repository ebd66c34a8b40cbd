//! Message key wrapping.
//!
//! All functions are pure - the nonce must be provided by the caller.
//!
//! Wire format of a wrapped key header:
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────────────┐
//! │ key id (8 B) │ nonce (24 B) │ AEAD(serialized key) + tag │
//! └──────────────┴──────────────┴────────────────────────────┘
//! ```
//!
//! There is no length prefix: the ciphertext runs to the end of the header.

use crate::{AuthenticatedEncryptionKey, CryptoError, CryptoKeyId};

/// Size of the AEAD nonce carried at the start of the ciphertext
pub const NONCE_SIZE: usize = 24;

/// Encrypt a message key under a channel key.
///
/// Returns `nonce ‖ ciphertext`. Caller MUST provide cryptographically
/// secure random bytes for `nonce` in production.
pub fn wrap_key(
    message_key: &AuthenticatedEncryptionKey,
    channel_key: &AuthenticatedEncryptionKey,
    nonce: [u8; NONCE_SIZE],
) -> Vec<u8> {
    let plaintext = message_key.to_bytes();
    let sealed = channel_key.suite().seal(channel_key.key(), &nonce, &plaintext);

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    out
}

/// Decrypt a message key wrapped by [`wrap_key`].
///
/// # Errors
///
/// - `DecryptionFailed`: wrong key, tampered or truncated ciphertext
/// - `MalformedKey`: authentic plaintext that is not a serialized key
pub fn unwrap_key(
    ciphertext: &[u8],
    channel_key: &AuthenticatedEncryptionKey,
) -> Result<AuthenticatedEncryptionKey, CryptoError> {
    if ciphertext.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);

    let plaintext = channel_key.suite().open(channel_key.key(), &nonce, sealed)?;
    AuthenticatedEncryptionKey::from_bytes(&plaintext)
}

/// Build the header `key id ‖ ciphertext`.
pub fn compose_header(key_id: &CryptoKeyId, ciphertext: &[u8]) -> Vec<u8> {
    let mut header = Vec::with_capacity(CryptoKeyId::LENGTH + ciphertext.len());
    header.extend_from_slice(key_id.as_bytes());
    header.extend_from_slice(ciphertext);
    header
}

/// Split a header into its key id and ciphertext.
///
/// # Errors
///
/// - `HeaderTooShort`: fewer bytes than a key id
pub fn parse_header(header: &[u8]) -> Result<(CryptoKeyId, &[u8]), CryptoError> {
    if header.len() < CryptoKeyId::LENGTH {
        return Err(CryptoError::HeaderTooShort { len: header.len(), min: CryptoKeyId::LENGTH });
    }
    let (id_bytes, ciphertext) = header.split_at(CryptoKeyId::LENGTH);
    let mut raw = [0u8; CryptoKeyId::LENGTH];
    raw.copy_from_slice(id_bytes);
    Ok((CryptoKeyId::from_bytes(raw), ciphertext))
}
