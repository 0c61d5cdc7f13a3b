//! Authenticated encryption primitives and encrypted payload types.
//!
//! AES-256-GCM with a 16-byte random IV and a 16-byte tag. Ciphertext and tag
//! travel concatenated (`ciphertext‖tag`), matching the persisted layout.
//!
//! # Memory Security
//!
//! Plaintext buffers handed back to callers are owned `Vec`s; the key bytes
//! used here come from [`DataKey`], which zeroizes itself on drop.

use std::fmt;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::key::DataKey;

/// IV length in bytes.
pub const IV_LEN: usize = 16;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// AES-256-GCM parameterised with a 128-bit nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Error type for the encryption direction.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Why a decryption attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecryptionFailureReason {
    KeyNotFound,
    KeyExpired,
    KeyRevoked,
    InvalidCiphertext,
    AuthTagMismatch,
    CorruptedData,
}

impl DecryptionFailureReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::KeyExpired => "KEY_EXPIRED",
            Self::KeyRevoked => "KEY_REVOKED",
            Self::InvalidCiphertext => "INVALID_CIPHERTEXT",
            Self::AuthTagMismatch => "AUTH_TAG_MISMATCH",
            Self::CorruptedData => "CORRUPTED_DATA",
        }
    }
}

impl fmt::Display for DecryptionFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed decryption, carrying the specific reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Decryption failed ({reason}) for key {key_id}")]
pub struct DecryptionError {
    pub reason: DecryptionFailureReason,
    pub key_id: String,
}

impl DecryptionError {
    #[must_use]
    pub fn new(reason: DecryptionFailureReason, key_id: impl Into<String>) -> Self {
        Self {
            reason,
            key_id: key_id.into(),
        }
    }
}

/// Encrypted narrative or addendum content bound to the key that produced it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// `ciphertext‖tag`
    pub ciphertext: Vec<u8>,
    /// Fresh random IV, 16 bytes
    pub iv: Vec<u8>,
    /// Id of the versioned key used at encryption time
    pub key_id: String,
}

impl EncryptedPayload {
    #[must_use]
    pub fn new(ciphertext: Vec<u8>, iv: Vec<u8>, key_id: impl Into<String>) -> Self {
        Self {
            ciphertext,
            iv,
            key_id: key_id.into(),
        }
    }

    /// Structural sanity check, run before attempting decryption.
    #[must_use]
    pub fn has_valid_structure(&self) -> bool {
        !self.key_id.trim().is_empty() && self.iv.len() == IV_LEN && self.ciphertext.len() >= TAG_LEN
    }
}

impl fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("size_bytes", &self.ciphertext.len())
            .field("iv_len", &self.iv.len())
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Personal note ciphertext. The key is implied by the owner's identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedNote {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
}

impl fmt::Debug for SealedNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedNote")
            .field("size_bytes", &self.ciphertext.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
///
/// # Errors
/// Returns `CryptoError::Encryption` if the cipher rejects the input.
pub fn seal(key: &DataKey, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm16::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok((ciphertext, iv.to_vec()))
}

/// Decrypt `ciphertext‖tag` under `key`, verifying the tag.
///
/// # Errors
/// `InvalidCiphertext` for malformed input, `AuthTagMismatch` if the tag does
/// not verify (tampering or wrong key).
pub fn open(key: &DataKey, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, DecryptionFailureReason> {
    if iv.len() != IV_LEN || ciphertext.len() < TAG_LEN {
        return Err(DecryptionFailureReason::InvalidCiphertext);
    }

    let cipher = Aes256Gcm16::new_from_slice(key.as_bytes())
        .map_err(|_| DecryptionFailureReason::InvalidCiphertext)?;
    cipher
        .decrypt(GenericArray::from_slice(iv), ciphertext)
        .map_err(|_| DecryptionFailureReason::AuthTagMismatch)
}

/// Keyless SHA-256 fingerprint over `{resource_id, actor_id, timestamp}`.
///
/// Proves content association only. It is not a digital signature; see
/// [`super::attestation`] for the clinician-held key variant.
#[must_use]
pub fn integrity_fingerprint(resource_id: &str, actor_id: &str, timestamp: DateTime<Utc>) -> String {
    let ts = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut hasher = Sha256::new();
    for part in [resource_id, actor_id, ts.as_str()] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
