//! Key derivation from the master secret.
//!
//! This module provides:
//! - The [`MasterSecret`] type (32 bytes, supplied as 64 hex characters)
//! - HKDF-SHA256 derivation of versioned purpose keys
//! - HKDF-SHA256 derivation of per-user personal keys
//!
//! # Security
//!
//! - Derivation is deterministic: any instance holding the same master secret
//!   re-derives the same key from persisted metadata, so no key bytes are stored
//! - Purpose keys and personal keys use distinct salts, so the two families
//!   can never produce the same key
//! - All intermediate buffers are zeroized

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::key::{DataKey, KeyPurpose, KEY_LEN};

/// Length of the master secret in bytes.
pub const MASTER_SECRET_LEN: usize = 32;

const PURPOSE_KEY_SALT: &[u8] = b"clinvault/purpose-key/v1";
const PERSONAL_KEY_SALT: &[u8] = b"clinvault/personal-key/v1";
const PERSONAL_KEY_LABEL: &str = "user-personal-key";

/// Errors during master secret parsing or key derivation.
#[derive(Debug, Error)]
pub enum KdfError {
    #[error("Master secret must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Master secret is not valid hex")]
    InvalidHex,

    #[error("HKDF expansion failed: {0}")]
    Expansion(String),
}

/// The root secret every data key is derived from.
///
/// - Implements `ZeroizeOnDrop`
/// - `Debug` never prints the bytes
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret {
    bytes: [u8; MASTER_SECRET_LEN],
}

impl MasterSecret {
    #[must_use]
    pub fn from_bytes(bytes: [u8; MASTER_SECRET_LEN]) -> Self {
        Self { bytes }
    }

    /// Parse a 64-character hex string.
    ///
    /// # Errors
    /// Returns `KdfError::InvalidLength` or `KdfError::InvalidHex`.
    pub fn from_hex(input: &str) -> Result<Self, KdfError> {
        let trimmed = input.trim();
        if trimmed.len() != MASTER_SECRET_LEN * 2 {
            return Err(KdfError::InvalidLength {
                expected: MASTER_SECRET_LEN * 2,
                actual: trimmed.len(),
            });
        }

        let decoded = Zeroizing::new(hex::decode(trimmed).map_err(|_| KdfError::InvalidHex)?);
        let mut bytes = [0u8; MASTER_SECRET_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret([REDACTED])")
    }
}

fn expand(master: &MasterSecret, salt: &[u8], info: &[u8]) -> Result<DataKey, KdfError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|e| KdfError::Expansion(e.to_string()))?;
    Ok(DataKey::from_bytes(*okm))
}

/// Derive the data key for `{purpose, version}`.
///
/// # Errors
/// Returns `KdfError::Expansion` if HKDF rejects the output length.
pub fn derive_purpose_key(
    master: &MasterSecret,
    purpose: KeyPurpose,
    version: u32,
) -> Result<DataKey, KdfError> {
    let info = format!("{}:v{version}", purpose.as_str());
    expand(master, PURPOSE_KEY_SALT, info.as_bytes())
}

/// Derive the personal key owned by `user_id`.
///
/// The same user always yields the same key; the info string carries the
/// user id verbatim so distinct users never share one.
///
/// # Errors
/// Returns `KdfError::Expansion` if HKDF rejects the output length.
pub fn derive_user_personal_key(master: &MasterSecret, user_id: &str) -> Result<DataKey, KdfError> {
    let info = Zeroizing::new(format!("{PERSONAL_KEY_LABEL}:{user_id}"));
    expand(master, PERSONAL_KEY_SALT, info.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn master() -> MasterSecret {
        MasterSecret::from_hex(TEST_HEX).expect("Valid test secret")
    }

    #[test]
    fn test_master_secret_rejects_bad_input() {
        assert!(matches!(
            MasterSecret::from_hex("abcd"),
            Err(KdfError::InvalidLength { expected: 64, actual: 4 })
        ));
        let not_hex = "zz".repeat(32);
        assert!(matches!(MasterSecret::from_hex(&not_hex), Err(KdfError::InvalidHex)));
    }

    #[test]
    fn test_master_secret_debug_is_redacted() {
        let debug_output = format!("{:?}", master());
        assert!(!debug_output.contains("0001"));
        assert!(debug_output.contains("REDACTED"));
    }

    #[test]
    fn test_purpose_key_is_deterministic_per_version() {
        let m = master();
        let a = derive_purpose_key(&m, KeyPurpose::ClinicalNotes, 1).expect("Should derive");
        let b = derive_purpose_key(&m, KeyPurpose::ClinicalNotes, 1).expect("Should derive");
        let c = derive_purpose_key(&m, KeyPurpose::ClinicalNotes, 2).expect("Should derive");
        let d = derive_purpose_key(&m, KeyPurpose::ShadowNotes, 1).expect("Should derive");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_personal_keys_are_isolated_per_user() {
        let m = master();
        let alice = derive_user_personal_key(&m, "alice").expect("Should derive");
        let alice_again = derive_user_personal_key(&m, "alice").expect("Should derive");
        let bob = derive_user_personal_key(&m, "bob").expect("Should derive");

        assert_eq!(alice, alice_again);
        assert_ne!(alice, bob);
    }

    #[test]
    fn test_different_master_secrets_diverge() {
        let other = MasterSecret::from_bytes([7u8; MASTER_SECRET_LEN]);
        let a = derive_purpose_key(&master(), KeyPurpose::ClinicalNotes, 1).expect("Should derive");
        let b = derive_purpose_key(&other, KeyPurpose::ClinicalNotes, 1).expect("Should derive");
        assert_ne!(a, b);
    }
}
