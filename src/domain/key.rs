//! Key metadata and derived key material.
//!
//! Only [`KeyMetadata`] is ever persisted. The symmetric bytes behind a key are
//! re-derived from the master secret on demand and live in [`DataKey`], which
//! is zeroized on drop and never printed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every derived data key (AES-256).
pub const KEY_LEN: usize = 32;

/// Algorithm label stored with every key row.
pub const KEY_ALGORITHM: &str = "aes-256-gcm";

/// Errors raised while resolving or managing keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Encryption key not found: {0}")]
    NotFound(String),

    #[error("Encryption key expired: {0}")]
    Expired(String),

    #[error("Encryption key revoked: {0}")]
    Revoked(String),

    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Unknown key purpose: {0}")]
    UnknownPurpose(String),

    #[error("Key rotation for {0} lost a race with a concurrent rotation")]
    RotationConflict(KeyPurpose),
}

/// What a key family protects. Each purpose is versioned and rotated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyPurpose {
    /// Clinical session narratives and their addendums.
    ClinicalNotes,
    /// Shadow note family keys.
    ShadowNotes,
    /// Personal key family (per-user derivation lives outside the versioned table).
    UserPersonal,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 3] = [Self::ClinicalNotes, Self::ShadowNotes, Self::UserPersonal];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClinicalNotes => "CLINICAL_NOTES",
            Self::ShadowNotes => "SHADOW_NOTES",
            Self::UserPersonal => "USER_PERSONAL",
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyPurpose {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CLINICAL_NOTES" => Ok(Self::ClinicalNotes),
            "SHADOW_NOTES" => Ok(Self::ShadowNotes),
            "USER_PERSONAL" => Ok(Self::UserPersonal),
            _ => Err(KeyError::UnknownPurpose(s.to_string())),
        }
    }
}

/// Persisted description of one key version. Contains no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub id: String,
    pub purpose: KeyPurpose,
    /// Monotonic per purpose, starting at 1.
    pub version: u32,
    pub algorithm: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl KeyMetadata {
    /// Metadata for a freshly created, active key.
    #[must_use]
    pub fn new_active(
        id: String,
        purpose: KeyPurpose,
        version: u32,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            purpose,
            version,
            algorithm: KEY_ALGORITHM.to_string(),
            is_active: true,
            created_at,
            rotated_at: None,
            expires_at,
            revoked_at: None,
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Whether new data may be encrypted under this key.
    #[must_use]
    pub fn is_usable_for_encryption(&self) -> bool {
        self.is_active && !self.is_revoked() && !self.is_expired()
    }
}

/// Raw symmetric key bytes.
///
/// # Security
///
/// - Implements `ZeroizeOnDrop`: key material is erased when dropped
/// - `Debug` does NOT expose key bytes
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("size_bytes", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        // Only used by tests and cache checks; not a timing-sensitive path.
        self.bytes == other.bytes
    }
}

impl Eq for DataKey {}
