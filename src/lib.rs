//! # Clinvault
//!
//! Clinical-record protection core: envelope encryption of session narratives,
//! owner-only personal notes, a legal-status state machine, and append-only
//! amendments for signed records.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: Core types, HKDF derivation, AEAD primitives, state machine
//! - `ports`: Storage and audit traits
//! - `adapters`: SQLite storage, audit sinks, log sanitization
//! - `application`: `KeyManager`, `CryptoEngine`, `AmendmentEngine` and record services
//! - `config`: Master secret loading and runtime settings

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use domain::{
    ClinicalNarrative, DecryptionError, DecryptionFailureReason, EncryptedPayload, KeyPurpose,
    LegalStatus,
};

/// Result type for Clinvault operations
pub type Result<T> = std::result::Result<T, ClinvaultError>;

/// Main error type for Clinvault
#[derive(Debug, thiserror::Error)]
pub enum ClinvaultError {
    #[error("Key error: {0}")]
    Key(#[from] domain::KeyError),

    #[error("Key derivation failed: {0}")]
    Kdf(#[from] domain::KdfError),

    #[error("Encryption failed: {0}")]
    Encryption(#[from] domain::CryptoError),

    #[error(transparent)]
    Decryption(#[from] domain::DecryptionError),

    #[error(transparent)]
    StateTransition(#[from] domain::StateTransitionError),

    #[error("Attestation rejected: {0}")]
    Attestation(#[from] domain::AttestationError),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] adapters::StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0} is already signed")]
    AlreadySigned(String),

    #[error("{0} is already voided")]
    AlreadyVoided(String),

    #[error("Record {0} is locked; corrections require an addendum")]
    RecordLocked(String),

    #[error("Record {0} is under legal hold")]
    LegalHold(String),

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<domain::GateViolation> for ClinvaultError {
    fn from(violation: domain::GateViolation) -> Self {
        use domain::GateViolation;
        match violation {
            GateViolation::Locked(id) => Self::RecordLocked(id),
            GateViolation::LegalHold(id) => Self::LegalHold(id),
            GateViolation::Deleted(id) => Self::NotFound(format!("record {id}")),
            v @ GateViolation::AppointmentNotConfirmed { .. } => Self::Validation(v.to_string()),
        }
    }
}
