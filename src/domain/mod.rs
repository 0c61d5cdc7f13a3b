//! Domain layer: Core types and pure logic.
//!
//! Nothing here performs I/O. Key derivation, AEAD primitives and the record
//! state machine are plain functions over these types.

mod actor;
pub mod attestation;
pub mod crypto;
pub mod kdf;
mod key;
mod narrative;
mod record;
pub mod state_machine;

pub use actor::{Actor, Role};
pub use attestation::{canonical_public_key, AttestationError, ClinicianAttestation, ClinicianKey};
pub use crypto::{
    CryptoError, DecryptionError, DecryptionFailureReason, EncryptedPayload, SealedNote, IV_LEN,
    TAG_LEN,
};
pub use kdf::{KdfError, MasterSecret};
pub use key::{DataKey, KeyError, KeyMetadata, KeyPurpose, KEY_ALGORITHM, KEY_LEN};
pub use narrative::ClinicalNarrative;
pub use record::{
    Addendum, Appointment, AppointmentStatus, ClinicalRecord, LegalStatus, PersonalNote,
    RecordVersion, UnknownStatus, VoidDetails,
};
pub(crate) use record::uuid_v4;
pub use state_machine::{GateViolation, Lifecycle, StateTransitionError};
