//! Clinical record lifecycle types.
//!
//! Appointments (the scheduling entity), clinical records, their version
//! snapshots, addendums, and personal notes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attestation::ClinicianAttestation;
use super::crypto::{EncryptedPayload, SealedNote};
use super::state_machine::{self, StateTransitionError};

/// Parse failure for persisted enum labels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

/// Status of the scheduling entity a clinical record hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Confirmed => "CONFIRMED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::NoShow => "NO_SHOW",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "CONFIRMED" => Ok(Self::Confirmed),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            "NO_SHOW" => Ok(Self::NoShow),
            _ => Err(UnknownStatus {
                kind: "appointment status",
                value: s.to_string(),
            }),
        }
    }
}

/// Legal status of a clinical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegalStatus {
    Draft,
    PendingReview,
    Signed,
    Amended,
    Voided,
}

impl LegalStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::PendingReview => "PENDING_REVIEW",
            Self::Signed => "SIGNED",
            Self::Amended => "AMENDED",
            Self::Voided => "VOIDED",
        }
    }
}

impl fmt::Display for LegalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LegalStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "PENDING_REVIEW" => Ok(Self::PendingReview),
            "SIGNED" => Ok(Self::Signed),
            "AMENDED" => Ok(Self::Amended),
            "VOIDED" => Ok(Self::Voided),
            _ => Err(UnknownStatus {
                kind: "legal status",
                value: s.to_string(),
            }),
        }
    }
}

/// The scheduling entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub clinician_id: String,
    pub patient_id: String,
    pub status: AppointmentStatus,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    #[must_use]
    pub fn new(
        clinician_id: impl Into<String>,
        patient_id: impl Into<String>,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid_v4(),
            clinician_id: clinician_id.into(),
            patient_id: patient_id.into(),
            status: AppointmentStatus::Scheduled,
            scheduled_for,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Void metadata, retained on the record forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidDetails {
    pub voided_by: String,
    pub voided_at: DateTime<Utc>,
    pub reason: String,
    pub justification: String,
}

/// The protected clinical session record.
///
/// `is_locked` mirrors `legal_status ∈ {SIGNED, AMENDED, VOIDED}`; both only
/// change together through [`ClinicalRecord::transition_to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalRecord {
    pub id: String,
    pub appointment_id: String,
    pub author_id: String,
    pub narrative_encrypted: Vec<u8>,
    pub narrative_iv: Vec<u8>,
    pub narrative_key_id: String,
    pub is_draft: bool,
    pub is_locked: bool,
    pub legal_status: LegalStatus,
    pub signed_at: Option<DateTime<Utc>>,
    pub signature_hash: Option<String>,
    pub attestation: Option<ClinicianAttestation>,
    pub legal_hold: bool,
    /// Compare-and-swap token, bumped on every persisted change.
    pub revision: u64,
    pub void_details: Option<VoidDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ClinicalRecord {
    /// New draft record holding an already encrypted narrative.
    #[must_use]
    pub fn new_draft(
        appointment_id: impl Into<String>,
        author_id: impl Into<String>,
        narrative: EncryptedPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid_v4(),
            appointment_id: appointment_id.into(),
            author_id: author_id.into(),
            narrative_encrypted: narrative.ciphertext,
            narrative_iv: narrative.iv,
            narrative_key_id: narrative.key_id,
            is_draft: true,
            is_locked: false,
            legal_status: LegalStatus::Draft,
            signed_at: None,
            signature_hash: None,
            attestation: None,
            legal_hold: false,
            revision: 1,
            void_details: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn narrative_payload(&self) -> EncryptedPayload {
        EncryptedPayload::new(
            self.narrative_encrypted.clone(),
            self.narrative_iv.clone(),
            self.narrative_key_id.clone(),
        )
    }

    /// Replace the narrative ciphertext. Callers must pass the mutability gate first.
    pub(crate) fn replace_narrative(&mut self, payload: EncryptedPayload) {
        self.narrative_encrypted = payload.ciphertext;
        self.narrative_iv = payload.iv;
        self.narrative_key_id = payload.key_id;
    }

    /// Move to `to`, validating the edge and keeping the lock flags consistent.
    ///
    /// # Errors
    /// Returns `StateTransitionError` for illegal edges.
    pub fn transition_to(&mut self, to: LegalStatus) -> Result<(), StateTransitionError> {
        state_machine::validate_transition(self.legal_status, to, &self.id)?;
        self.legal_status = to;
        self.is_locked = state_machine::is_immutable(to);
        self.is_draft = to == LegalStatus::Draft;
        Ok(())
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Marks the record as persisted one more time.
    pub(crate) fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }
}

/// Immutable snapshot of a narrative taken before an unsigned record is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub id: String,
    pub record_id: String,
    /// Revision of the record this snapshot was taken from.
    pub revision: u64,
    pub narrative: EncryptedPayload,
    pub edited_by: String,
    pub created_at: DateTime<Utc>,
}

impl RecordVersion {
    #[must_use]
    pub fn snapshot(record: &ClinicalRecord, edited_by: impl Into<String>) -> Self {
        Self {
            id: uuid_v4(),
            record_id: record.id.clone(),
            revision: record.revision,
            narrative: record.narrative_payload(),
            edited_by: edited_by.into(),
            created_at: Utc::now(),
        }
    }
}

/// Append-only, separately signed correction to a signed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addendum {
    pub id: String,
    pub record_id: String,
    /// 1-based, strictly increasing per record.
    pub sequence_number: u32,
    pub content: EncryptedPayload,
    pub reason: String,
    pub author_id: String,
    pub signed_at: Option<DateTime<Utc>>,
    pub signature_hash: Option<String>,
    pub attestation: Option<ClinicianAttestation>,
    pub is_locked: bool,
    pub created_at: DateTime<Utc>,
}

impl Addendum {
    #[must_use]
    pub fn new(
        record_id: impl Into<String>,
        sequence_number: u32,
        content: EncryptedPayload,
        reason: impl Into<String>,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid_v4(),
            record_id: record_id.into(),
            sequence_number,
            content,
            reason: reason.into(),
            author_id: author_id.into(),
            signed_at: None,
            signature_hash: None,
            attestation: None,
            is_locked: false,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.is_locked || self.signed_at.is_some()
    }
}

/// Owner-only encrypted note ("shadow note").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalNote {
    pub id: String,
    pub owner_id: String,
    /// Optional clinical record the note was written alongside.
    pub record_id: Option<String>,
    pub sealed: SealedNote,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone; notes are never destroyed.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PersonalNote {
    #[must_use]
    pub fn new(owner_id: impl Into<String>, record_id: Option<String>, sealed: SealedNote) -> Self {
        let now = Utc::now();
        Self {
            id: uuid_v4(),
            owner_id: owner_id.into(),
            record_id,
            sealed,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Generate a UUID v4 (random) using a CSPRNG.
///
/// ChaCha20Rng seeded from OS entropy, so ids are not predictable.
pub(crate) fn uuid_v4() -> String {
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    let mut rng = ChaCha20Rng::from_entropy();
    let mut bytes: [u8; 16] = rng.gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::crypto::{IV_LEN, TAG_LEN};

    fn payload() -> EncryptedPayload {
        EncryptedPayload::new(vec![1u8; TAG_LEN + 4], vec![2u8; IV_LEN], "key-1")
    }

    #[test]
    fn test_status_labels_round_trip() {
        for status in [
            LegalStatus::Draft,
            LegalStatus::PendingReview,
            LegalStatus::Signed,
            LegalStatus::Amended,
            LegalStatus::Voided,
        ] {
            assert_eq!(status.as_str().parse::<LegalStatus>(), Ok(status));
        }
        assert_eq!("NO_SHOW".parse::<AppointmentStatus>(), Ok(AppointmentStatus::NoShow));
        assert!("ARCHIVED".parse::<LegalStatus>().is_err());
    }

    #[test]
    fn test_new_draft_is_unlocked() {
        let record = ClinicalRecord::new_draft("appt-1", "dr-a", payload());
        assert_eq!(record.legal_status, LegalStatus::Draft);
        assert!(record.is_draft);
        assert!(!record.is_locked);
        assert_eq!(record.narrative_payload(), payload());
    }

    #[test]
    fn test_transition_keeps_lock_flag_in_sync() {
        let mut record = ClinicalRecord::new_draft("appt-1", "dr-a", payload());
        record.transition_to(LegalStatus::PendingReview).expect("Should submit");
        assert!(!record.is_locked);
        assert!(!record.is_draft);

        record.transition_to(LegalStatus::Signed).expect("Should sign");
        assert!(record.is_locked);

        let err = record.transition_to(LegalStatus::Draft).expect_err("Signed cannot revert");
        assert_eq!(err.from, "SIGNED");
        assert_eq!(record.legal_status, LegalStatus::Signed);
        assert!(record.is_locked);
    }

    #[test]
    fn test_snapshot_copies_current_ciphertext() {
        let record = ClinicalRecord::new_draft("appt-1", "dr-a", payload());
        let version = RecordVersion::snapshot(&record, "dr-a");
        assert_eq!(version.record_id, record.id);
        assert_eq!(version.revision, 1);
        assert_eq!(version.narrative, payload());
    }

    #[test]
    fn test_uuid_generation() {
        let id1 = uuid_v4();
        let id2 = uuid_v4();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
        assert_eq!(&id1[14..15], "4");
    }
}
