//! Storage ports: Traits for key metadata, record persistence and the
//! clinician attestation key registry.
//!
//! These traits abstract the storage backend (SQLite) from the engines.
//! Implementations persist key *metadata* only; key bytes never reach them.

use chrono::{DateTime, Utc};

use crate::domain::{
    Addendum, Appointment, AppointmentStatus, ClinicalRecord, ClinicianKey, KeyMetadata,
    KeyPurpose, PersonalNote, RecordVersion,
};

/// Persistence for versioned encryption key metadata.
pub trait KeyStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Find a key by id.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn find_key(&self, key_id: &str) -> Result<Option<KeyMetadata>, Self::Error>;

    /// Find the active key for a purpose (at most one exists).
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn find_active_key(&self, purpose: KeyPurpose) -> Result<Option<KeyMetadata>, Self::Error>;

    /// All keys for a purpose, ordered by version descending.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_keys(&self, purpose: KeyPurpose) -> Result<Vec<KeyMetadata>, Self::Error>;

    /// Highest version ever created for a purpose.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn latest_version(&self, purpose: KeyPurpose) -> Result<Option<u32>, Self::Error>;

    /// Atomically deactivate `retiring` (if given) and insert `successor` as active.
    ///
    /// Either both happen or neither does, so readers never observe a purpose
    /// with zero active keys. Returns `false` when `retiring` was no longer the
    /// active key (a concurrent rotation won).
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn activate_successor(
        &self,
        retiring: Option<&str>,
        successor: &KeyMetadata,
        rotated_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// Mark a key revoked.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn revoke_key(&self, key_id: &str, revoked_at: DateTime<Utc>) -> Result<bool, Self::Error>;

    /// Overwrite the expiry of a key.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn set_key_expiry(
        &self,
        key_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, Self::Error>;
}

/// Persistence for appointments, clinical records and their satellites.
///
/// Record updates are compare-and-swap on `revision`: they return `false`
/// instead of overwriting a concurrent change.
pub trait RecordStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    /// Returns error if storage operation fails.
    fn insert_appointment(&self, appointment: &Appointment) -> Result<(), Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn find_appointment(&self, id: &str) -> Result<Option<Appointment>, Self::Error>;

    /// Set the status only if it is still `expected`.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn update_appointment_status(
        &self,
        id: &str,
        expected: AppointmentStatus,
        status: AppointmentStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn insert_record(&self, record: &ClinicalRecord) -> Result<(), Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn find_record(&self, id: &str) -> Result<Option<ClinicalRecord>, Self::Error>;

    /// Persist `record` if the stored revision is still `expected_revision`.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn update_record(
        &self,
        record: &ClinicalRecord,
        expected_revision: u64,
    ) -> Result<bool, Self::Error>;

    /// Persist a narrative overwrite together with the snapshot of what it replaced.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn update_record_with_version(
        &self,
        record: &ClinicalRecord,
        expected_revision: u64,
        version: &RecordVersion,
    ) -> Result<bool, Self::Error>;

    /// Live (not deleted) records whose narrative is not under `key_id`.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_records_not_under_key(&self, key_id: &str) -> Result<Vec<ClinicalRecord>, Self::Error>;

    /// Snapshots for a record, oldest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_versions(&self, record_id: &str) -> Result<Vec<RecordVersion>, Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn insert_addendum(&self, addendum: &Addendum) -> Result<(), Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn find_addendum(&self, id: &str) -> Result<Option<Addendum>, Self::Error>;

    /// Addendums ordered by `sequence_number` ascending.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_addendums(&self, record_id: &str) -> Result<Vec<Addendum>, Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn max_addendum_sequence(&self, record_id: &str) -> Result<Option<u32>, Self::Error>;

    /// Lock a signed addendum and move its parent record in one transaction.
    ///
    /// Returns `false` (and changes nothing) if the addendum was already signed
    /// or the record revision moved.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn commit_addendum_signature(
        &self,
        addendum: &Addendum,
        record: &ClinicalRecord,
        expected_revision: u64,
    ) -> Result<bool, Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn insert_note(&self, note: &PersonalNote) -> Result<(), Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn find_note(&self, id: &str) -> Result<Option<PersonalNote>, Self::Error>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn update_note(&self, note: &PersonalNote) -> Result<bool, Self::Error>;

    /// Live notes for an owner, newest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_notes(&self, owner_id: &str) -> Result<Vec<PersonalNote>, Self::Error>;
}

/// Registry of the public keys each clinician may attest with.
///
/// Keys are never deleted, only revoked, so attestations made before a
/// revocation stay checkable.
pub trait ClinicianKeyStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Enroll a key. Returns `false` if this clinician already has it.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn register_clinician_key(&self, key: &ClinicianKey) -> Result<bool, Self::Error>;

    /// The enrollment of `public_key_b64` (canonical form) for `clinician_id`.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn find_clinician_key(
        &self,
        clinician_id: &str,
        public_key_b64: &str,
    ) -> Result<Option<ClinicianKey>, Self::Error>;

    /// Every key enrolled for a clinician, oldest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_clinician_keys(&self, clinician_id: &str) -> Result<Vec<ClinicianKey>, Self::Error>;

    /// Mark a key revoked. Returns `false` if it is unknown or already revoked.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn revoke_clinician_key(
        &self,
        clinician_id: &str,
        public_key_b64: &str,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;
}
