//! Session record service: appointments and the clinical record lifecycle.
//!
//! Every mutation follows the same order: load, authorize, run the lifecycle
//! gate, then (and only then) touch the cipher, then compare-and-swap on the
//! record revision. A stale `expected_revision` fails with
//! `ConcurrentModification` instead of overwriting someone else's edit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{storage, ClinicianKeyRegistry, CryptoEngine, KeyManager};
use crate::adapters::StorageError;
use crate::domain::state_machine::{self, validate_transition};
use crate::domain::{
    Actor, Appointment, AppointmentStatus, ClinicalNarrative, ClinicalRecord,
    ClinicianAttestation, DecryptionError, KeyPurpose, LegalStatus, RecordVersion,
};
use crate::ports::{AuditAction, AuditEvent, AuditSink, KeyStore, RecordStore};
use crate::{ClinvaultError, Result};

const RECORD: &str = "clinical_record";

/// Outcome of [`SessionRecordService::migrate_record_keys`].
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub target_key_id: String,
    pub migrated: Vec<String>,
    /// Signed, amended or voided records keep their original ciphertext.
    pub skipped_locked: Vec<String>,
    /// Records edited while the migration ran; picked up by the next run.
    pub skipped_conflict: Vec<String>,
    pub failed: Vec<(String, DecryptionError)>,
}

pub struct SessionRecordService<K, R>
where
    K: KeyStore,
    R: RecordStore,
{
    keys: Arc<KeyManager<K>>,
    crypto: Arc<CryptoEngine<K>>,
    records: Arc<R>,
    clinician_keys: Arc<ClinicianKeyRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl<K, R> SessionRecordService<K, R>
where
    K: KeyStore,
    K::Error: Into<StorageError>,
    R: RecordStore,
    R::Error: Into<StorageError>,
{
    pub fn new(
        keys: Arc<KeyManager<K>>,
        crypto: Arc<CryptoEngine<K>>,
        records: Arc<R>,
        clinician_keys: Arc<ClinicianKeyRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            keys,
            crypto,
            records,
            clinician_keys,
            audit,
        }
    }

    /// # Errors
    /// Returns error if storage fails.
    pub fn schedule_appointment(
        &self,
        clinician_id: &str,
        patient_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Appointment> {
        let appointment = Appointment::new(clinician_id, patient_id, scheduled_for);
        self.records.insert_appointment(&appointment).map_err(storage)?;
        tracing::debug!(appointment_id = %appointment.id, "Scheduled appointment");
        Ok(appointment)
    }

    /// Move an appointment along the scheduling machine.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden` unless `actor` is the clinician or a supervisor,
    /// `StateTransition`, `ConcurrentModification`.
    pub fn transition_appointment(
        &self,
        appointment_id: &str,
        to: AppointmentStatus,
        actor: &Actor,
    ) -> Result<Appointment> {
        let mut appointment = self
            .records
            .find_appointment(appointment_id)
            .map_err(storage)?
            .ok_or_else(|| ClinvaultError::NotFound(format!("appointment {appointment_id}")))?;

        if actor.id != appointment.clinician_id && !actor.is_supervisor() {
            return Err(ClinvaultError::Forbidden(format!(
                "{} may not manage appointment {appointment_id}",
                actor.id
            )));
        }
        let from = appointment.status;
        validate_transition(from, to, appointment_id)?;
        if from == to {
            return Ok(appointment);
        }

        let now = Utc::now();
        if !self
            .records
            .update_appointment_status(appointment_id, from, to, now)
            .map_err(storage)?
        {
            return Err(ClinvaultError::ConcurrentModification(format!(
                "appointment {appointment_id}"
            )));
        }
        appointment.status = to;
        appointment.updated_at = now;

        self.audit.log(
            AuditEvent::success(AuditAction::AppointmentTransition, "appointment", appointment_id)
                .actor(Some(&actor.id))
                .details(json!({ "from": from, "to": to })),
        );
        Ok(appointment)
    }

    /// Open a draft record for a confirmed appointment.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden` unless `actor` is the appointment's clinician,
    /// `Validation` unless the appointment is CONFIRMED, or an encryption error.
    pub fn create_record(
        &self,
        appointment_id: &str,
        narrative: &ClinicalNarrative,
        actor: &Actor,
    ) -> Result<ClinicalRecord> {
        let appointment = self
            .records
            .find_appointment(appointment_id)
            .map_err(storage)?
            .ok_or_else(|| ClinvaultError::NotFound(format!("appointment {appointment_id}")))?;

        if actor.id != appointment.clinician_id {
            return Err(ClinvaultError::Forbidden(format!(
                "only the treating clinician may document appointment {appointment_id}"
            )));
        }
        state_machine::ensure_record_creatable(&appointment)?;

        let payload = self.crypto.encrypt_narrative(narrative)?;
        let record = ClinicalRecord::new_draft(appointment_id, &actor.id, payload);
        self.records.insert_record(&record).map_err(storage)?;

        tracing::info!(record_id = %record.id, appointment_id = %appointment_id, "Created clinical record");
        self.audit.log(
            AuditEvent::success(AuditAction::RecordCreate, RECORD, &record.id)
                .actor(Some(&actor.id))
                .details(json!({ "appointment_id": appointment_id, "key_id": record.narrative_key_id })),
        );
        Ok(record)
    }

    /// Overwrite the narrative of an unsigned record.
    ///
    /// The replaced ciphertext is kept as a [`RecordVersion`].
    ///
    /// # Errors
    /// `RecordLocked` for signed/amended/voided records (checked before any
    /// encryption), `Forbidden`, `ConcurrentModification`.
    pub fn update_narrative(
        &self,
        record_id: &str,
        narrative: &ClinicalNarrative,
        expected_revision: u64,
        actor: &Actor,
    ) -> Result<ClinicalRecord> {
        let mut record = self.load_any(record_id)?;

        if let Err(violation) = state_machine::ensure_editable(&record) {
            return Err(self.reject(AuditAction::RecordUpdate, record_id, actor, violation.into()));
        }
        self.require_author(&record, actor, AuditAction::RecordUpdate)?;
        self.require_revision(&record, expected_revision)?;

        let snapshot = RecordVersion::snapshot(&record, &actor.id);
        let payload = self.crypto.encrypt_narrative(narrative)?;
        record.replace_narrative(payload);
        record.touch();

        if !self
            .records
            .update_record_with_version(&record, expected_revision, &snapshot)
            .map_err(storage)?
        {
            return Err(ClinvaultError::ConcurrentModification(format!("record {record_id}")));
        }

        self.audit.log(
            AuditEvent::success(AuditAction::RecordUpdate, RECORD, record_id)
                .actor(Some(&actor.id))
                .details(json!({ "revision": record.revision })),
        );
        Ok(record)
    }

    /// DRAFT -> PENDING_REVIEW. Author only.
    ///
    /// # Errors
    /// `Forbidden`, `StateTransition`, `ConcurrentModification`.
    pub fn submit_for_review(
        &self,
        record_id: &str,
        expected_revision: u64,
        actor: &Actor,
    ) -> Result<ClinicalRecord> {
        let record = self.load(record_id)?;
        self.require_author(&record, actor, AuditAction::RecordSubmit)?;
        self.move_record(record, LegalStatus::PendingReview, expected_revision, actor, AuditAction::RecordSubmit)
    }

    /// PENDING_REVIEW -> DRAFT. Author or supervisor.
    ///
    /// # Errors
    /// `Forbidden`, `StateTransition`, `ConcurrentModification`.
    pub fn return_to_draft(
        &self,
        record_id: &str,
        expected_revision: u64,
        actor: &Actor,
    ) -> Result<ClinicalRecord> {
        let record = self.load(record_id)?;
        if actor.id != record.author_id && !actor.is_supervisor() {
            return Err(self.reject(
                AuditAction::RecordReturnToDraft,
                record_id,
                actor,
                ClinvaultError::Forbidden(format!("{} may not return record {record_id}", actor.id)),
            ));
        }
        self.move_record(record, LegalStatus::Draft, expected_revision, actor, AuditAction::RecordReturnToDraft)
    }

    /// Sign and lock a record. A draft is submitted for review on the way.
    ///
    /// The integrity fingerprint covers `{record_id, actor_id, signed_at}`.
    /// With an attestation, `signed_at` is the attested time and the ed25519
    /// signature must verify over that fingerprint.
    ///
    /// # Errors
    /// `AlreadySigned`, `AlreadyVoided`, `Forbidden` unless `actor` is the
    /// author, `Attestation`, `ConcurrentModification`.
    pub fn sign_record(
        &self,
        record_id: &str,
        expected_revision: u64,
        actor: &Actor,
        attestation: Option<ClinicianAttestation>,
    ) -> Result<ClinicalRecord> {
        let mut record = self.load(record_id)?;

        match record.legal_status {
            LegalStatus::Signed | LegalStatus::Amended => {
                return Err(self.reject(
                    AuditAction::RecordSign,
                    record_id,
                    actor,
                    ClinvaultError::AlreadySigned(format!("record {record_id}")),
                ));
            }
            LegalStatus::Voided => {
                return Err(self.reject(
                    AuditAction::RecordSign,
                    record_id,
                    actor,
                    ClinvaultError::AlreadyVoided(format!("record {record_id}")),
                ));
            }
            LegalStatus::Draft | LegalStatus::PendingReview => {}
        }
        if actor.id != record.author_id {
            return Err(self.reject(
                AuditAction::RecordSign,
                record_id,
                actor,
                ClinvaultError::Forbidden(format!("only the author may sign record {record_id}")),
            ));
        }
        self.require_revision(&record, expected_revision)?;

        if record.legal_status == LegalStatus::Draft {
            record.transition_to(LegalStatus::PendingReview)?;
        }
        record.transition_to(LegalStatus::Signed)?;

        let now = Utc::now();
        let signed_at = attestation.as_ref().map_or(now, |a| a.signed_at);
        let fingerprint = self
            .crypto
            .generate_integrity_fingerprint(&record.id, &actor.id, signed_at);
        if let Some(attestation) = &attestation {
            if let Err(e) = self.clinician_keys.verify(attestation, &actor.id, &fingerprint, now) {
                return Err(self.reject(AuditAction::RecordSign, record_id, actor, e));
            }
        }

        record.signed_at = Some(signed_at);
        record.signature_hash = Some(fingerprint);
        record.attestation = attestation;
        record.touch();

        if !self.records.update_record(&record, expected_revision).map_err(storage)? {
            return Err(ClinvaultError::ConcurrentModification(format!("record {record_id}")));
        }

        tracing::info!(record_id = %record_id, "Record signed");
        self.audit.log(
            AuditEvent::success(AuditAction::RecordSign, RECORD, record_id)
                .actor(Some(&actor.id))
                .details(json!({ "attested": record.attestation.is_some() })),
        );
        Ok(record)
    }

    /// Decrypt the current narrative. Author or supervisor.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden`, or `Decryption` (already audited).
    pub fn read_narrative(&self, record_id: &str, actor: &Actor) -> Result<ClinicalNarrative> {
        let record = self.load(record_id)?;
        self.require_reader(&record, actor)?;
        Ok(self
            .crypto
            .decrypt_narrative(&record.narrative_payload(), &record.id, Some(&actor.id))?)
    }

    /// Edit history, oldest first. Author or supervisor.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden`, or a storage error.
    pub fn list_versions(&self, record_id: &str, actor: &Actor) -> Result<Vec<RecordVersion>> {
        let record = self.load_any(record_id)?;
        self.require_reader(&record, actor)?;
        self.records.list_versions(record_id).map_err(storage)
    }

    /// Place or lift a legal hold. Supervisor only; allowed in every legal status.
    ///
    /// # Errors
    /// `Forbidden`, `ConcurrentModification`.
    pub fn set_legal_hold(
        &self,
        record_id: &str,
        hold: bool,
        expected_revision: u64,
        actor: &Actor,
    ) -> Result<ClinicalRecord> {
        let mut record = self.load_any(record_id)?;
        if !actor.is_supervisor() {
            return Err(self.reject(
                AuditAction::LegalHoldChange,
                record_id,
                actor,
                ClinvaultError::Forbidden("legal holds require a supervisor".into()),
            ));
        }
        self.require_revision(&record, expected_revision)?;
        if record.legal_hold == hold {
            return Ok(record);
        }

        record.legal_hold = hold;
        record.touch();
        if !self.records.update_record(&record, expected_revision).map_err(storage)? {
            return Err(ClinvaultError::ConcurrentModification(format!("record {record_id}")));
        }

        self.audit.log(
            AuditEvent::success(AuditAction::LegalHoldChange, RECORD, record_id)
                .actor(Some(&actor.id))
                .details(json!({ "legal_hold": hold })),
        );
        Ok(record)
    }

    /// Soft-delete an unsigned record. Author or supervisor.
    ///
    /// # Errors
    /// `LegalHold` whenever a hold is active, `RecordLocked` for signed
    /// records, `Forbidden`, `ConcurrentModification`.
    pub fn delete_record(
        &self,
        record_id: &str,
        expected_revision: u64,
        actor: &Actor,
    ) -> Result<ClinicalRecord> {
        let mut record = self.load_any(record_id)?;

        if let Err(violation) = state_machine::ensure_deletable(&record) {
            return Err(self.reject(AuditAction::RecordDelete, record_id, actor, violation.into()));
        }
        if actor.id != record.author_id && !actor.is_supervisor() {
            return Err(self.reject(
                AuditAction::RecordDelete,
                record_id,
                actor,
                ClinvaultError::Forbidden(format!("{} may not delete record {record_id}", actor.id)),
            ));
        }
        self.require_revision(&record, expected_revision)?;

        record.deleted_at = Some(Utc::now());
        record.touch();
        if !self.records.update_record(&record, expected_revision).map_err(storage)? {
            return Err(ClinvaultError::ConcurrentModification(format!("record {record_id}")));
        }

        self.audit.log(AuditEvent::success(AuditAction::RecordDelete, RECORD, record_id).actor(Some(&actor.id)));
        Ok(record)
    }

    /// Re-encrypt every unlocked record that is not under the active
    /// clinical-notes key. Locked records are write-once and are left alone.
    ///
    /// # Errors
    /// `Forbidden` unless `actor` is a supervisor, or a storage/encryption error.
    /// Per-record decryption failures are collected in the report.
    pub fn migrate_record_keys(&self, actor: &Actor) -> Result<MigrationReport> {
        if !actor.is_supervisor() {
            return Err(ClinvaultError::Forbidden("key migration requires a supervisor".into()));
        }

        let active = self.keys.get_active_key(KeyPurpose::ClinicalNotes)?;
        let candidates = self.records.list_records_not_under_key(&active.id).map_err(storage)?;
        let mut report = MigrationReport {
            target_key_id: active.id.clone(),
            ..MigrationReport::default()
        };

        for mut record in candidates {
            if record.is_locked || state_machine::is_immutable(record.legal_status) {
                report.skipped_locked.push(record.id);
                continue;
            }

            let payload = match self
                .crypto
                .re_encrypt_narrative(&record.narrative_payload(), &record.id, &actor.id)
            {
                Ok(payload) => payload,
                Err(ClinvaultError::Decryption(e)) => {
                    report.failed.push((record.id, e));
                    continue;
                }
                Err(e) => return Err(e),
            };

            let expected_revision = record.revision;
            let from_key_id = record.narrative_key_id.clone();
            record.replace_narrative(payload);
            record.touch();
            if self.records.update_record(&record, expected_revision).map_err(storage)? {
                self.audit.log(
                    AuditEvent::success(AuditAction::RecordReencrypt, RECORD, &record.id)
                        .actor(Some(&actor.id))
                        .details(json!({ "from_key_id": from_key_id, "to_key_id": record.narrative_key_id })),
                );
                report.migrated.push(record.id);
            } else {
                self.audit.log(
                    AuditEvent::failure(
                        AuditAction::RecordReencrypt,
                        RECORD,
                        &record.id,
                        "record changed during migration",
                    )
                    .actor(Some(&actor.id)),
                );
                report.skipped_conflict.push(record.id);
            }
        }

        tracing::info!(
            target_key_id = %report.target_key_id,
            migrated = report.migrated.len(),
            skipped_locked = report.skipped_locked.len(),
            skipped_conflict = report.skipped_conflict.len(),
            failed = report.failed.len(),
            "Record key migration finished"
        );
        Ok(report)
    }

    /// Live record or `NotFound`.
    fn load(&self, record_id: &str) -> Result<ClinicalRecord> {
        let record = self.load_any(record_id)?;
        if record.is_deleted() {
            return Err(ClinvaultError::NotFound(format!("record {record_id}")));
        }
        Ok(record)
    }

    /// Record including tombstoned ones; the gates decide what to do with those.
    fn load_any(&self, record_id: &str) -> Result<ClinicalRecord> {
        self.records
            .find_record(record_id)
            .map_err(storage)?
            .ok_or_else(|| ClinvaultError::NotFound(format!("record {record_id}")))
    }

    fn move_record(
        &self,
        mut record: ClinicalRecord,
        to: LegalStatus,
        expected_revision: u64,
        actor: &Actor,
        action: AuditAction,
    ) -> Result<ClinicalRecord> {
        self.require_revision(&record, expected_revision)?;
        let from = record.legal_status;
        if let Err(e) = record.transition_to(to) {
            return Err(self.reject(action, &record.id, actor, e.into()));
        }
        if from == to {
            return Ok(record);
        }

        record.touch();
        if !self.records.update_record(&record, expected_revision).map_err(storage)? {
            return Err(ClinvaultError::ConcurrentModification(format!("record {}", record.id)));
        }

        self.audit.log(
            AuditEvent::success(action, RECORD, &record.id)
                .actor(Some(&actor.id))
                .details(json!({ "from": from, "to": to })),
        );
        Ok(record)
    }

    fn require_author(&self, record: &ClinicalRecord, actor: &Actor, action: AuditAction) -> Result<()> {
        if actor.id == record.author_id {
            return Ok(());
        }
        Err(self.reject(
            action,
            &record.id,
            actor,
            ClinvaultError::Forbidden(format!("only the author may modify record {}", record.id)),
        ))
    }

    fn require_reader(&self, record: &ClinicalRecord, actor: &Actor) -> Result<()> {
        if actor.id == record.author_id || actor.is_supervisor() {
            return Ok(());
        }
        Err(self.reject(
            AuditAction::Decrypt,
            &record.id,
            actor,
            ClinvaultError::Forbidden(format!("{} may not read record {}", actor.id, record.id)),
        ))
    }

    fn require_revision(&self, record: &ClinicalRecord, expected_revision: u64) -> Result<()> {
        if record.revision == expected_revision {
            return Ok(());
        }
        Err(ClinvaultError::ConcurrentModification(format!(
            "record {} is at revision {}, not {expected_revision}",
            record.id, record.revision
        )))
    }

    fn reject(&self, action: AuditAction, record_id: &str, actor: &Actor, err: ClinvaultError) -> ClinvaultError {
        self.audit
            .log(AuditEvent::failure(action, RECORD, record_id, err.to_string()).actor(Some(&actor.id)));
        err
    }
}
