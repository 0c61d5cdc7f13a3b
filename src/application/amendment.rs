//! Amendment engine: addendums and voiding for signed records.
//!
//! A signed record's narrative is write-once. Corrections are appended as
//! separately signed addendums; the original ciphertext is never touched.
//! Voiding is terminal and retains all content.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::{storage, ClinicianKeyRegistry, CryptoEngine};
use crate::adapters::StorageError;
use crate::domain::state_machine::validate_transition;
use crate::domain::{
    Actor, Addendum, ClinicalNarrative, ClinicalRecord, ClinicianAttestation, DecryptionError,
    LegalStatus, VoidDetails,
};
use crate::ports::{AuditAction, AuditEvent, AuditSink, KeyStore, RecordStore};
use crate::{ClinvaultError, Result};

/// An addendum with its independently decrypted content.
#[derive(Debug, Clone, PartialEq)]
pub struct AddendumView {
    pub addendum: Addendum,
    /// A failure here marks this item only; the rest of the listing still renders.
    pub content: std::result::Result<ClinicalNarrative, DecryptionError>,
}

pub struct AmendmentEngine<K, R>
where
    K: KeyStore,
    R: RecordStore,
{
    crypto: Arc<CryptoEngine<K>>,
    records: Arc<R>,
    clinician_keys: Arc<ClinicianKeyRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl<K, R> AmendmentEngine<K, R>
where
    K: KeyStore,
    K::Error: Into<StorageError>,
    R: RecordStore,
    R::Error: Into<StorageError>,
{
    pub fn new(
        crypto: Arc<CryptoEngine<K>>,
        records: Arc<R>,
        clinician_keys: Arc<ClinicianKeyRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            crypto,
            records,
            clinician_keys,
            audit,
        }
    }

    /// Append an unsigned addendum to a signed or amended record.
    ///
    /// Only the record's author or a supervisor may amend.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden`, `Validation` for an empty reason,
    /// `StateTransition` unless the record is SIGNED or AMENDED.
    pub fn create_addendum(
        &self,
        record_id: &str,
        reason: &str,
        content: &ClinicalNarrative,
        actor: &Actor,
    ) -> Result<Addendum> {
        let record = self.load_record(record_id)?;

        if actor.id != record.author_id && !actor.is_supervisor() {
            return Err(self.reject(
                AuditAction::AddendumCreate,
                "clinical_record",
                record_id,
                actor,
                ClinvaultError::Forbidden(format!("{} may not amend record {record_id}", actor.id)),
            ));
        }
        if let Err(e) = validate_transition(record.legal_status, LegalStatus::Amended, &record.id) {
            return Err(self.reject(AuditAction::AddendumCreate, "clinical_record", record_id, actor, e.into()));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(self.reject(
                AuditAction::AddendumCreate,
                "clinical_record",
                record_id,
                actor,
                ClinvaultError::Validation("addendum reason must not be empty".into()),
            ));
        }

        let sequence_number = self
            .records
            .max_addendum_sequence(record_id)
            .map_err(storage)?
            .unwrap_or(0)
            + 1;
        let payload = self.crypto.encrypt_narrative(content)?;
        let addendum = Addendum::new(record_id, sequence_number, payload, reason, &actor.id);
        self.records.insert_addendum(&addendum).map_err(storage)?;

        tracing::info!(
            record_id = %record_id,
            addendum_id = %addendum.id,
            sequence_number,
            "Created addendum"
        );
        self.audit.log(
            AuditEvent::success(AuditAction::AddendumCreate, "addendum", &addendum.id)
                .actor(Some(&actor.id))
                .details(json!({ "record_id": record_id, "sequence_number": sequence_number })),
        );
        Ok(addendum)
    }

    /// Sign and lock an addendum; the parent record becomes AMENDED.
    ///
    /// When an attestation is supplied it must verify over the addendum's
    /// integrity fingerprint at the attested time, under a key enrolled for
    /// `actor`.
    ///
    /// # Errors
    /// `NotFound`, `AlreadySigned`, `Forbidden` unless `actor` authored the
    /// addendum, `Attestation`, `StateTransition` if the record was voided,
    /// `ConcurrentModification` if the record moved underneath.
    pub fn sign_addendum(
        &self,
        addendum_id: &str,
        actor: &Actor,
        attestation: Option<ClinicianAttestation>,
    ) -> Result<Addendum> {
        let mut addendum = self
            .records
            .find_addendum(addendum_id)
            .map_err(storage)?
            .ok_or_else(|| ClinvaultError::NotFound(format!("addendum {addendum_id}")))?;

        if addendum.is_signed() {
            return Err(self.reject(
                AuditAction::AddendumSign,
                "addendum",
                addendum_id,
                actor,
                ClinvaultError::AlreadySigned(format!("addendum {addendum_id}")),
            ));
        }
        if actor.id != addendum.author_id {
            return Err(self.reject(
                AuditAction::AddendumSign,
                "addendum",
                addendum_id,
                actor,
                ClinvaultError::Forbidden(format!("only the author may sign addendum {addendum_id}")),
            ));
        }

        let mut record = self.load_record(&addendum.record_id)?;
        let expected_revision = record.revision;
        if let Err(e) = record.transition_to(LegalStatus::Amended) {
            return Err(self.reject(AuditAction::AddendumSign, "addendum", addendum_id, actor, e.into()));
        }

        let now = Utc::now();
        let signed_at = attestation.as_ref().map_or(now, |a| a.signed_at);
        let fingerprint = self
            .crypto
            .generate_integrity_fingerprint(&addendum.id, &actor.id, signed_at);
        if let Some(attestation) = &attestation {
            if let Err(e) = self.clinician_keys.verify(attestation, &actor.id, &fingerprint, now) {
                return Err(self.reject(AuditAction::AddendumSign, "addendum", addendum_id, actor, e));
            }
        }

        addendum.signed_at = Some(signed_at);
        addendum.signature_hash = Some(fingerprint);
        addendum.attestation = attestation;
        addendum.is_locked = true;
        record.touch();

        let committed = self
            .records
            .commit_addendum_signature(&addendum, &record, expected_revision)
            .map_err(storage)?;
        if !committed {
            let err = match self.records.find_addendum(addendum_id).map_err(storage)? {
                Some(current) if current.is_signed() => {
                    ClinvaultError::AlreadySigned(format!("addendum {addendum_id}"))
                }
                _ => ClinvaultError::ConcurrentModification(format!("record {}", record.id)),
            };
            return Err(self.reject(AuditAction::AddendumSign, "addendum", addendum_id, actor, err));
        }

        tracing::info!(
            record_id = %record.id,
            addendum_id = %addendum.id,
            "Signed addendum; record amended"
        );
        self.audit.log(
            AuditEvent::success(AuditAction::AddendumSign, "addendum", &addendum.id)
                .actor(Some(&actor.id))
                .details(json!({
                    "record_id": record.id,
                    "sequence_number": addendum.sequence_number,
                    "legal_status": record.legal_status,
                    "attested": addendum.attestation.is_some(),
                })),
        );
        Ok(addendum)
    }

    /// Void a signed or amended record. Supervisor only; content is retained.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden`, `AlreadyVoided`, `Validation` for an empty
    /// reason or justification, `StateTransition` for unsigned records,
    /// `ConcurrentModification`.
    pub fn void_record(
        &self,
        record_id: &str,
        reason: &str,
        justification: &str,
        actor: &Actor,
    ) -> Result<ClinicalRecord> {
        let mut record = self.load_record(record_id)?;

        if !actor.is_supervisor() {
            return Err(self.reject(
                AuditAction::RecordVoid,
                "clinical_record",
                record_id,
                actor,
                ClinvaultError::Forbidden(format!("voiding requires a supervisor; {} is not", actor.id)),
            ));
        }
        if record.legal_status == LegalStatus::Voided {
            return Err(self.reject(
                AuditAction::RecordVoid,
                "clinical_record",
                record_id,
                actor,
                ClinvaultError::AlreadyVoided(format!("record {record_id}")),
            ));
        }
        let (reason, justification) = (reason.trim(), justification.trim());
        if reason.is_empty() || justification.is_empty() {
            return Err(self.reject(
                AuditAction::RecordVoid,
                "clinical_record",
                record_id,
                actor,
                ClinvaultError::Validation("voiding requires a reason and a justification".into()),
            ));
        }

        let expected_revision = record.revision;
        if let Err(e) = record.transition_to(LegalStatus::Voided) {
            return Err(self.reject(AuditAction::RecordVoid, "clinical_record", record_id, actor, e.into()));
        }
        let now = Utc::now();
        record.void_details = Some(VoidDetails {
            voided_by: actor.id.clone(),
            voided_at: now,
            reason: reason.to_string(),
            justification: justification.to_string(),
        });
        record.touch();

        if !self.records.update_record(&record, expected_revision).map_err(storage)? {
            return Err(self.reject(
                AuditAction::RecordVoid,
                "clinical_record",
                record_id,
                actor,
                ClinvaultError::ConcurrentModification(format!("record {record_id}")),
            ));
        }

        tracing::warn!(record_id = %record_id, "Record voided");
        self.audit.log(
            AuditEvent::success(AuditAction::RecordVoid, "clinical_record", record_id)
                .actor(Some(&actor.id))
                .details(json!({ "reason": reason })),
        );
        Ok(record)
    }

    /// Addendums in sequence order, each decrypted independently.
    ///
    /// # Errors
    /// `NotFound` if the record does not exist, or a storage error.
    pub fn list_addendums(&self, record_id: &str, actor_id: Option<&str>) -> Result<Vec<AddendumView>> {
        self.load_record(record_id)?;
        let addendums = self.records.list_addendums(record_id).map_err(storage)?;

        Ok(addendums
            .into_iter()
            .map(|addendum| {
                let content = self
                    .crypto
                    .decrypt_addendum(&addendum.content, &addendum.id, actor_id);
                AddendumView { addendum, content }
            })
            .collect())
    }

    fn load_record(&self, record_id: &str) -> Result<ClinicalRecord> {
        self.records
            .find_record(record_id)
            .map_err(storage)?
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| ClinvaultError::NotFound(format!("record {record_id}")))
    }

    fn reject(
        &self,
        action: AuditAction,
        resource: &str,
        resource_id: &str,
        actor: &Actor,
        err: ClinvaultError,
    ) -> ClinvaultError {
        self.audit.log(
            AuditEvent::failure(action, resource, resource_id, err.to_string()).actor(Some(&actor.id)),
        );
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::Fixture;
    use crate::domain::{AttestationError, DecryptionFailureReason};
    use ed25519_dalek::SigningKey;

    fn correction() -> ClinicalNarrative {
        ClinicalNarrative::subjective("initial (corrected dosage: 50mg)")
    }

    #[test]
    fn test_addendum_on_draft_is_rejected() {
        let fx = Fixture::new();
        let record = fx.draft_record("dr-a");
        let err = fx
            .amendments()
            .create_addendum(&record.id, "typo fix", &correction(), &Actor::clinician("dr-a"))
            .expect_err("Drafts are edited directly");
        assert!(matches!(err, ClinvaultError::StateTransition(_)));
    }

    #[test]
    fn test_addendum_leaves_original_narrative_untouched() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");

        let addendum = fx
            .amendments()
            .create_addendum(&record.id, "typo fix", &correction(), &Actor::clinician("dr-a"))
            .expect("Should amend");
        assert_eq!(addendum.sequence_number, 1);
        assert!(!addendum.is_locked);

        let after = fx.reload(&record.id);
        assert_eq!(after.narrative_encrypted, record.narrative_encrypted);
        assert_eq!(after.narrative_iv, record.narrative_iv);
        assert_eq!(after.legal_status, LegalStatus::Signed);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let engine = fx.amendments();
        let author = Actor::clinician("dr-a");

        let first = engine.create_addendum(&record.id, "one", &correction(), &author).expect("Should amend");
        engine.sign_addendum(&first.id, &author, None).expect("Should sign");
        let second = engine
            .create_addendum(&record.id, "two", &correction(), &Actor::supervisor("sup-1"))
            .expect("Amended records accept more addendums");
        assert_eq!(second.sequence_number, 2);
    }

    #[test]
    fn test_stranger_cannot_amend() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let err = fx
            .amendments()
            .create_addendum(&record.id, "fix", &correction(), &Actor::clinician("dr-b"))
            .expect_err("Not the author");
        assert!(matches!(err, ClinvaultError::Forbidden(_)));
        assert!(fx.audit.events().iter().any(|e| e.action == AuditAction::AddendumCreate && !e.success));
    }

    #[test]
    fn test_sign_addendum_amends_record() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let engine = fx.amendments();
        let author = Actor::clinician("dr-a");
        let addendum = engine.create_addendum(&record.id, "fix", &correction(), &author).expect("Should amend");

        let signed = engine.sign_addendum(&addendum.id, &author, None).expect("Should sign");
        assert!(signed.is_locked);
        let signed_at = signed.signed_at.expect("Signed");
        assert_eq!(
            signed.signature_hash.as_deref(),
            Some(fx.crypto.generate_integrity_fingerprint(&addendum.id, "dr-a", signed_at).as_str())
        );

        let record = fx.reload(&record.id);
        assert_eq!(record.legal_status, LegalStatus::Amended);
        assert!(record.is_locked);

        let err = engine.sign_addendum(&addendum.id, &author, None).expect_err("Twice");
        assert!(matches!(err, ClinvaultError::AlreadySigned(_)));
    }

    #[test]
    fn test_only_author_signs_addendum() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let engine = fx.amendments();
        let addendum = engine
            .create_addendum(&record.id, "fix", &correction(), &Actor::supervisor("sup-1"))
            .expect("Supervisor may amend");
        let err = engine
            .sign_addendum(&addendum.id, &Actor::clinician("dr-a"), None)
            .expect_err("Record author is not addendum author");
        assert!(matches!(err, ClinvaultError::Forbidden(_)));
    }

    #[test]
    fn test_attested_addendum_signature() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let engine = fx.amendments();
        let author = Actor::clinician("dr-a");
        let addendum = engine.create_addendum(&record.id, "fix", &correction(), &author).expect("Should amend");

        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        fx.enroll("dr-a", &signing_key);
        let forged = ClinicianAttestation::sign(&signing_key, &addendum.id, "dr-b", Utc::now());
        let err = engine.sign_addendum(&addendum.id, &author, Some(forged)).expect_err("Wrong actor");
        assert!(matches!(err, ClinvaultError::Attestation(_)));

        let genuine = ClinicianAttestation::sign(&signing_key, &addendum.id, "dr-a", Utc::now());
        let signed = engine
            .sign_addendum(&addendum.id, &author, Some(genuine.clone()))
            .expect("Should sign");
        assert_eq!(signed.attestation, Some(genuine));
    }

    #[test]
    fn test_unenrolled_key_cannot_sign_addendum() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let engine = fx.amendments();
        let author = Actor::clinician("dr-a");
        let addendum = engine.create_addendum(&record.id, "fix", &correction(), &author).expect("Should amend");

        let minted = SigningKey::from_bytes(&[42u8; 32]);
        let attestation = ClinicianAttestation::sign(&minted, &addendum.id, "dr-a", Utc::now());
        let err = engine
            .sign_addendum(&addendum.id, &author, Some(attestation))
            .expect_err("Key was never enrolled");
        assert!(matches!(err, ClinvaultError::Attestation(AttestationError::UnregisteredKey(_))));

        let stored = fx.store.find_addendum(&addendum.id).expect("Should query").expect("Exists");
        assert!(!stored.is_locked);
        assert_eq!(fx.reload(&record.id).legal_status, LegalStatus::Signed);
    }

    #[test]
    fn test_empty_reasons_are_rejected_and_audited() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let engine = fx.amendments();

        let err = engine
            .create_addendum(&record.id, "   ", &correction(), &Actor::clinician("dr-a"))
            .expect_err("Reason required");
        assert!(matches!(err, ClinvaultError::Validation(_)));

        let err = engine
            .void_record(&record.id, "duplicate", " ", &Actor::supervisor("sup-1"))
            .expect_err("Justification required");
        assert!(matches!(err, ClinvaultError::Validation(_)));

        let failures: Vec<_> = fx.audit.events().into_iter().filter(|e| !e.success).collect();
        assert!(failures
            .iter()
            .any(|e| e.action == AuditAction::AddendumCreate && e.resource_id == record.id));
        assert!(failures
            .iter()
            .any(|e| e.action == AuditAction::RecordVoid && e.actor_id.as_deref() == Some("sup-1")));
        assert_eq!(fx.reload(&record.id).legal_status, LegalStatus::Signed);
    }

    #[test]
    fn test_void_requires_supervisor() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let err = fx
            .amendments()
            .void_record(&record.id, "duplicate", "entered twice", &Actor::clinician("dr-a"))
            .expect_err("Clinicians cannot void");
        assert!(matches!(err, ClinvaultError::Forbidden(_)));
        assert_eq!(fx.reload(&record.id).legal_status, LegalStatus::Signed);
    }

    #[test]
    fn test_void_retains_content() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let engine = fx.amendments();
        let supervisor = Actor::supervisor("sup-1");

        let voided = engine
            .void_record(&record.id, "wrong patient", "chart merge error", &supervisor)
            .expect("Should void");
        assert_eq!(voided.legal_status, LegalStatus::Voided);
        assert!(voided.is_locked);
        let details = voided.void_details.expect("Void metadata kept");
        assert_eq!(details.voided_by, "sup-1");

        let stored = fx.reload(&record.id);
        assert_eq!(stored.narrative_encrypted, record.narrative_encrypted);
        assert!(fx.crypto.decrypt_narrative(&stored.narrative_payload(), &stored.id, None).is_ok());

        let err = engine
            .void_record(&record.id, "again", "again", &supervisor)
            .expect_err("Terminal");
        assert!(matches!(err, ClinvaultError::AlreadyVoided(_)));

        let err = engine
            .create_addendum(&record.id, "late", &correction(), &supervisor)
            .expect_err("Voided records take no addendums");
        assert!(matches!(err, ClinvaultError::StateTransition(_)));
    }

    #[test]
    fn test_void_unsigned_record_is_illegal() {
        let fx = Fixture::new();
        let record = fx.draft_record("dr-a");
        let err = fx
            .amendments()
            .void_record(&record.id, "r", "j", &Actor::supervisor("sup-1"))
            .expect_err("Draft cannot be voided");
        assert!(matches!(err, ClinvaultError::StateTransition(_)));
    }

    #[test]
    fn test_list_addendums_marks_unreadable_items() {
        let fx = Fixture::new();
        let record = fx.signed_record("dr-a");
        let engine = fx.amendments();
        let author = Actor::clinician("dr-a");
        let first = engine.create_addendum(&record.id, "one", &correction(), &author).expect("Should amend");
        engine
            .create_addendum(&record.id, "two", &ClinicalNarrative::subjective("second"), &author)
            .expect("Should amend");

        fx.keys.revoke_key(&first.content.key_id, None).expect("Should revoke");
        // The second addendum was sealed under the same key; rotate and add a readable third.
        fx.keys.get_active_key(crate::domain::KeyPurpose::ClinicalNotes).expect("Should replace");
        engine
            .create_addendum(&record.id, "three", &ClinicalNarrative::subjective("third"), &author)
            .expect("Should amend");

        let views = engine.list_addendums(&record.id, Some("dr-a")).expect("Should list");
        assert_eq!(views.iter().map(|v| v.addendum.sequence_number).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            views[0].content.as_ref().expect_err("Revoked").reason,
            DecryptionFailureReason::KeyRevoked
        );
        assert!(views[1].content.is_err());
        assert_eq!(
            views[2].content.as_ref().expect("Readable"),
            &ClinicalNarrative::subjective("third")
        );

        let failures: Vec<_> = fx
            .audit
            .events()
            .into_iter()
            .filter(|e| e.action == AuditAction::Decrypt && !e.success)
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|e| e.resource == "addendum"));
        assert_eq!(failures[0].resource_id, first.id);
    }
}
