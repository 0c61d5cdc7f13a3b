//! Clinician key registry: which Ed25519 keys may attest for which clinician.
//!
//! An attestation is only as strong as the binding between its public key and
//! the signing actor. Enrollment and revocation are supervisor operations;
//! verification looks the presented key up here and never trusts the key
//! embedded in the attestation on its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::adapters::StorageError;
use crate::domain::{canonical_public_key, Actor, ClinicianAttestation, ClinicianKey};
use crate::ports::{AuditAction, AuditEvent, AuditSink, ClinicianKeyStore};
use crate::{ClinvaultError, Result};

const RESOURCE: &str = "clinician_key";

/// Object-safe handle on the registry table.
pub type DynClinicianKeyStore = dyn ClinicianKeyStore<Error = StorageError>;

pub struct ClinicianKeyRegistry {
    store: Arc<DynClinicianKeyStore>,
    audit: Arc<dyn AuditSink>,
}

impl ClinicianKeyRegistry {
    pub fn new(store: Arc<DynClinicianKeyStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Enroll `public_key_b64` as an attestation key for `clinician_id`.
    ///
    /// # Errors
    /// `Forbidden` unless `actor` is a supervisor, `Validation` for an empty
    /// clinician id or an already enrolled key, `Attestation` for a malformed key.
    pub fn register_key(
        &self,
        clinician_id: &str,
        public_key_b64: &str,
        actor: &Actor,
    ) -> Result<ClinicianKey> {
        let outcome = self.try_register(clinician_id, public_key_b64, actor);
        match &outcome {
            Ok(key) => {
                tracing::info!(clinician_id = %clinician_id, "Enrolled attestation key");
                self.audit.log(
                    AuditEvent::success(AuditAction::ClinicianKeyRegister, RESOURCE, clinician_id)
                        .actor(Some(&actor.id))
                        .details(json!({ "public_key": key.public_key_b64 })),
                );
            }
            Err(e) => self.audit.log(
                AuditEvent::failure(AuditAction::ClinicianKeyRegister, RESOURCE, clinician_id, e.to_string())
                    .actor(Some(&actor.id)),
            ),
        }
        outcome
    }

    fn try_register(
        &self,
        clinician_id: &str,
        public_key_b64: &str,
        actor: &Actor,
    ) -> Result<ClinicianKey> {
        if !actor.is_supervisor() {
            return Err(ClinvaultError::Forbidden(format!(
                "enrolling attestation keys requires a supervisor; {} is not",
                actor.id
            )));
        }
        let clinician_id = clinician_id.trim();
        if clinician_id.is_empty() {
            return Err(ClinvaultError::Validation("clinician id must not be empty".into()));
        }

        let key = ClinicianKey::new(clinician_id, public_key_b64, Utc::now())?;
        if !self.store.register_clinician_key(&key)? {
            return Err(ClinvaultError::Validation(format!(
                "key is already enrolled for {clinician_id}"
            )));
        }
        Ok(key)
    }

    /// Revoke an enrolled key. Attestations dated before now still verify.
    ///
    /// # Errors
    /// `Forbidden` unless `actor` is a supervisor, `NotFound` for an unknown
    /// or already revoked key.
    pub fn revoke_key(&self, clinician_id: &str, public_key_b64: &str, actor: &Actor) -> Result<()> {
        let outcome = self.try_revoke(clinician_id, public_key_b64, actor);
        match &outcome {
            Ok(()) => {
                tracing::warn!(clinician_id = %clinician_id, "Attestation key revoked");
                self.audit.log(
                    AuditEvent::success(AuditAction::ClinicianKeyRevoke, RESOURCE, clinician_id)
                        .actor(Some(&actor.id))
                        .details(json!({ "public_key": public_key_b64 })),
                );
            }
            Err(e) => self.audit.log(
                AuditEvent::failure(AuditAction::ClinicianKeyRevoke, RESOURCE, clinician_id, e.to_string())
                    .actor(Some(&actor.id)),
            ),
        }
        outcome
    }

    fn try_revoke(&self, clinician_id: &str, public_key_b64: &str, actor: &Actor) -> Result<()> {
        if !actor.is_supervisor() {
            return Err(ClinvaultError::Forbidden(format!(
                "revoking attestation keys requires a supervisor; {} is not",
                actor.id
            )));
        }
        let public_key_b64 = canonical_public_key(public_key_b64)?;
        if !self
            .store
            .revoke_clinician_key(clinician_id, &public_key_b64, Utc::now())?
        {
            return Err(ClinvaultError::NotFound(format!(
                "active attestation key for {clinician_id}"
            )));
        }
        Ok(())
    }

    /// Every key ever enrolled for `clinician_id`, oldest first.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub fn list_keys(&self, clinician_id: &str) -> Result<Vec<ClinicianKey>> {
        Ok(self.store.list_clinician_keys(clinician_id)?)
    }

    /// Verify that `actor_id` made `attestation` over `fingerprint`.
    ///
    /// # Errors
    /// `Attestation` if the key is not enrolled for `actor_id`, was revoked
    /// before the attested time, or the signature does not verify.
    pub fn verify(
        &self,
        attestation: &ClinicianAttestation,
        actor_id: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let presented = canonical_public_key(&attestation.public_key_b64)?;
        let enrolled = self.store.find_clinician_key(actor_id, &presented)?;
        attestation.verify_registered(enrolled.as_ref(), actor_id, fingerprint, now)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::Fixture;
    use crate::domain::crypto::integrity_fingerprint;
    use crate::domain::AttestationError;
    use base64::{engine::general_purpose, Engine as _};
    use ed25519_dalek::SigningKey;

    fn public_key(seed: u8) -> String {
        general_purpose::STANDARD.encode(SigningKey::from_bytes(&[seed; 32]).verifying_key().to_bytes())
    }

    #[test]
    fn test_enrollment_requires_supervisor() {
        let fx = Fixture::new();
        let err = fx
            .clinician_keys
            .register_key("dr-a", &public_key(1), &Actor::clinician("dr-a"))
            .expect_err("Clinicians cannot enroll their own keys");
        assert!(matches!(err, ClinvaultError::Forbidden(_)));
        assert!(fx.clinician_keys.list_keys("dr-a").expect("Should list").is_empty());
        assert!(fx
            .audit
            .events()
            .iter()
            .any(|e| e.action == AuditAction::ClinicianKeyRegister && !e.success));
    }

    #[test]
    fn test_duplicate_and_malformed_enrollment() {
        let fx = Fixture::new();
        let supervisor = Actor::supervisor("sup-1");
        fx.clinician_keys
            .register_key("dr-a", &public_key(1), &supervisor)
            .expect("Should enroll");

        let err = fx
            .clinician_keys
            .register_key("dr-a", &public_key(1), &supervisor)
            .expect_err("Already enrolled");
        assert!(matches!(err, ClinvaultError::Validation(_)));

        let err = fx
            .clinician_keys
            .register_key("dr-a", "not-a-key", &supervisor)
            .expect_err("Malformed");
        assert!(matches!(err, ClinvaultError::Attestation(AttestationError::InvalidPublicKey)));
        assert_eq!(fx.audit_count(AuditAction::ClinicianKeyRegister), 1);
    }

    #[test]
    fn test_unregistered_key_cannot_attest() {
        let fx = Fixture::new();
        let now = Utc::now();
        let minted = SigningKey::from_bytes(&[42u8; 32]);
        let attestation = ClinicianAttestation::sign(&minted, "rec-1", "dr-a", now);
        let fp = integrity_fingerprint("rec-1", "dr-a", now);

        let err = fx
            .clinician_keys
            .verify(&attestation, "dr-a", &fp, now)
            .expect_err("Key was never enrolled");
        assert!(matches!(err, ClinvaultError::Attestation(AttestationError::UnregisteredKey(_))));
    }

    #[test]
    fn test_key_is_bound_to_its_clinician() {
        let fx = Fixture::new();
        fx.clinician_keys
            .register_key("dr-b", &public_key(5), &Actor::supervisor("sup-1"))
            .expect("Should enroll");
        let now = Utc::now();
        let attestation =
            ClinicianAttestation::sign(&SigningKey::from_bytes(&[5u8; 32]), "rec-1", "dr-a", now);
        let fp = integrity_fingerprint("rec-1", "dr-a", now);

        let err = fx
            .clinician_keys
            .verify(&attestation, "dr-a", &fp, now)
            .expect_err("dr-b's key cannot attest as dr-a");
        assert!(matches!(err, ClinvaultError::Attestation(AttestationError::UnregisteredKey(_))));
    }

    #[test]
    fn test_revoked_key_stops_attesting() {
        let fx = Fixture::new();
        let supervisor = Actor::supervisor("sup-1");
        let key = fx.enroll("dr-a", &SigningKey::from_bytes(&[6u8; 32]));

        let before = Utc::now();
        let attestation =
            ClinicianAttestation::sign(&SigningKey::from_bytes(&[6u8; 32]), "rec-1", "dr-a", before);
        let fp = integrity_fingerprint("rec-1", "dr-a", before);
        fx.clinician_keys
            .verify(&attestation, "dr-a", &fp, before)
            .expect("Enrolled key verifies");

        fx.clinician_keys
            .revoke_key("dr-a", &key.public_key_b64, &supervisor)
            .expect("Should revoke");
        let after = Utc::now() + chrono::Duration::seconds(1);
        let late =
            ClinicianAttestation::sign(&SigningKey::from_bytes(&[6u8; 32]), "rec-2", "dr-a", after);
        let fp = integrity_fingerprint("rec-2", "dr-a", after);
        let err = fx
            .clinician_keys
            .verify(&late, "dr-a", &fp, after)
            .expect_err("Revoked");
        assert!(matches!(err, ClinvaultError::Attestation(AttestationError::KeyRevoked(_))));

        let err = fx
            .clinician_keys
            .revoke_key("dr-a", &key.public_key_b64, &supervisor)
            .expect_err("Already revoked");
        assert!(matches!(err, ClinvaultError::NotFound(_)));
        assert_eq!(fx.audit_count(AuditAction::ClinicianKeyRevoke), 1);
    }
}
