//! Crypto engine: authenticated encryption of narratives and personal notes.
//!
//! Keys are always resolved through [`KeyManager`]; this engine never persists
//! key material. Decryption returns an explicit `Result<_, DecryptionError>` and
//! reports every failure to the audit sink before returning it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use zeroize::Zeroizing;

use crate::adapters::StorageError;
use crate::domain::crypto::{self, DecryptionFailureReason};
use crate::domain::{
    ClinicalNarrative, DecryptionError, EncryptedPayload, KeyError, KeyPurpose, SealedNote,
};
use crate::ports::{AuditAction, AuditEvent, AuditSink, KeyStore};
use crate::{ClinvaultError, Result};

const NARRATIVE_PURPOSE: KeyPurpose = KeyPurpose::ClinicalNotes;

pub struct CryptoEngine<K>
where
    K: KeyStore,
{
    keys: Arc<super::KeyManager<K>>,
    audit: Arc<dyn AuditSink>,
}

impl<K> CryptoEngine<K>
where
    K: KeyStore,
    K::Error: Into<StorageError>,
{
    pub fn new(keys: Arc<super::KeyManager<K>>, audit: Arc<dyn AuditSink>) -> Self {
        Self { keys, audit }
    }

    /// Encrypt a narrative under the active clinical-notes key.
    ///
    /// Every call uses a fresh IV, so identical narratives never produce the
    /// same ciphertext.
    ///
    /// # Errors
    /// Returns error if no key can be resolved or the cipher fails.
    pub fn encrypt_narrative(&self, narrative: &ClinicalNarrative) -> Result<EncryptedPayload> {
        self.try_encrypt_narrative(narrative).map_err(|e| {
            self.audit.log(AuditEvent::failure(
                AuditAction::Encrypt,
                "clinical_narrative",
                "-",
                e.to_string(),
            ));
            e
        })
    }

    fn try_encrypt_narrative(&self, narrative: &ClinicalNarrative) -> Result<EncryptedPayload> {
        let metadata = self.keys.get_active_key(NARRATIVE_PURPOSE)?;
        let key = self.keys.get_key_by_id(&metadata.id)?;
        let plaintext = Zeroizing::new(narrative.to_canonical_bytes()?);
        let (ciphertext, iv) = crypto::seal(&key, &plaintext)?;
        Ok(EncryptedPayload::new(ciphertext, iv, metadata.id))
    }

    /// Decrypt and deserialize a narrative.
    ///
    /// # Errors
    /// `DecryptionError` carrying the failure reason; the failure has already
    /// been audited against `resource_id`.
    pub fn decrypt_narrative(
        &self,
        payload: &EncryptedPayload,
        resource_id: &str,
        actor_id: Option<&str>,
    ) -> std::result::Result<ClinicalNarrative, DecryptionError> {
        self.decrypt_narrative_as("clinical_record", payload, resource_id, actor_id)
    }

    /// Decrypt an addendum's content; failures are audited against the addendum.
    ///
    /// # Errors
    /// `DecryptionError` carrying the failure reason.
    pub fn decrypt_addendum(
        &self,
        payload: &EncryptedPayload,
        addendum_id: &str,
        actor_id: Option<&str>,
    ) -> std::result::Result<ClinicalNarrative, DecryptionError> {
        self.decrypt_narrative_as("addendum", payload, addendum_id, actor_id)
    }

    fn decrypt_narrative_as(
        &self,
        resource: &str,
        payload: &EncryptedPayload,
        resource_id: &str,
        actor_id: Option<&str>,
    ) -> std::result::Result<ClinicalNarrative, DecryptionError> {
        self.try_decrypt_narrative(payload).map_err(|reason| {
            self.report_decryption_failure(resource, resource_id, actor_id, reason, &payload.key_id)
        })
    }

    fn try_decrypt_narrative(
        &self,
        payload: &EncryptedPayload,
    ) -> std::result::Result<ClinicalNarrative, DecryptionFailureReason> {
        if !self.verify_payload_structure(payload) {
            return Err(DecryptionFailureReason::InvalidCiphertext);
        }
        self.keys
            .validate_key_for_decryption(&payload.key_id)
            .map_err(|e| failure_reason(&e))?;
        let key = self
            .keys
            .get_key_by_id(&payload.key_id)
            .map_err(|e| failure_reason(&e))?;

        let plaintext = Zeroizing::new(crypto::open(&key, &payload.ciphertext, &payload.iv)?);
        ClinicalNarrative::from_canonical_bytes(&plaintext)
            .map_err(|_| DecryptionFailureReason::CorruptedData)
    }

    /// Encrypt note text under the owner's personal key.
    ///
    /// # Errors
    /// Returns error if the personal key cannot be derived or the cipher fails.
    pub fn encrypt_personal_note(&self, text: &str, owner_id: &str) -> Result<SealedNote> {
        let sealed = self
            .keys
            .derive_user_personal_key(owner_id)
            .and_then(|key| Ok(crypto::seal(&key, text.as_bytes())?));

        match sealed {
            Ok((ciphertext, iv)) => Ok(SealedNote { ciphertext, iv }),
            Err(e) => {
                self.audit.log(
                    AuditEvent::failure(AuditAction::Encrypt, "personal_note", "-", e.to_string())
                        .actor(Some(owner_id)),
                );
                Err(e)
            }
        }
    }

    /// Decrypt a personal note as `owner_id`.
    ///
    /// Any owner other than the one who sealed the note derives a different
    /// key, so the tag check fails with `AUTH_TAG_MISMATCH`.
    ///
    /// # Errors
    /// `DecryptionError`, already audited against `note_id`.
    pub fn decrypt_personal_note(
        &self,
        sealed: &SealedNote,
        owner_id: &str,
        note_id: &str,
    ) -> std::result::Result<Zeroizing<String>, DecryptionError> {
        let opened = self
            .keys
            .derive_user_personal_key(owner_id)
            .map_err(|e| failure_reason(&e))
            .and_then(|key| crypto::open(&key, &sealed.ciphertext, &sealed.iv))
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map(Zeroizing::new)
                    .map_err(|_| DecryptionFailureReason::CorruptedData)
            });

        opened.map_err(|reason| {
            self.report_decryption_failure("personal_note", note_id, Some(owner_id), reason, "personal")
        })
    }

    /// Move a payload onto the currently active key without changing its plaintext.
    ///
    /// Nothing is persisted here, so the success audit belongs to the caller
    /// once the new payload is stored.
    ///
    /// # Errors
    /// `Decryption` if the old payload cannot be read, or any encryption error.
    pub fn re_encrypt_narrative(
        &self,
        payload: &EncryptedPayload,
        record_id: &str,
        actor_id: &str,
    ) -> Result<EncryptedPayload> {
        let narrative = self.decrypt_narrative(payload, record_id, Some(actor_id))?;
        let fresh = self.encrypt_narrative(&narrative)?;

        tracing::debug!(
            record_id = %record_id,
            from_key = %payload.key_id,
            to_key = %fresh.key_id,
            "Re-encrypted narrative"
        );
        Ok(fresh)
    }

    /// Keyless tamper-evidence fingerprint. Not a digital signature.
    #[must_use]
    pub fn generate_integrity_fingerprint(
        &self,
        resource_id: &str,
        actor_id: &str,
        timestamp: DateTime<Utc>,
    ) -> String {
        crypto::integrity_fingerprint(resource_id, actor_id, timestamp)
    }

    /// Cheap structural check to run before attempting decryption.
    #[must_use]
    pub fn verify_payload_structure(&self, payload: &EncryptedPayload) -> bool {
        payload.has_valid_structure()
    }

    fn report_decryption_failure(
        &self,
        resource: &str,
        resource_id: &str,
        actor_id: Option<&str>,
        reason: DecryptionFailureReason,
        key_id: &str,
    ) -> DecryptionError {
        tracing::warn!(
            resource,
            resource_id = %resource_id,
            key_id = %key_id,
            reason = reason.as_str(),
            "Decryption failed"
        );
        self.audit.log(
            AuditEvent::failure(AuditAction::Decrypt, resource, resource_id, reason.as_str())
                .actor(actor_id)
                .details(json!({ "key_id": key_id })),
        );
        DecryptionError::new(reason, key_id)
    }
}

/// Key-resolution failures mapped onto decryption reasons. Anything that is
/// not a recognized key state (storage outage, derivation error) reads as
/// `KEY_NOT_FOUND`.
fn failure_reason(err: &ClinvaultError) -> DecryptionFailureReason {
    match err {
        ClinvaultError::Key(KeyError::Expired(_)) => DecryptionFailureReason::KeyExpired,
        ClinvaultError::Key(KeyError::Revoked(_)) => DecryptionFailureReason::KeyRevoked,
        _ => DecryptionFailureReason::KeyNotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IV_LEN, TAG_LEN};
    use crate::application::testing::Fixture;
    use chrono::Duration;

    fn narrative() -> ClinicalNarrative {
        ClinicalNarrative {
            assessment: Some("GAD-7 of 12".into()),
            plan: Some("Weekly CBT".into()),
            ..ClinicalNarrative::subjective("Patient reports improved sleep")
        }
    }

    fn last_failure_reason(fx: &Fixture) -> Option<String> {
        fx.audit
            .events()
            .into_iter()
            .rev()
            .find(|e| e.action == AuditAction::Decrypt && !e.success)
            .and_then(|e| e.failure_reason)
    }

    #[test]
    fn test_round_trip() {
        let fx = Fixture::new();
        let payload = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        assert!(fx.crypto.verify_payload_structure(&payload));
        assert_eq!(payload.iv.len(), IV_LEN);

        let decrypted = fx
            .crypto
            .decrypt_narrative(&payload, "rec-1", Some("dr-a"))
            .expect("Should decrypt");
        assert_eq!(decrypted, narrative());
    }

    #[test]
    fn test_encryption_is_not_deterministic() {
        let fx = Fixture::new();
        let a = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        let b = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(a.key_id, b.key_id);
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let fx = Fixture::new();
        let payload = fx
            .crypto
            .encrypt_narrative(&ClinicalNarrative::subjective("x"))
            .expect("Should encrypt");

        for byte in 0..payload.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = payload.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                let err = fx
                    .crypto
                    .decrypt_narrative(&tampered, "rec-1", None)
                    .expect_err("Tampering must not decrypt");
                assert!(matches!(
                    err.reason,
                    DecryptionFailureReason::AuthTagMismatch | DecryptionFailureReason::CorruptedData
                ));
            }
        }
        assert_eq!(last_failure_reason(&fx).as_deref(), Some("AUTH_TAG_MISMATCH"));
    }

    #[test]
    fn test_malformed_payload_is_rejected_before_key_lookup() {
        let fx = Fixture::new();
        let mut payload = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        payload.iv.truncate(12);
        let err = fx.crypto.decrypt_narrative(&payload, "rec-1", None).expect_err("Bad IV");
        assert_eq!(err.reason, DecryptionFailureReason::InvalidCiphertext);

        let short = EncryptedPayload::new(vec![0u8; TAG_LEN - 1], vec![0u8; IV_LEN], "k");
        let err = fx.crypto.decrypt_narrative(&short, "rec-1", None).expect_err("Too short");
        assert_eq!(err.reason, DecryptionFailureReason::InvalidCiphertext);
    }

    #[test]
    fn test_unknown_key_id() {
        let fx = Fixture::new();
        let mut payload = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        payload.key_id = "unknown".into();
        let err = fx.crypto.decrypt_narrative(&payload, "rec-1", Some("dr-a")).expect_err("No key");
        assert_eq!(err.reason, DecryptionFailureReason::KeyNotFound);
        assert_eq!(err.key_id, "unknown");
        assert_eq!(last_failure_reason(&fx).as_deref(), Some("KEY_NOT_FOUND"));
    }

    #[test]
    fn test_expired_and_revoked_keys() {
        let fx = Fixture::new();
        let payload = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");

        fx.store
            .set_key_expiry(&payload.key_id, Some(Utc::now() - Duration::minutes(1)))
            .expect("Should expire");
        let err = fx.crypto.decrypt_narrative(&payload, "rec-1", None).expect_err("Expired");
        assert_eq!(err.reason, DecryptionFailureReason::KeyExpired);

        fx.store.set_key_expiry(&payload.key_id, None).expect("Should clear");
        fx.keys.revoke_key(&payload.key_id, None).expect("Should revoke");
        let err = fx.crypto.decrypt_narrative(&payload, "rec-1", None).expect_err("Revoked");
        assert_eq!(err.reason, DecryptionFailureReason::KeyRevoked);
    }

    #[test]
    fn test_non_narrative_plaintext_is_corrupted_data() {
        let fx = Fixture::new();
        let meta = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");
        let key = fx.keys.get_key_by_id(&meta.id).expect("Should derive");
        let (ciphertext, iv) = crypto::seal(&key, b"not json").expect("Should seal");

        let payload = EncryptedPayload::new(ciphertext, iv, meta.id);
        let err = fx.crypto.decrypt_narrative(&payload, "rec-1", None).expect_err("Not JSON");
        assert_eq!(err.reason, DecryptionFailureReason::CorruptedData);
    }

    #[test]
    fn test_rotation_keeps_old_payloads_readable() {
        let fx = Fixture::new();
        let before = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        let rotation = fx.keys.rotate_key(KeyPurpose::ClinicalNotes).expect("Should rotate");

        let after = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        assert_eq!(after.key_id, rotation.new_key.id);
        assert_ne!(after.key_id, before.key_id);

        assert_eq!(
            fx.crypto.decrypt_narrative(&before, "rec-1", None).expect("Old key readable"),
            narrative()
        );
    }

    #[test]
    fn test_re_encrypt_moves_to_active_key() {
        let fx = Fixture::new();
        let old = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        let rotation = fx.keys.rotate_key(KeyPurpose::ClinicalNotes).expect("Should rotate");

        let fresh = fx.crypto.re_encrypt_narrative(&old, "rec-1", "admin").expect("Should migrate");
        assert_eq!(fresh.key_id, rotation.new_key.id);
        assert_eq!(
            fx.crypto.decrypt_narrative(&fresh, "rec-1", None).expect("Should decrypt"),
            narrative()
        );
        // Recorded by the caller after the new payload is committed.
        assert_eq!(fx.audit_count(AuditAction::RecordReencrypt), 0);
    }

    #[test]
    fn test_addendum_decryption_failure_is_attributed_to_addendum() {
        let fx = Fixture::new();
        let mut payload = fx.crypto.encrypt_narrative(&narrative()).expect("Should encrypt");
        payload.ciphertext[0] ^= 0x01;

        let err = fx
            .crypto
            .decrypt_addendum(&payload, "add-1", Some("dr-a"))
            .expect_err("Tampered");
        assert_eq!(err.reason, DecryptionFailureReason::AuthTagMismatch);

        let event = fx
            .audit
            .events()
            .into_iter()
            .find(|e| e.action == AuditAction::Decrypt && !e.success)
            .expect("Failure audited");
        assert_eq!(event.resource, "addendum");
        assert_eq!(event.resource_id, "add-1");
    }

    #[test]
    fn test_personal_note_isolation() {
        let fx = Fixture::new();
        let sealed = fx.crypto.encrypt_personal_note("countertransference", "dr-a").expect("Should seal");

        let text = fx
            .crypto
            .decrypt_personal_note(&sealed, "dr-a", "note-1")
            .expect("Owner can read");
        assert_eq!(text.as_str(), "countertransference");

        for other in ["dr-b", "supervisor-1", "admin"] {
            let err = fx
                .crypto
                .decrypt_personal_note(&sealed, other, "note-1")
                .expect_err("Other actors cannot read");
            assert_eq!(err.reason, DecryptionFailureReason::AuthTagMismatch);
        }
        assert_eq!(last_failure_reason(&fx).as_deref(), Some("AUTH_TAG_MISMATCH"));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let fx = Fixture::new();
        let at = Utc::now();
        let a = fx.crypto.generate_integrity_fingerprint("rec-1", "dr-a", at);
        assert_eq!(a, fx.crypto.generate_integrity_fingerprint("rec-1", "dr-a", at));
        assert_ne!(a, fx.crypto.generate_integrity_fingerprint("rec-1", "dr-b", at));
        assert_eq!(a.len(), 64);
    }
}
