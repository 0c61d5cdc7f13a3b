//! Shared wiring for service tests: one in-memory store, one memory audit sink.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use ed25519_dalek::SigningKey;

use super::{
    AmendmentEngine, ClinicianKeyRegistry, CryptoEngine, KeyManager, PersonalNoteService,
    SessionRecordService,
};
use crate::adapters::{MemoryAuditSink, SqliteStorage};
use crate::domain::{
    Actor, AppointmentStatus, ClinicalNarrative, ClinicalRecord, ClinicianKey, MasterSecret,
};
use crate::ports::{AuditAction, AuditSink, RecordStore};

pub(crate) const TEST_MASTER_HEX: &str =
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

pub(crate) fn master() -> MasterSecret {
    MasterSecret::from_hex(TEST_MASTER_HEX).expect("Should parse test master secret")
}

pub(crate) struct Fixture {
    pub store: Arc<SqliteStorage>,
    pub audit: Arc<MemoryAuditSink>,
    pub keys: Arc<KeyManager<SqliteStorage>>,
    pub crypto: Arc<CryptoEngine<SqliteStorage>>,
    pub clinician_keys: Arc<ClinicianKeyRegistry>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(SqliteStorage::in_memory().expect("Should open in-memory database"));
        let audit = Arc::new(MemoryAuditSink::new());
        let sink: Arc<dyn AuditSink> = audit.clone();
        let keys = Arc::new(KeyManager::new(master(), store.clone(), sink.clone()));
        let crypto = Arc::new(CryptoEngine::new(keys.clone(), sink.clone()));
        let clinician_keys = Arc::new(ClinicianKeyRegistry::new(store.clone(), sink));
        Self {
            store,
            audit,
            keys,
            crypto,
            clinician_keys,
        }
    }

    /// Enroll `signing_key`'s public half for `clinician_id`.
    pub fn enroll(&self, clinician_id: &str, signing_key: &SigningKey) -> ClinicianKey {
        let public_key = general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());
        self.clinician_keys
            .register_key(clinician_id, &public_key, &Actor::supervisor("sup-enroll"))
            .expect("Should enroll attestation key")
    }

    pub fn audit_sink(&self) -> Arc<dyn AuditSink> {
        self.audit.clone()
    }

    pub fn audit_count(&self, action: AuditAction) -> usize {
        self.audit
            .events()
            .iter()
            .filter(|e| e.action == action && e.success)
            .count()
    }

    pub fn sessions(&self) -> SessionRecordService<SqliteStorage, SqliteStorage> {
        SessionRecordService::new(
            self.keys.clone(),
            self.crypto.clone(),
            self.store.clone(),
            self.clinician_keys.clone(),
            self.audit_sink(),
        )
    }

    pub fn amendments(&self) -> AmendmentEngine<SqliteStorage, SqliteStorage> {
        AmendmentEngine::new(
            self.crypto.clone(),
            self.store.clone(),
            self.clinician_keys.clone(),
            self.audit_sink(),
        )
    }

    pub fn notes(&self) -> PersonalNoteService<SqliteStorage, SqliteStorage> {
        PersonalNoteService::new(self.crypto.clone(), self.store.clone(), self.audit_sink())
    }

    /// Draft record with narrative `subjective("initial")` on a fresh confirmed appointment.
    pub fn draft_record(&self, author_id: &str) -> ClinicalRecord {
        let sessions = self.sessions();
        let author = Actor::clinician(author_id);
        let appointment = sessions
            .schedule_appointment(author_id, "patient-1", Utc::now())
            .expect("Should schedule");
        sessions
            .transition_appointment(&appointment.id, AppointmentStatus::Confirmed, &author)
            .expect("Should confirm");
        sessions
            .create_record(&appointment.id, &ClinicalNarrative::subjective("initial"), &author)
            .expect("Should create record")
    }

    pub fn signed_record(&self, author_id: &str) -> ClinicalRecord {
        let record = self.draft_record(author_id);
        self.sessions()
            .sign_record(&record.id, record.revision, &Actor::clinician(author_id), None)
            .expect("Should sign")
    }

    pub fn reload(&self, record_id: &str) -> ClinicalRecord {
        self.store
            .find_record(record_id)
            .expect("Should query")
            .expect("Record exists")
    }
}
