//! Application layer: Use cases and services.
//!
//! This module orchestrates domain logic with ports to implement
//! key management, envelope encryption, clinician attestation keys and the
//! clinical record lifecycle.

mod amendment;
mod clinician_keys;
mod crypto_engine;
mod key_manager;
mod personal_notes;
mod sessions;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use amendment::{AddendumView, AmendmentEngine};
pub use clinician_keys::{ClinicianKeyRegistry, DynClinicianKeyStore};
pub use crypto_engine::CryptoEngine;
pub use key_manager::{KeyManager, KeyRotation};
pub use personal_notes::PersonalNoteService;
pub use sessions::{MigrationReport, SessionRecordService};

use crate::adapters::{SqliteStorage, StorageError};
use crate::config::Settings;
use crate::domain::MasterSecret;
use crate::ports::{AuditSink, ClinicianKeyStore, KeyStore, RecordStore};
use crate::ClinvaultError;

pub(crate) fn storage<E: Into<StorageError>>(err: E) -> ClinvaultError {
    ClinvaultError::Storage(err.into())
}

/// Every service wired to one store and one audit sink.
pub struct Services<S>
where
    S: KeyStore + RecordStore,
{
    pub keys: Arc<KeyManager<S>>,
    pub crypto: Arc<CryptoEngine<S>>,
    pub clinician_keys: Arc<ClinicianKeyRegistry>,
    pub sessions: SessionRecordService<S, S>,
    pub amendments: AmendmentEngine<S, S>,
    pub notes: PersonalNoteService<S, S>,
}

impl Services<SqliteStorage> {
    /// Open the SQLite database named by `settings`.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrated.
    pub fn open(
        settings: &Settings,
        master: MasterSecret,
        audit: Arc<dyn AuditSink>,
    ) -> crate::Result<Self> {
        let store = Arc::new(SqliteStorage::new(&settings.db_path)?);
        tracing::debug!(db_path = %settings.db_path.display(), "Opened clinical store");
        Ok(Self::with_dependencies(store, master, audit, settings))
    }
}

impl<S> Services<S>
where
    S: KeyStore + RecordStore + ClinicianKeyStore<Error = StorageError> + 'static,
    <S as KeyStore>::Error: Into<StorageError>,
    <S as RecordStore>::Error: Into<StorageError>,
{
    /// Composition root for an externally constructed store.
    pub fn with_dependencies(
        store: Arc<S>,
        master: MasterSecret,
        audit: Arc<dyn AuditSink>,
        settings: &Settings,
    ) -> Self {
        let keys = Arc::new(
            KeyManager::new(master, store.clone(), audit.clone())
                .with_key_lifetime(settings.key_lifetime),
        );
        let crypto = Arc::new(CryptoEngine::new(keys.clone(), audit.clone()));
        let registry: Arc<DynClinicianKeyStore> = store.clone();
        let clinician_keys = Arc::new(ClinicianKeyRegistry::new(registry, audit.clone()));
        Self {
            sessions: SessionRecordService::new(
                keys.clone(),
                crypto.clone(),
                store.clone(),
                clinician_keys.clone(),
                audit.clone(),
            ),
            amendments: AmendmentEngine::new(
                crypto.clone(),
                store.clone(),
                clinician_keys.clone(),
                audit.clone(),
            ),
            notes: PersonalNoteService::new(crypto.clone(), store, audit),
            keys,
            crypto,
            clinician_keys,
        }
    }
}
