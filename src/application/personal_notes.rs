//! Personal ("shadow") notes: owner-only text sealed under a per-user key.
//!
//! Notes are never visible to supervisors or auditors. Deletion writes a
//! tombstone; the ciphertext stays in storage.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use zeroize::Zeroizing;

use super::{storage, CryptoEngine};
use crate::adapters::StorageError;
use crate::domain::PersonalNote;
use crate::ports::{AuditAction, AuditEvent, AuditSink, KeyStore, RecordStore};
use crate::{ClinvaultError, Result};

const NOTE: &str = "personal_note";

pub struct PersonalNoteService<K, R>
where
    K: KeyStore,
    R: RecordStore,
{
    crypto: Arc<CryptoEngine<K>>,
    records: Arc<R>,
    audit: Arc<dyn AuditSink>,
}

impl<K, R> PersonalNoteService<K, R>
where
    K: KeyStore,
    K::Error: Into<StorageError>,
    R: RecordStore,
    R::Error: Into<StorageError>,
{
    pub fn new(crypto: Arc<CryptoEngine<K>>, records: Arc<R>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            crypto,
            records,
            audit,
        }
    }

    /// Seal `text` for `owner_id`, optionally alongside a clinical record.
    ///
    /// # Errors
    /// `NotFound` if `record_id` names no live record, `Validation` for an
    /// empty owner, or an encryption error.
    pub fn create_note(&self, owner_id: &str, text: &str, record_id: Option<&str>) -> Result<PersonalNote> {
        if let Some(record_id) = record_id {
            let live = self
                .records
                .find_record(record_id)
                .map_err(storage)?
                .filter(|r| !r.is_deleted());
            if live.is_none() {
                return Err(ClinvaultError::NotFound(format!("record {record_id}")));
            }
        }

        let sealed = self.crypto.encrypt_personal_note(text, owner_id)?;
        let note = PersonalNote::new(owner_id, record_id.map(str::to_string), sealed);
        self.records.insert_note(&note).map_err(storage)?;

        self.audit.log(
            AuditEvent::success(AuditAction::PersonalNoteCreate, NOTE, &note.id)
                .actor(Some(owner_id))
                .details(json!({ "record_id": note.record_id })),
        );
        Ok(note)
    }

    /// # Errors
    /// `NotFound` for missing or deleted notes, `Forbidden` for anyone but the
    /// owner, `Decryption` if the ciphertext does not open.
    pub fn read_note(&self, note_id: &str, requester_id: &str) -> Result<Zeroizing<String>> {
        let note = self.load_owned(note_id, requester_id)?;
        Ok(self.crypto.decrypt_personal_note(&note.sealed, requester_id, note_id)?)
    }

    /// Replace the note text. Notes are not part of the legal record and carry
    /// no version history.
    ///
    /// # Errors
    /// Same as [`Self::read_note`], plus encryption errors.
    pub fn update_note(&self, note_id: &str, requester_id: &str, text: &str) -> Result<PersonalNote> {
        let mut note = self.load_owned(note_id, requester_id)?;
        note.sealed = self.crypto.encrypt_personal_note(text, requester_id)?;
        note.updated_at = Utc::now();

        if !self.records.update_note(&note).map_err(storage)? {
            return Err(ClinvaultError::NotFound(format!("note {note_id}")));
        }
        self.audit
            .log(AuditEvent::success(AuditAction::PersonalNoteUpdate, NOTE, note_id).actor(Some(requester_id)));
        Ok(note)
    }

    /// Live notes of `owner_id`, newest first. Content stays sealed.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub fn list_notes(&self, owner_id: &str) -> Result<Vec<PersonalNote>> {
        self.records.list_notes(owner_id).map_err(storage)
    }

    /// Tombstone a note.
    ///
    /// # Errors
    /// Same as [`Self::read_note`] minus decryption.
    pub fn delete_note(&self, note_id: &str, requester_id: &str) -> Result<PersonalNote> {
        let mut note = self.load_owned(note_id, requester_id)?;
        let now = Utc::now();
        note.deleted_at = Some(now);
        note.updated_at = now;

        if !self.records.update_note(&note).map_err(storage)? {
            return Err(ClinvaultError::NotFound(format!("note {note_id}")));
        }
        self.audit
            .log(AuditEvent::success(AuditAction::PersonalNoteDelete, NOTE, note_id).actor(Some(requester_id)));
        Ok(note)
    }

    fn load_owned(&self, note_id: &str, requester_id: &str) -> Result<PersonalNote> {
        let note = self
            .records
            .find_note(note_id)
            .map_err(storage)?
            .filter(|n| !n.is_deleted())
            .ok_or_else(|| ClinvaultError::NotFound(format!("note {note_id}")))?;

        if note.owner_id != requester_id {
            tracing::warn!(note_id = %note_id, "Personal note access by non-owner refused");
            self.audit.log(
                AuditEvent::failure(AuditAction::Decrypt, NOTE, note_id, "not the owner").actor(Some(requester_id)),
            );
            return Err(ClinvaultError::Forbidden(format!("note {note_id} belongs to another user")));
        }
        Ok(note)
    }
}
