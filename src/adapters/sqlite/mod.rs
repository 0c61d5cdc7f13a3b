//! SQLite adapter: Implementation of `KeyStore`, `RecordStore` and
//! `ClinicianKeyStore`.
//!
//! Provides local persistence for key metadata, appointments, clinical
//! records, version snapshots, addendums, personal notes and enrolled
//! clinician attestation keys.
//!
//! # Security
//!
//! - Only key *metadata* is stored; key bytes are re-derived from the master secret
//! - Narratives, addendums and notes are stored as ciphertext + IV only
//! - A partial unique index allows at most one active key per purpose
//!
//! # Mutex Behavior
//!
//! The connection is protected by `Mutex`. A poisoned mutex (from a panic in
//! another thread) fails closed with `StorageError::LockPoisoned`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::domain::{
    Addendum, Appointment, AppointmentStatus, ClinicalRecord, ClinicianAttestation, ClinicianKey,
    EncryptedPayload, KeyMetadata, KeyPurpose, LegalStatus, PersonalNote, RecordVersion,
    SealedNote, VoidDetails,
};
use crate::ports::{ClinicianKeyStore, KeyStore, RecordStore};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

const RECORD_COLUMNS: &str = "id, appointment_id, author_id, narrative_encrypted, narrative_iv, \
     narrative_key_id, is_draft, is_locked, legal_status, signed_at, signature_hash, attestation, \
     legal_hold, revision, voided_by, voided_at, void_reason, void_justification, created_at, \
     updated_at, deleted_at";

const ADDENDUM_COLUMNS: &str = "id, record_id, sequence_number, content_encrypted, content_iv, \
     content_key_id, reason, author_id, signed_at, signature_hash, attestation, is_locked, created_at";

const NOTE_COLUMNS: &str = "id, owner_id, record_id, ciphertext, iv, created_at, updated_at, deleted_at";

/// SQLite storage adapter.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// # Errors
    /// Returns error if database cannot be opened or initialized.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing).
    ///
    /// # Errors
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS encryption_keys (
                id TEXT PRIMARY KEY,
                purpose TEXT NOT NULL,
                version INTEGER NOT NULL,
                algorithm TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                rotated_at TEXT,
                expires_at TEXT,
                revoked_at TEXT,
                UNIQUE (purpose, version)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_keys_one_active
                ON encryption_keys(purpose) WHERE is_active = 1;

            CREATE TABLE IF NOT EXISTS appointments (
                id TEXT PRIMARY KEY,
                clinician_id TEXT NOT NULL,
                patient_id TEXT NOT NULL,
                status TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS clinical_records (
                id TEXT PRIMARY KEY,
                appointment_id TEXT NOT NULL REFERENCES appointments(id),
                author_id TEXT NOT NULL,
                narrative_encrypted BLOB NOT NULL,
                narrative_iv BLOB NOT NULL,
                narrative_key_id TEXT NOT NULL,
                is_draft INTEGER NOT NULL,
                is_locked INTEGER NOT NULL,
                legal_status TEXT NOT NULL,
                signed_at TEXT,
                signature_hash TEXT,
                attestation TEXT,
                legal_hold INTEGER NOT NULL,
                revision INTEGER NOT NULL,
                voided_by TEXT,
                voided_at TEXT,
                void_reason TEXT,
                void_justification TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_records_key
                ON clinical_records(narrative_key_id);

            CREATE TABLE IF NOT EXISTS record_versions (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL REFERENCES clinical_records(id),
                revision INTEGER NOT NULL,
                narrative_encrypted BLOB NOT NULL,
                narrative_iv BLOB NOT NULL,
                narrative_key_id TEXT NOT NULL,
                edited_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (record_id, revision)
            );

            CREATE TABLE IF NOT EXISTS addendums (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL REFERENCES clinical_records(id),
                sequence_number INTEGER NOT NULL,
                content_encrypted BLOB NOT NULL,
                content_iv BLOB NOT NULL,
                content_key_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                author_id TEXT NOT NULL,
                signed_at TEXT,
                signature_hash TEXT,
                attestation TEXT,
                is_locked INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (record_id, sequence_number)
            );

            CREATE TABLE IF NOT EXISTS personal_notes (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                record_id TEXT,
                ciphertext BLOB NOT NULL,
                iv BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_notes_owner
                ON personal_notes(owner_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS clinician_keys (
                clinician_id TEXT NOT NULL,
                public_key_b64 TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                revoked_at TEXT,
                PRIMARY KEY (clinician_id, public_key_b64)
            );
            ",
        )?;

        Ok(())
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(column: &str, message: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{column}: {message}").into(),
    )
}

fn get_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn get_opt_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(column, e))
    })
    .transpose()
}

fn get_parsed<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e| conversion_error(column, e))
}

fn get_attestation(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<ClinicianAttestation>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(column, e)))
        .transpose()
}

fn attestation_json(attestation: Option<&ClinicianAttestation>) -> Result<Option<String>, StorageError> {
    attestation
        .map(|a| serde_json::to_string(a).map_err(|e| StorageError::Serialization(e.to_string())))
        .transpose()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<KeyMetadata> {
    Ok(KeyMetadata {
        id: row.get("id")?,
        purpose: get_parsed::<KeyPurpose>(row, "purpose")?,
        version: row.get("version")?,
        algorithm: row.get("algorithm")?,
        is_active: row.get("is_active")?,
        created_at: get_ts(row, "created_at")?,
        rotated_at: get_opt_ts(row, "rotated_at")?,
        expires_at: get_opt_ts(row, "expires_at")?,
        revoked_at: get_opt_ts(row, "revoked_at")?,
    })
}

fn clinician_key_from_row(row: &Row<'_>) -> rusqlite::Result<ClinicianKey> {
    Ok(ClinicianKey {
        clinician_id: row.get("clinician_id")?,
        public_key_b64: row.get("public_key_b64")?,
        registered_at: get_ts(row, "registered_at")?,
        revoked_at: get_opt_ts(row, "revoked_at")?,
    })
}

fn appointment_from_row(row: &Row<'_>) -> rusqlite::Result<Appointment> {
    Ok(Appointment {
        id: row.get("id")?,
        clinician_id: row.get("clinician_id")?,
        patient_id: row.get("patient_id")?,
        status: get_parsed::<AppointmentStatus>(row, "status")?,
        scheduled_for: get_ts(row, "scheduled_for")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ClinicalRecord> {
    let voided_by: Option<String> = row.get("voided_by")?;
    let void_details = match (voided_by, get_opt_ts(row, "voided_at")?) {
        (Some(voided_by), Some(voided_at)) => Some(VoidDetails {
            voided_by,
            voided_at,
            reason: row.get::<_, Option<String>>("void_reason")?.unwrap_or_default(),
            justification: row
                .get::<_, Option<String>>("void_justification")?
                .unwrap_or_default(),
        }),
        _ => None,
    };
    let revision: i64 = row.get("revision")?;

    Ok(ClinicalRecord {
        id: row.get("id")?,
        appointment_id: row.get("appointment_id")?,
        author_id: row.get("author_id")?,
        narrative_encrypted: row.get("narrative_encrypted")?,
        narrative_iv: row.get("narrative_iv")?,
        narrative_key_id: row.get("narrative_key_id")?,
        is_draft: row.get("is_draft")?,
        is_locked: row.get("is_locked")?,
        legal_status: get_parsed::<LegalStatus>(row, "legal_status")?,
        signed_at: get_opt_ts(row, "signed_at")?,
        signature_hash: row.get("signature_hash")?,
        attestation: get_attestation(row, "attestation")?,
        legal_hold: row.get("legal_hold")?,
        revision: u64::try_from(revision).map_err(|e| conversion_error("revision", e))?,
        void_details,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        deleted_at: get_opt_ts(row, "deleted_at")?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<RecordVersion> {
    let revision: i64 = row.get("revision")?;
    Ok(RecordVersion {
        id: row.get("id")?,
        record_id: row.get("record_id")?,
        revision: u64::try_from(revision).map_err(|e| conversion_error("revision", e))?,
        narrative: EncryptedPayload::new(
            row.get("narrative_encrypted")?,
            row.get("narrative_iv")?,
            row.get::<_, String>("narrative_key_id")?,
        ),
        edited_by: row.get("edited_by")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn addendum_from_row(row: &Row<'_>) -> rusqlite::Result<Addendum> {
    Ok(Addendum {
        id: row.get("id")?,
        record_id: row.get("record_id")?,
        sequence_number: row.get("sequence_number")?,
        content: EncryptedPayload::new(
            row.get("content_encrypted")?,
            row.get("content_iv")?,
            row.get::<_, String>("content_key_id")?,
        ),
        reason: row.get("reason")?,
        author_id: row.get("author_id")?,
        signed_at: get_opt_ts(row, "signed_at")?,
        signature_hash: row.get("signature_hash")?,
        attestation: get_attestation(row, "attestation")?,
        is_locked: row.get("is_locked")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<PersonalNote> {
    Ok(PersonalNote {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        record_id: row.get("record_id")?,
        sealed: SealedNote {
            ciphertext: row.get("ciphertext")?,
            iv: row.get("iv")?,
        },
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        deleted_at: get_opt_ts(row, "deleted_at")?,
    })
}

/// CAS write of every mutable record column. Returns rows changed (0 or 1).
fn write_record(
    conn: &Connection,
    record: &ClinicalRecord,
    expected_revision: u64,
) -> Result<usize, StorageError> {
    let attestation = attestation_json(record.attestation.as_ref())?;
    let void = record.void_details.as_ref();

    let changed = conn.execute(
        r"
        UPDATE clinical_records SET
            narrative_encrypted = ?1, narrative_iv = ?2, narrative_key_id = ?3,
            is_draft = ?4, is_locked = ?5, legal_status = ?6,
            signed_at = ?7, signature_hash = ?8, attestation = ?9,
            legal_hold = ?10, revision = ?11,
            voided_by = ?12, voided_at = ?13, void_reason = ?14, void_justification = ?15,
            updated_at = ?16, deleted_at = ?17
        WHERE id = ?18 AND revision = ?19
        ",
        params![
            record.narrative_encrypted,
            record.narrative_iv,
            record.narrative_key_id,
            record.is_draft,
            record.is_locked,
            record.legal_status.as_str(),
            record.signed_at.as_ref().map(ts),
            record.signature_hash,
            attestation,
            record.legal_hold,
            record.revision as i64,
            void.map(|v| v.voided_by.as_str()),
            void.map(|v| ts(&v.voided_at)),
            void.map(|v| v.reason.as_str()),
            void.map(|v| v.justification.as_str()),
            ts(&record.updated_at),
            record.deleted_at.as_ref().map(ts),
            record.id,
            expected_revision as i64,
        ],
    )?;
    Ok(changed)
}

impl KeyStore for SqliteStorage {
    type Error = StorageError;

    fn find_key(&self, key_id: &str) -> Result<Option<KeyMetadata>, Self::Error> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                "SELECT * FROM encryption_keys WHERE id = ?1",
                params![key_id],
                key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    fn find_active_key(&self, purpose: KeyPurpose) -> Result<Option<KeyMetadata>, Self::Error> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                "SELECT * FROM encryption_keys WHERE purpose = ?1 AND is_active = 1",
                params![purpose.as_str()],
                key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    fn list_keys(&self, purpose: KeyPurpose) -> Result<Vec<KeyMetadata>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM encryption_keys WHERE purpose = ?1 ORDER BY version DESC")?;
        let keys = stmt
            .query_map(params![purpose.as_str()], key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn latest_version(&self, purpose: KeyPurpose) -> Result<Option<u32>, Self::Error> {
        let conn = self.conn()?;
        let version: Option<u32> = conn.query_row(
            "SELECT MAX(version) FROM encryption_keys WHERE purpose = ?1",
            params![purpose.as_str()],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn activate_successor(
        &self,
        retiring: Option<&str>,
        successor: &KeyMetadata,
        rotated_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(old_id) = retiring {
            let changed = tx.execute(
                "UPDATE encryption_keys SET is_active = 0, rotated_at = ?2 WHERE id = ?1 AND is_active = 1",
                params![old_id, ts(&rotated_at)],
            )?;
            if changed == 0 {
                // Dropping the transaction rolls back.
                return Ok(false);
            }
        }

        let inserted = tx.execute(
            r"
            INSERT INTO encryption_keys (
                id, purpose, version, algorithm, is_active,
                created_at, rotated_at, expires_at, revoked_at
            ) VALUES (?1, ?2, ?3, ?4, 1, ?5, NULL, ?6, NULL)
            ",
            params![
                successor.id,
                successor.purpose.as_str(),
                successor.version,
                successor.algorithm,
                ts(&successor.created_at),
                successor.expires_at.as_ref().map(ts),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        tx.commit()?;
        tracing::debug!(
            purpose = %successor.purpose,
            version = successor.version,
            "Activated key version"
        );
        Ok(true)
    }

    fn revoke_key(&self, key_id: &str, revoked_at: DateTime<Utc>) -> Result<bool, Self::Error> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE encryption_keys SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
            params![key_id, ts(&revoked_at)],
        )?;
        Ok(changed == 1)
    }

    fn set_key_expiry(
        &self,
        key_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, Self::Error> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE encryption_keys SET expires_at = ?2 WHERE id = ?1",
            params![key_id, expires_at.as_ref().map(ts)],
        )?;
        Ok(changed == 1)
    }
}

impl RecordStore for SqliteStorage {
    type Error = StorageError;

    fn insert_appointment(&self, appointment: &Appointment) -> Result<(), Self::Error> {
        let conn = self.conn()?;
        conn.execute(
            r"
            INSERT INTO appointments (
                id, clinician_id, patient_id, status, scheduled_for, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                appointment.id,
                appointment.clinician_id,
                appointment.patient_id,
                appointment.status.as_str(),
                ts(&appointment.scheduled_for),
                ts(&appointment.created_at),
                ts(&appointment.updated_at),
            ],
        )?;
        Ok(())
    }

    fn find_appointment(&self, id: &str) -> Result<Option<Appointment>, Self::Error> {
        let conn = self.conn()?;
        let appointment = conn
            .query_row(
                "SELECT * FROM appointments WHERE id = ?1",
                params![id],
                appointment_from_row,
            )
            .optional()?;
        Ok(appointment)
    }

    fn update_appointment_status(
        &self,
        id: &str,
        expected: AppointmentStatus,
        status: AppointmentStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE appointments SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
            params![id, expected.as_str(), status.as_str(), ts(&updated_at)],
        )?;
        Ok(changed == 1)
    }

    fn insert_record(&self, record: &ClinicalRecord) -> Result<(), Self::Error> {
        let attestation = attestation_json(record.attestation.as_ref())?;
        let void = record.void_details.as_ref();
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO clinical_records ({RECORD_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
            ),
            params![
                record.id,
                record.appointment_id,
                record.author_id,
                record.narrative_encrypted,
                record.narrative_iv,
                record.narrative_key_id,
                record.is_draft,
                record.is_locked,
                record.legal_status.as_str(),
                record.signed_at.as_ref().map(ts),
                record.signature_hash,
                attestation,
                record.legal_hold,
                record.revision as i64,
                void.map(|v| v.voided_by.as_str()),
                void.map(|v| ts(&v.voided_at)),
                void.map(|v| v.reason.as_str()),
                void.map(|v| v.justification.as_str()),
                ts(&record.created_at),
                ts(&record.updated_at),
                record.deleted_at.as_ref().map(ts),
            ],
        )?;

        tracing::debug!(record_id = %record.id, "Inserted clinical record");
        Ok(())
    }

    fn find_record(&self, id: &str) -> Result<Option<ClinicalRecord>, Self::Error> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM clinical_records WHERE id = ?1"),
                params![id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn update_record(
        &self,
        record: &ClinicalRecord,
        expected_revision: u64,
    ) -> Result<bool, Self::Error> {
        let conn = self.conn()?;
        Ok(write_record(&conn, record, expected_revision)? == 1)
    }

    fn update_record_with_version(
        &self,
        record: &ClinicalRecord,
        expected_revision: u64,
        version: &RecordVersion,
    ) -> Result<bool, Self::Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if write_record(&tx, record, expected_revision)? == 0 {
            return Ok(false);
        }

        tx.execute(
            r"
            INSERT INTO record_versions (
                id, record_id, revision, narrative_encrypted, narrative_iv,
                narrative_key_id, edited_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                version.id,
                version.record_id,
                version.revision as i64,
                version.narrative.ciphertext,
                version.narrative.iv,
                version.narrative.key_id,
                version.edited_by,
                ts(&version.created_at),
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    fn list_records_not_under_key(&self, key_id: &str) -> Result<Vec<ClinicalRecord>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM clinical_records \
             WHERE narrative_key_id != ?1 AND deleted_at IS NULL ORDER BY created_at ASC"
        ))?;
        let records = stmt
            .query_map(params![key_id], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn list_versions(&self, record_id: &str) -> Result<Vec<RecordVersion>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM record_versions WHERE record_id = ?1 ORDER BY revision ASC")?;
        let versions = stmt
            .query_map(params![record_id], version_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    fn insert_addendum(&self, addendum: &Addendum) -> Result<(), Self::Error> {
        let attestation = attestation_json(addendum.attestation.as_ref())?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO addendums ({ADDENDUM_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                addendum.id,
                addendum.record_id,
                addendum.sequence_number,
                addendum.content.ciphertext,
                addendum.content.iv,
                addendum.content.key_id,
                addendum.reason,
                addendum.author_id,
                addendum.signed_at.as_ref().map(ts),
                addendum.signature_hash,
                attestation,
                addendum.is_locked,
                ts(&addendum.created_at),
            ],
        )?;
        Ok(())
    }

    fn find_addendum(&self, id: &str) -> Result<Option<Addendum>, Self::Error> {
        let conn = self.conn()?;
        let addendum = conn
            .query_row(
                &format!("SELECT {ADDENDUM_COLUMNS} FROM addendums WHERE id = ?1"),
                params![id],
                addendum_from_row,
            )
            .optional()?;
        Ok(addendum)
    }

    fn list_addendums(&self, record_id: &str) -> Result<Vec<Addendum>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ADDENDUM_COLUMNS} FROM addendums WHERE record_id = ?1 ORDER BY sequence_number ASC"
        ))?;
        let addendums = stmt
            .query_map(params![record_id], addendum_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(addendums)
    }

    fn max_addendum_sequence(&self, record_id: &str) -> Result<Option<u32>, Self::Error> {
        let conn = self.conn()?;
        let max: Option<u32> = conn.query_row(
            "SELECT MAX(sequence_number) FROM addendums WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    fn commit_addendum_signature(
        &self,
        addendum: &Addendum,
        record: &ClinicalRecord,
        expected_revision: u64,
    ) -> Result<bool, Self::Error> {
        let attestation = attestation_json(addendum.attestation.as_ref())?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let signed = tx.execute(
            r"
            UPDATE addendums
            SET signed_at = ?2, signature_hash = ?3, attestation = ?4, is_locked = 1
            WHERE id = ?1 AND is_locked = 0
            ",
            params![
                addendum.id,
                addendum.signed_at.as_ref().map(ts),
                addendum.signature_hash,
                attestation,
            ],
        )?;
        if signed == 0 {
            return Ok(false);
        }

        if write_record(&tx, record, expected_revision)? == 0 {
            return Ok(false);
        }

        tx.commit()?;
        Ok(true)
    }

    fn insert_note(&self, note: &PersonalNote) -> Result<(), Self::Error> {
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO personal_notes ({NOTE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                note.id,
                note.owner_id,
                note.record_id,
                note.sealed.ciphertext,
                note.sealed.iv,
                ts(&note.created_at),
                ts(&note.updated_at),
                note.deleted_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    fn find_note(&self, id: &str) -> Result<Option<PersonalNote>, Self::Error> {
        let conn = self.conn()?;
        let note = conn
            .query_row(
                &format!("SELECT {NOTE_COLUMNS} FROM personal_notes WHERE id = ?1"),
                params![id],
                note_from_row,
            )
            .optional()?;
        Ok(note)
    }

    fn update_note(&self, note: &PersonalNote) -> Result<bool, Self::Error> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r"
            UPDATE personal_notes
            SET ciphertext = ?2, iv = ?3, updated_at = ?4, deleted_at = ?5
            WHERE id = ?1 AND deleted_at IS NULL
            ",
            params![
                note.id,
                note.sealed.ciphertext,
                note.sealed.iv,
                ts(&note.updated_at),
                note.deleted_at.as_ref().map(ts),
            ],
        )?;
        Ok(changed == 1)
    }

    fn list_notes(&self, owner_id: &str) -> Result<Vec<PersonalNote>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTE_COLUMNS} FROM personal_notes \
             WHERE owner_id = ?1 AND deleted_at IS NULL ORDER BY created_at DESC"
        ))?;
        let notes = stmt
            .query_map(params![owner_id], note_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }
}

impl ClinicianKeyStore for SqliteStorage {
    type Error = StorageError;

    fn register_clinician_key(&self, key: &ClinicianKey) -> Result<bool, Self::Error> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r"
            INSERT INTO clinician_keys (clinician_id, public_key_b64, registered_at, revoked_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                key.clinician_id,
                key.public_key_b64,
                ts(&key.registered_at),
                key.revoked_at.as_ref().map(ts),
            ],
        );
        match inserted {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn find_clinician_key(
        &self,
        clinician_id: &str,
        public_key_b64: &str,
    ) -> Result<Option<ClinicianKey>, Self::Error> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                "SELECT * FROM clinician_keys WHERE clinician_id = ?1 AND public_key_b64 = ?2",
                params![clinician_id, public_key_b64],
                clinician_key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    fn list_clinician_keys(&self, clinician_id: &str) -> Result<Vec<ClinicianKey>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM clinician_keys WHERE clinician_id = ?1 ORDER BY registered_at ASC",
        )?;
        let keys = stmt
            .query_map(params![clinician_id], clinician_key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn revoke_clinician_key(
        &self,
        clinician_id: &str,
        public_key_b64: &str,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r"
            UPDATE clinician_keys SET revoked_at = ?3
            WHERE clinician_id = ?1 AND public_key_b64 = ?2 AND revoked_at IS NULL
            ",
            params![clinician_id, public_key_b64, ts(&revoked_at)],
        )?;
        Ok(changed == 1)
    }
}
