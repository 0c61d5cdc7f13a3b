//! Audit port: fire-and-forget sink for security-relevant events.
//!
//! Every decryption failure and every legally significant state change is
//! reported here before the corresponding error or result reaches the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Encrypt,
    Decrypt,
    KeyCreate,
    KeyRotate,
    KeyRevoke,
    AppointmentTransition,
    RecordCreate,
    RecordUpdate,
    RecordSubmit,
    RecordReturnToDraft,
    RecordSign,
    RecordDelete,
    RecordReencrypt,
    LegalHoldChange,
    AddendumCreate,
    AddendumSign,
    RecordVoid,
    PersonalNoteCreate,
    PersonalNoteUpdate,
    PersonalNoteDelete,
    ClinicianKeyRegister,
    ClinicianKeyRevoke,
}

/// One structured audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor_id: Option<String>,
    pub action: AuditAction,
    pub resource: String,
    pub resource_id: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub details: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn success(action: AuditAction, resource: &str, resource_id: impl Into<String>) -> Self {
        Self {
            actor_id: None,
            action,
            resource: resource.to_string(),
            resource_id: resource_id.into(),
            success: true,
            failure_reason: None,
            details: None,
            occurred_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn failure(
        action: AuditAction,
        resource: &str,
        resource_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason.into()),
            ..Self::success(action, resource, resource_id)
        }
    }

    #[must_use]
    pub fn actor(mut self, actor_id: Option<&str>) -> Self {
        self.actor_id = actor_id.map(str::to_string);
        self
    }

    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Receives audit events. Implementations must not fail the caller.
pub trait AuditSink: Send + Sync {
    fn log(&self, event: AuditEvent);
}
