//! Record state machine.
//!
//! Two coupled machines, both pure functions over a current state and a
//! requested target:
//!
//! ```text
//! Scheduling:  SCHEDULED ─┬─> CONFIRMED ─┬─> IN_PROGRESS ──> COMPLETED
//!                         ├─> CANCELLED  └─> CANCELLED
//!                         └─> NO_SHOW
//!
//! Legal:       DRAFT ──> PENDING_REVIEW ─┬─> SIGNED ─┬─> AMENDED ──> VOIDED
//!                 ^                      │           └─> VOIDED
//!                 └──────────────────────┘
//! ```
//!
//! Terminal states have no outgoing edges. Mutation gates (lock, legal hold)
//! live here too so every service checks them the same way, before any
//! cryptographic work is attempted.

use std::fmt;

use super::record::{Appointment, AppointmentStatus, ClinicalRecord, LegalStatus};

/// Illegal status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal transition {from} -> {to} for {resource_id}")]
pub struct StateTransitionError {
    pub from: String,
    pub to: String,
    pub resource_id: String,
}

/// A mutation rejected by a lifecycle gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateViolation {
    #[error("Record {0} is locked; corrections require an addendum")]
    Locked(String),

    #[error("Record {0} is under legal hold")]
    LegalHold(String),

    #[error("Record {0} has been deleted")]
    Deleted(String),

    #[error("Appointment {id} is {status}; clinical records require CONFIRMED")]
    AppointmentNotConfirmed { id: String, status: AppointmentStatus },
}

/// A status enum with a fixed edge set.
pub trait Lifecycle: Copy + Eq + fmt::Display + 'static {
    /// Targets reachable in one step.
    fn allowed_targets(self) -> &'static [Self];

    fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }
}

impl Lifecycle for AppointmentStatus {
    fn allowed_targets(self) -> &'static [Self] {
        use AppointmentStatus::*;
        match self {
            Scheduled => &[Confirmed, Cancelled, NoShow],
            Confirmed => &[InProgress, Cancelled],
            InProgress => &[Completed],
            Completed | Cancelled | NoShow => &[],
        }
    }
}

impl Lifecycle for LegalStatus {
    fn allowed_targets(self) -> &'static [Self] {
        use LegalStatus::*;
        match self {
            Draft => &[PendingReview],
            PendingReview => &[Signed, Draft],
            Signed => &[Amended, Voided],
            Amended => &[Voided],
            Voided => &[],
        }
    }
}

/// Validate a requested transition.
///
/// `from == to` is a no-op and always succeeds.
///
/// # Errors
/// Returns `StateTransitionError` if `from` is terminal or `to` is not an
/// allowed target of `from`.
pub fn validate_transition<S: Lifecycle>(
    from: S,
    to: S,
    resource_id: &str,
) -> Result<(), StateTransitionError> {
    if from == to {
        return Ok(());
    }
    if from.is_terminal() || !from.allowed_targets().contains(&to) {
        return Err(StateTransitionError {
            from: from.to_string(),
            to: to.to_string(),
            resource_id: resource_id.to_string(),
        });
    }
    Ok(())
}

#[must_use]
pub fn can_transition<S: Lifecycle>(from: S, to: S) -> bool {
    validate_transition(from, to, "").is_ok()
}

/// Signed, amended and voided records are immutable.
#[must_use]
pub fn is_immutable(status: LegalStatus) -> bool {
    matches!(status, LegalStatus::Signed | LegalStatus::Amended | LegalStatus::Voided)
}

/// `is_locked` must agree with the legal status.
#[must_use]
pub fn lock_state_consistent(record: &ClinicalRecord) -> bool {
    record.is_locked == is_immutable(record.legal_status)
}

/// Gate for any narrative edit. Must run before the cipher is touched.
///
/// # Errors
/// `Deleted` for tombstoned records, `Locked` when either the lock flag or the
/// legal status says the record is immutable.
pub fn ensure_editable(record: &ClinicalRecord) -> Result<(), GateViolation> {
    if record.is_deleted() {
        return Err(GateViolation::Deleted(record.id.clone()));
    }
    if record.is_locked || is_immutable(record.legal_status) {
        return Err(GateViolation::Locked(record.id.clone()));
    }
    Ok(())
}

/// Gate for deletion. Legal hold wins over every legal status.
///
/// # Errors
/// `LegalHold`, then `Deleted`, then `Locked`.
pub fn ensure_deletable(record: &ClinicalRecord) -> Result<(), GateViolation> {
    if record.legal_hold {
        return Err(GateViolation::LegalHold(record.id.clone()));
    }
    if record.is_deleted() {
        return Err(GateViolation::Deleted(record.id.clone()));
    }
    if record.is_locked || is_immutable(record.legal_status) {
        return Err(GateViolation::Locked(record.id.clone()));
    }
    Ok(())
}

/// Clinical records may only be opened against a confirmed appointment.
///
/// # Errors
/// Returns `AppointmentNotConfirmed` otherwise.
pub fn ensure_record_creatable(appointment: &Appointment) -> Result<(), GateViolation> {
    if appointment.status != AppointmentStatus::Confirmed {
        return Err(GateViolation::AppointmentNotConfirmed {
            id: appointment.id.clone(),
            status: appointment.status,
        });
    }
    Ok(())
}
