//! Ports layer: Trait definitions for external collaborators.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the engines and external systems (key/record storage, the
//! clinician key registry, audit log).

mod audit;
mod storage;

pub use audit::{AuditAction, AuditEvent, AuditSink};
pub use storage::{ClinicianKeyStore, KeyStore, RecordStore};
