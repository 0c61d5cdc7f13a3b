//! Adapters layer: Concrete implementations of ports.
//!
//! - `sqlite`: SQLite persistence for keys and records
//! - `audit`: tracing-backed and in-memory audit sinks
//! - `sanitize`: log scrubbing for clinical content and key material

pub mod audit;
pub mod sanitize;
pub mod sqlite;

pub use audit::{MemoryAuditSink, TracingAuditSink, AUDIT_TARGET};
pub use sqlite::{SqliteStorage, StorageError};
