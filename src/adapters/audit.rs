//! Audit sinks.
//!
//! `TracingAuditSink` emits one structured event per audit record on the
//! `clinvault::audit` target, so operators route it with an `EnvFilter`
//! directive. `MemoryAuditSink` keeps events in memory for assertions.

use std::sync::{Mutex, PoisonError};

use crate::ports::{AuditEvent, AuditSink};

/// Log target for audit events.
pub const AUDIT_TARGET: &str = "clinvault::audit";

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log(&self, event: AuditEvent) {
        let details = event
            .details
            .as_ref()
            .map(serde_json::Value::to_string)
            .unwrap_or_default();
        let actor = event.actor_id.as_deref().unwrap_or("-");

        if event.success {
            tracing::info!(
                target: AUDIT_TARGET,
                action = ?event.action,
                resource = %event.resource,
                resource_id = %event.resource_id,
                actor = %actor,
                details = %details,
                occurred_at = %event.occurred_at.to_rfc3339(),
                "audit"
            );
        } else {
            tracing::warn!(
                target: AUDIT_TARGET,
                action = ?event.action,
                resource = %event.resource,
                resource_id = %event.resource_id,
                actor = %actor,
                reason = event.failure_reason.as_deref().unwrap_or("-"),
                details = %details,
                occurred_at = %event.occurred_at.to_rfc3339(),
                "audit failure"
            );
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
