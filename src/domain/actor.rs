//! Validated caller identity.
//!
//! Authentication happens upstream; this core only receives an already
//! verified id and role.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Clinician,
    Supervisor,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    #[must_use]
    pub fn clinician(id: impl Into<String>) -> Self {
        Self::new(id, Role::Clinician)
    }

    #[must_use]
    pub fn supervisor(id: impl Into<String>) -> Self {
        Self::new(id, Role::Supervisor)
    }

    /// Supervisor-level authority (supervisors and administrators).
    #[must_use]
    pub fn is_supervisor(&self) -> bool {
        matches!(self.role, Role::Supervisor | Role::Admin)
    }
}
