//! Clinical narrative content.
//!
//! The narrative is the protected plaintext of a session record (and of each
//! addendum). Its canonical text form is compact JSON with camelCase keys and
//! absent sections omitted; that is exactly what gets encrypted.

use serde::{Deserialize, Serialize};

/// Structured session narrative (SOAP-style sections plus free text).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalNarrative {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjective_report: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective_observations: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interventions: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_notes: Option<String>,
}

impl ClinicalNarrative {
    /// Narrative with only the subjective report filled in.
    #[must_use]
    pub fn subjective(report: impl Into<String>) -> Self {
        Self {
            subjective_report: Some(report.into()),
            ..Self::default()
        }
    }

    /// Canonical byte form handed to the cipher.
    ///
    /// # Errors
    /// Returns the serializer error (not expected for this type).
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the canonical byte form.
    ///
    /// # Errors
    /// Returns error if the bytes are not a JSON object of narrative sections.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Names of the sections that carry content.
    #[must_use]
    pub fn present_sections(&self) -> Vec<&'static str> {
        [
            ("subjectiveReport", &self.subjective_report),
            ("objectiveObservations", &self.objective_observations),
            ("assessment", &self.assessment),
            ("plan", &self.plan),
            ("interventions", &self.interventions),
            ("riskAssessment", &self.risk_assessment),
            ("additionalNotes", &self.additional_notes),
        ]
        .into_iter()
        .filter(|(_, v)| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
        .map(|(name, _)| name)
        .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present_sections().is_empty()
    }
}

// Narratives are PHI: Debug shows which sections are present, never their text.
impl std::fmt::Debug for ClinicalNarrative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClinicalNarrative")
            .field("sections", &self.present_sections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form_omits_absent_sections() {
        let narrative = ClinicalNarrative::subjective("initial");
        let bytes = narrative.to_canonical_bytes().expect("Should serialize");
        assert_eq!(bytes, br#"{"subjectiveReport":"initial"}"#);
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(ClinicalNarrative::from_canonical_bytes(b"\"just a string\"").is_err());
        assert!(ClinicalNarrative::from_canonical_bytes(b"not json").is_err());
    }

    #[test]
    fn test_debug_hides_text() {
        let narrative = ClinicalNarrative {
            assessment: Some("patient disclosed something sensitive".to_string()),
            ..ClinicalNarrative::default()
        };
        let debug_output = format!("{narrative:?}");
        assert!(!debug_output.contains("sensitive"));
        assert!(debug_output.contains("assessment"));
        assert!(!narrative.is_empty());
        assert!(ClinicalNarrative::default().is_empty());
    }
}
