//! Clinician-held Ed25519 attestations over integrity fingerprints.
//!
//! The integrity fingerprint alone is a keyless hash: it ties content to an
//! actor and time but anyone with the inputs can recompute it. An attestation
//! adds a signature from a key only the clinician holds.
//!
//! The public key carried inside an attestation proves nothing by itself.
//! It is accepted only when it matches a [`ClinicianKey`] enrolled for the
//! signing actor and still valid at the attested time; see
//! [`ClinicianAttestation::verify_registered`].
//!
//! The clinician commits to `signed_at`; the service accepts it only inside
//! [`MAX_CLOCK_SKEW_SECS`] of its own clock.

use base64::engine::general_purpose;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use super::crypto::integrity_fingerprint;

/// Allowed distance between the attested timestamp and the service clock.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttestationError {
    #[error("Invalid attestation public key")]
    InvalidPublicKey,

    #[error("Invalid attestation signature encoding")]
    InvalidSignatureEncoding,

    #[error("Attestation signature does not verify")]
    SignatureMismatch,

    #[error("Attested timestamp {0} is outside the accepted clock window")]
    ClockSkew(DateTime<Utc>),

    #[error("No enrolled attestation key for {0} matches the presented key")]
    UnregisteredKey(String),

    #[error("Attestation key for {0} was revoked before the attested time")]
    KeyRevoked(String),
}

/// A public key enrolled for one clinician.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicianKey {
    pub clinician_id: String,
    /// Canonical standard base64 of the 32-byte Ed25519 public key.
    pub public_key_b64: String,
    pub registered_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ClinicianKey {
    /// Validate and canonicalize `public_key_b64` for enrollment.
    ///
    /// # Errors
    /// `InvalidPublicKey` unless it decodes to a valid Ed25519 point.
    pub fn new(
        clinician_id: impl Into<String>,
        public_key_b64: &str,
        registered_at: DateTime<Utc>,
    ) -> Result<Self, AttestationError> {
        Ok(Self {
            clinician_id: clinician_id.into(),
            public_key_b64: canonical_public_key(public_key_b64)?,
            registered_at,
            revoked_at: None,
        })
    }

    /// Whether the key had not been revoked yet at `at`.
    #[must_use]
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.revoked_at.map_or(true, |revoked| at < revoked)
    }
}

/// Re-encode a base64 Ed25519 public key in canonical form.
///
/// # Errors
/// `InvalidPublicKey` for bad encoding, wrong length or an invalid point.
pub fn canonical_public_key(public_key_b64: &str) -> Result<String, AttestationError> {
    let key = decode_verifying_key(public_key_b64)?;
    Ok(general_purpose::STANDARD.encode(key.to_bytes()))
}

fn decode_verifying_key(public_key_b64: &str) -> Result<VerifyingKey, AttestationError> {
    let bytes = general_purpose::STANDARD
        .decode(public_key_b64.trim())
        .map_err(|_| AttestationError::InvalidPublicKey)?;
    let pubkey: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| AttestationError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&pubkey).map_err(|_| AttestationError::InvalidPublicKey)
}

/// Ed25519 signature by the signing clinician over the integrity fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicianAttestation {
    pub signed_at: DateTime<Utc>,
    pub public_key_b64: String,
    pub signature_b64: String,
}

impl ClinicianAttestation {
    /// Produce an attestation client-side.
    #[must_use]
    pub fn sign(
        signing_key: &SigningKey,
        resource_id: &str,
        actor_id: &str,
        signed_at: DateTime<Utc>,
    ) -> Self {
        let fingerprint = integrity_fingerprint(resource_id, actor_id, signed_at);
        let signature: Signature = signing_key.sign(fingerprint.as_bytes());
        Self {
            signed_at,
            public_key_b64: general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes()),
            signature_b64: general_purpose::STANDARD.encode(signature.to_bytes()),
        }
    }

    /// Verify that `actor_id` produced this attestation over `fingerprint`.
    ///
    /// `registered` is the enrolled key the store returned for
    /// `(actor_id, self.public_key_b64)`, if any. The signature is only
    /// checked against that enrolled key, never against the embedded one.
    ///
    /// # Errors
    /// `UnregisteredKey` if nothing is enrolled for this actor and key,
    /// `KeyRevoked` if the key was not valid at `signed_at`, then the clock
    /// window and signature checks.
    pub fn verify_registered(
        &self,
        registered: Option<&ClinicianKey>,
        actor_id: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AttestationError> {
        let presented = canonical_public_key(&self.public_key_b64)?;
        let enrolled = registered
            .filter(|k| k.clinician_id == actor_id && k.public_key_b64 == presented)
            .ok_or_else(|| AttestationError::UnregisteredKey(actor_id.to_string()))?;
        if !enrolled.is_valid_at(self.signed_at) {
            return Err(AttestationError::KeyRevoked(actor_id.to_string()));
        }
        self.verify_signature(&enrolled.public_key_b64, fingerprint, now)
    }

    fn verify_signature(
        &self,
        public_key_b64: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AttestationError> {
        if (now - self.signed_at).num_seconds().abs() > MAX_CLOCK_SKEW_SECS {
            return Err(AttestationError::ClockSkew(self.signed_at));
        }

        let verifying_key = decode_verifying_key(public_key_b64)?;

        let sig_bytes = general_purpose::STANDARD
            .decode(self.signature_b64.trim())
            .map_err(|_| AttestationError::InvalidSignatureEncoding)?;
        let sig_bytes: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AttestationError::InvalidSignatureEncoding)?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(fingerprint.as_bytes(), &signature)
            .map_err(|_| AttestationError::SignatureMismatch)
    }
}
