//! Key manager: versioned purpose keys derived from the master secret.
//!
//! Owns the master secret and the process-local cache of derived keys. Only
//! key *metadata* is persisted through [`KeyStore`]; any instance holding the
//! same master secret re-derives identical key bytes from `{purpose, version}`,
//! so caches never need to be synchronized across instances.
//!
//! # Rotation
//!
//! A successor key is derived before anything is persisted, then committed
//! together with the deactivation of its predecessor through
//! [`KeyStore::activate_successor`]. A failed rotation leaves the old key active.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use super::storage;
use crate::adapters::StorageError;
use crate::domain::{kdf, uuid_v4, DataKey, KeyError, KeyMetadata, KeyPurpose, MasterSecret};
use crate::ports::{AuditAction, AuditEvent, AuditSink, KeyStore};
use crate::{ClinvaultError, Result};

const RESOURCE: &str = "encryption_key";

/// Outcome of [`KeyManager::rotate_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRotation {
    /// The key that was active before, now inactive. `None` if the purpose had no key yet.
    pub old_key: Option<KeyMetadata>,
    pub new_key: KeyMetadata,
}

pub struct KeyManager<K>
where
    K: KeyStore,
{
    master: MasterSecret,
    store: Arc<K>,
    audit: Arc<dyn AuditSink>,
    key_lifetime: Option<Duration>,
    /// key id -> derived key
    keys: RwLock<HashMap<String, DataKey>>,
    /// purpose -> active key metadata
    active: RwLock<HashMap<KeyPurpose, KeyMetadata>>,
    /// Serializes create/rotate within this process.
    rotation: Mutex<()>,
}

impl<K> KeyManager<K>
where
    K: KeyStore,
    K::Error: Into<StorageError>,
{
    pub fn new(master: MasterSecret, store: Arc<K>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            master,
            store,
            audit,
            key_lifetime: None,
            keys: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            rotation: Mutex::new(()),
        }
    }

    /// Apply an expiry to every key created from now on.
    #[must_use]
    pub fn with_key_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.key_lifetime = lifetime;
        self
    }

    /// The active, usable key for `purpose`, creating or rolling over as needed.
    ///
    /// # Errors
    /// Returns error if storage fails or a rollover loses a rotation race.
    pub fn get_active_key(&self, purpose: KeyPurpose) -> Result<KeyMetadata> {
        if let Some(cached) = self.cached_active(purpose) {
            if cached.is_usable_for_encryption() {
                return Ok(cached);
            }
        }

        let _guard = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        match self.store.find_active_key(purpose).map_err(storage)? {
            Some(current) if current.is_usable_for_encryption() => {
                self.cache_active(&current);
                Ok(current)
            }
            Some(stale) => {
                tracing::info!(
                    key_id = %stale.id,
                    purpose = %purpose,
                    version = stale.version,
                    "Active key expired or revoked; rolling over"
                );
                let new_key = self.commit_successor(purpose, Some(&stale))?;
                self.audit_rotation(Some(&stale), &new_key, "rollover");
                Ok(new_key)
            }
            None => {
                let new_key = self.commit_successor(purpose, None)?;
                self.audit.log(
                    AuditEvent::success(AuditAction::KeyCreate, RESOURCE, &new_key.id)
                        .details(json!({ "purpose": purpose, "version": new_key.version })),
                );
                Ok(new_key)
            }
        }
    }

    /// Create the next version for `purpose` and make it the active key.
    ///
    /// Any currently active key is retired in the same transaction.
    ///
    /// # Errors
    /// Returns error if derivation or storage fails.
    pub fn create_key(&self, purpose: KeyPurpose) -> Result<KeyMetadata> {
        let _guard = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.store.find_active_key(purpose).map_err(storage)?;
        let new_key = self.commit_successor(purpose, current.as_ref())?;

        self.audit.log(
            AuditEvent::success(AuditAction::KeyCreate, RESOURCE, &new_key.id)
                .details(json!({ "purpose": purpose, "version": new_key.version })),
        );
        Ok(new_key)
    }

    /// Deactivate the current key for `purpose` and activate its successor.
    ///
    /// Data under the old key stays decryptable.
    ///
    /// # Errors
    /// Returns error if derivation or storage fails, or a concurrent rotation
    /// won. The old key remains active in every error case.
    pub fn rotate_key(&self, purpose: KeyPurpose) -> Result<KeyRotation> {
        let _guard = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);

        let outcome = self
            .store
            .find_active_key(purpose)
            .map_err(storage)
            .and_then(|old_key| {
                let new_key = self.commit_successor(purpose, old_key.as_ref())?;
                Ok(KeyRotation { old_key, new_key })
            });

        match outcome {
            Ok(rotation) => {
                self.audit_rotation(rotation.old_key.as_ref(), &rotation.new_key, "manual");
                Ok(rotation)
            }
            Err(e) => {
                tracing::warn!(purpose = %purpose, error = %e, "Key rotation failed");
                self.audit.log(
                    AuditEvent::failure(AuditAction::KeyRotate, RESOURCE, purpose.as_str(), e.to_string())
                        .details(json!({ "purpose": purpose })),
                );
                Err(e)
            }
        }
    }

    /// Raw key for `key_id`, from cache or re-derived from persisted metadata.
    ///
    /// # Errors
    /// `KeyError::NotFound` if no metadata exists for `key_id`.
    pub fn get_key_by_id(&self, key_id: &str) -> Result<DataKey> {
        if let Some(key) = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_id)
        {
            return Ok(key.clone());
        }

        let metadata = self.key_metadata(key_id)?;
        let key = kdf::derive_purpose_key(&self.master, metadata.purpose, metadata.version)?;
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(metadata.id, key.clone());
        Ok(key)
    }

    /// # Errors
    /// `KeyError::NotFound` if no metadata exists for `key_id`.
    pub fn key_metadata(&self, key_id: &str) -> Result<KeyMetadata> {
        self.store
            .find_key(key_id)
            .map_err(storage)?
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()).into())
    }

    /// Key derivable only from `user_id`. Not cached and never persisted.
    ///
    /// # Errors
    /// Returns `Validation` for an empty user id.
    pub fn derive_user_personal_key(&self, user_id: &str) -> Result<DataKey> {
        if user_id.trim().is_empty() {
            return Err(ClinvaultError::Validation("user id must not be empty".into()));
        }
        Ok(kdf::derive_user_personal_key(&self.master, user_id)?)
    }

    /// Check that `key_id` may still be used to decrypt.
    ///
    /// Rotated keys pass with a warning.
    ///
    /// # Errors
    /// `KeyError::NotFound`, `KeyError::Revoked` or `KeyError::Expired`.
    pub fn validate_key_for_decryption(&self, key_id: &str) -> Result<KeyMetadata> {
        let metadata = self.key_metadata(key_id)?;
        if metadata.is_revoked() {
            return Err(KeyError::Revoked(key_id.to_string()).into());
        }
        if metadata.is_expired() {
            return Err(KeyError::Expired(key_id.to_string()).into());
        }
        if !metadata.is_active {
            tracing::warn!(
                key_id = %metadata.id,
                purpose = %metadata.purpose,
                version = metadata.version,
                "Decrypting with a rotated key; consider migrating the data"
            );
        }
        Ok(metadata)
    }

    /// Revoke a key. Data under it becomes unreadable; an active revoked key is
    /// replaced on the next [`Self::get_active_key`].
    ///
    /// # Errors
    /// `KeyError::NotFound` if the key does not exist.
    pub fn revoke_key(&self, key_id: &str, actor_id: Option<&str>) -> Result<KeyMetadata> {
        let now = Utc::now();
        let revoked = self.store.revoke_key(key_id, now).map_err(storage)?;
        let metadata = match self.key_metadata(key_id) {
            Ok(m) => m,
            Err(e) => {
                self.audit.log(
                    AuditEvent::failure(AuditAction::KeyRevoke, RESOURCE, key_id, e.to_string())
                        .actor(actor_id),
                );
                return Err(e);
            }
        };

        self.evict(&metadata);
        if revoked {
            tracing::warn!(key_id = %metadata.id, purpose = %metadata.purpose, "Key revoked");
            self.audit.log(
                AuditEvent::success(AuditAction::KeyRevoke, RESOURCE, &metadata.id)
                    .actor(actor_id)
                    .details(json!({ "purpose": metadata.purpose, "version": metadata.version })),
            );
        }
        Ok(metadata)
    }

    /// All key versions for `purpose`, newest first.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub fn list_keys(&self, purpose: KeyPurpose) -> Result<Vec<KeyMetadata>> {
        self.store.list_keys(purpose).map_err(storage)
    }

    /// Drop every cached key and active-key entry.
    pub fn clear_cache(&self) {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.active.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Caller must hold `self.rotation`.
    fn commit_successor(
        &self,
        purpose: KeyPurpose,
        retiring: Option<&KeyMetadata>,
    ) -> Result<KeyMetadata> {
        let version = self.store.latest_version(purpose).map_err(storage)?.unwrap_or(0) + 1;
        let key = kdf::derive_purpose_key(&self.master, purpose, version)?;

        let now = Utc::now();
        let metadata = KeyMetadata::new_active(
            uuid_v4(),
            purpose,
            version,
            now,
            self.expiry_from(now),
        );

        let committed = self
            .store
            .activate_successor(retiring.map(|k| k.id.as_str()), &metadata, now)
            .map_err(storage)?;
        if !committed {
            self.active
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&purpose);
            return Err(KeyError::RotationConflict(purpose).into());
        }

        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(metadata.id.clone(), key);
        self.cache_active(&metadata);

        tracing::info!(
            key_id = %metadata.id,
            purpose = %purpose,
            version,
            "Activated encryption key"
        );
        Ok(metadata)
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.key_lifetime.map(|lifetime| now + lifetime)
    }

    fn cached_active(&self, purpose: KeyPurpose) -> Option<KeyMetadata> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&purpose)
            .cloned()
    }

    fn cache_active(&self, metadata: &KeyMetadata) {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(metadata.purpose, metadata.clone());
    }

    fn evict(&self, metadata: &KeyMetadata) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&metadata.id);
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.get(&metadata.purpose).is_some_and(|k| k.id == metadata.id) {
            active.remove(&metadata.purpose);
        }
    }

    fn audit_rotation(&self, old_key: Option<&KeyMetadata>, new_key: &KeyMetadata, trigger: &str) {
        self.audit.log(
            AuditEvent::success(AuditAction::KeyRotate, RESOURCE, &new_key.id).details(json!({
                "purpose": new_key.purpose,
                "trigger": trigger,
                "old_key_id": old_key.map(|k| k.id.as_str()),
                "old_version": old_key.map(|k| k.version),
                "new_version": new_key.version,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteStorage;
    use crate::application::testing::{master, Fixture};

    /// Reads the version counter as it was before another process's rotation.
    struct LaggingVersions(Arc<SqliteStorage>);

    impl KeyStore for LaggingVersions {
        type Error = StorageError;

        fn find_key(&self, key_id: &str) -> std::result::Result<Option<KeyMetadata>, StorageError> {
            self.0.find_key(key_id)
        }

        fn find_active_key(
            &self,
            purpose: KeyPurpose,
        ) -> std::result::Result<Option<KeyMetadata>, StorageError> {
            self.0.find_active_key(purpose)
        }

        fn list_keys(&self, purpose: KeyPurpose) -> std::result::Result<Vec<KeyMetadata>, StorageError> {
            self.0.list_keys(purpose)
        }

        fn latest_version(&self, purpose: KeyPurpose) -> std::result::Result<Option<u32>, StorageError> {
            Ok(self.0.latest_version(purpose)?.and_then(|v| v.checked_sub(1)).filter(|v| *v > 0))
        }

        fn activate_successor(
            &self,
            retiring: Option<&str>,
            successor: &KeyMetadata,
            rotated_at: DateTime<Utc>,
        ) -> std::result::Result<bool, StorageError> {
            self.0.activate_successor(retiring, successor, rotated_at)
        }

        fn revoke_key(&self, key_id: &str, revoked_at: DateTime<Utc>) -> std::result::Result<bool, StorageError> {
            self.0.revoke_key(key_id, revoked_at)
        }

        fn set_key_expiry(
            &self,
            key_id: &str,
            expires_at: Option<DateTime<Utc>>,
        ) -> std::result::Result<bool, StorageError> {
            self.0.set_key_expiry(key_id, expires_at)
        }
    }

    #[test]
    fn test_first_request_creates_version_one() {
        let fx = Fixture::new();
        let key = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");
        assert_eq!(key.version, 1);
        assert!(key.is_active);

        let again = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should reuse");
        assert_eq!(again.id, key.id);
        assert_eq!(fx.audit_count(AuditAction::KeyCreate), 1);
    }

    #[test]
    fn test_purposes_are_versioned_independently() {
        let fx = Fixture::new();
        fx.keys.rotate_key(KeyPurpose::ClinicalNotes).expect("Should rotate");
        fx.keys.rotate_key(KeyPurpose::ClinicalNotes).expect("Should rotate");
        let shadow = fx.keys.get_active_key(KeyPurpose::ShadowNotes).expect("Should create");
        assert_eq!(shadow.version, 1);
    }

    #[test]
    fn test_rotation_continuity() {
        let fx = Fixture::new();
        let v1 = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");
        let v1_bytes = fx.keys.get_key_by_id(&v1.id).expect("Should derive");

        let rotation = fx.keys.rotate_key(KeyPurpose::ClinicalNotes).expect("Should rotate");
        let old = rotation.old_key.expect("Had an active key");
        assert_eq!(old.id, v1.id);
        assert_eq!(rotation.new_key.version, v1.version + 1);

        let stored_old = fx.keys.key_metadata(&v1.id).expect("Should load");
        assert!(!stored_old.is_active);
        assert!(stored_old.rotated_at.is_some());

        fx.keys.clear_cache();
        assert_eq!(fx.keys.get_key_by_id(&v1.id).expect("Should re-derive"), v1_bytes);
        assert_eq!(
            fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should load").id,
            rotation.new_key.id
        );

        let event = fx
            .audit
            .events()
            .into_iter()
            .find(|e| e.action == AuditAction::KeyRotate)
            .expect("Rotation audited");
        assert!(event.success);
        assert_eq!(event.resource_id, rotation.new_key.id);
    }

    #[test]
    fn test_instances_sharing_a_secret_derive_the_same_keys() {
        let fx = Fixture::new();
        let key = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");
        let bytes = fx.keys.get_key_by_id(&key.id).expect("Should derive");

        let other = KeyManager::new(master(), fx.store.clone(), fx.audit_sink());
        assert_eq!(other.get_key_by_id(&key.id).expect("Should derive"), bytes);
    }

    #[test]
    fn test_unknown_key_id() {
        let fx = Fixture::new();
        let err = fx.keys.get_key_by_id("missing").expect_err("Should fail");
        assert!(matches!(err, ClinvaultError::Key(KeyError::NotFound(id)) if id == "missing"));
    }

    #[test]
    fn test_expired_active_key_rolls_over() {
        let fx = Fixture::new();
        let v1 = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");
        fx.store
            .set_key_expiry(&v1.id, Some(Utc::now() - Duration::seconds(1)))
            .expect("Should expire");
        fx.keys.clear_cache();

        let v2 = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should roll over");
        assert_eq!(v2.version, 2);
        assert!(!fx.keys.key_metadata(&v1.id).expect("Should load").is_active);

        let err = fx.keys.validate_key_for_decryption(&v1.id).expect_err("Expired");
        assert!(matches!(err, ClinvaultError::Key(KeyError::Expired(_))));
    }

    #[test]
    fn test_key_lifetime_sets_expiry() {
        let fx = Fixture::new();
        let keys = KeyManager::new(master(), fx.store.clone(), fx.audit_sink())
            .with_key_lifetime(Some(Duration::days(30)));
        let key = keys.get_active_key(KeyPurpose::ShadowNotes).expect("Should create");
        let expires = key.expires_at.expect("Lifetime applied");
        assert!(expires > Utc::now() + Duration::days(29));
    }

    #[test]
    fn test_rotated_key_still_validates() {
        let fx = Fixture::new();
        let v1 = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");
        fx.keys.rotate_key(KeyPurpose::ClinicalNotes).expect("Should rotate");
        let meta = fx.keys.validate_key_for_decryption(&v1.id).expect("Rotated keys stay readable");
        assert!(!meta.is_active);
    }

    #[test]
    fn test_revoked_active_key_is_replaced() {
        let fx = Fixture::new();
        let v1 = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");
        let revoked = fx.keys.revoke_key(&v1.id, Some("admin-1")).expect("Should revoke");
        assert!(revoked.is_revoked());

        let err = fx.keys.validate_key_for_decryption(&v1.id).expect_err("Revoked");
        assert!(matches!(err, ClinvaultError::Key(KeyError::Revoked(_))));

        let v2 = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should replace");
        assert_eq!(v2.version, 2);
        assert_eq!(fx.audit_count(AuditAction::KeyRevoke), 1);
    }

    #[test]
    fn test_revoking_unknown_key_is_audited() {
        let fx = Fixture::new();
        assert!(fx.keys.revoke_key("nope", None).is_err());
        let events = fx.audit.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
    }

    #[test]
    fn test_personal_keys() {
        let fx = Fixture::new();
        let a1 = fx.keys.derive_user_personal_key("dr-a").expect("Should derive");
        let a2 = fx.keys.derive_user_personal_key("dr-a").expect("Should derive");
        let b = fx.keys.derive_user_personal_key("dr-b").expect("Should derive");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(fx.keys.derive_user_personal_key("  ").is_err());
    }

    #[test]
    fn test_list_keys_newest_first() {
        let fx = Fixture::new();
        fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");
        fx.keys.rotate_key(KeyPurpose::ClinicalNotes).expect("Should rotate");
        fx.keys.create_key(KeyPurpose::ClinicalNotes).expect("Should create");

        let keys = fx.keys.list_keys(KeyPurpose::ClinicalNotes).expect("Should list");
        assert_eq!(keys.iter().map(|k| k.version).collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(keys.iter().filter(|k| k.is_active).count(), 1);
    }

    #[test]
    fn test_rotation_conflict_keeps_old_key_active() {
        let fx = Fixture::new();
        let v1 = fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should create");

        // The successor is numbered v1 again and collides with the stored row.
        let lagging = KeyManager::new(master(), Arc::new(LaggingVersions(fx.store.clone())), fx.audit_sink());
        let err = lagging.rotate_key(KeyPurpose::ClinicalNotes).expect_err("Version already taken");
        assert!(matches!(
            err,
            ClinvaultError::Key(KeyError::RotationConflict(KeyPurpose::ClinicalNotes))
        ));

        assert_eq!(lagging.get_active_key(KeyPurpose::ClinicalNotes).expect("Should load").id, v1.id);
        fx.keys.clear_cache();
        assert_eq!(fx.keys.get_active_key(KeyPurpose::ClinicalNotes).expect("Should load").id, v1.id);
        let stored = fx.keys.key_metadata(&v1.id).expect("Should load");
        assert!(stored.is_active);
        assert!(stored.rotated_at.is_none());
        assert_eq!(fx.keys.list_keys(KeyPurpose::ClinicalNotes).expect("Should list").len(), 1);

        let failure = fx
            .audit
            .events()
            .into_iter()
            .find(|e| e.action == AuditAction::KeyRotate && !e.success)
            .expect("Failed rotation audited");
        assert!(failure.failure_reason.is_some());
        assert_eq!(fx.audit_count(AuditAction::KeyRotate), 0);
    }
}
