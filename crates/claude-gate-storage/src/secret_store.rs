//! Secure secret stores addressed by item key.
//!
//! [`SecretStore`] is the seam between the keyring-backed token storage and
//! the platform secure store. [`OsSecretStore`] talks to the OS keyring
//! (macOS Keychain, Linux secret-service, Windows Credential Manager) through
//! the `keyring` crate; [`MemorySecretStore`] keeps items in memory and can be
//! told to fail, which is how the keyring backend is exercised in tests.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::RwLock;

/// Attributes attached to an item when it is written.
///
/// The keychain flags only have meaning on platforms whose secure store
/// supports them; other stores ignore them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemAttributes {
    pub label: String,
    pub description: String,
    pub trust_application: bool,
    pub accessible_when_unlocked: bool,
    pub synchronizable: bool,
}

/// Native failure reported by a secret store, as text.
///
/// The text is classified into the storage error taxonomy by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SecretStoreError(pub String);

impl SecretStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A secure store of opaque secrets keyed by string.
pub trait SecretStore: Send + Sync + fmt::Debug {
    /// Read the item at `key`. A missing item is `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SecretStoreError>;

    fn set(&self, key: &str, data: &[u8], attributes: &ItemAttributes)
    -> Result<(), SecretStoreError>;

    /// Delete the item at `key`. Deleting a missing item succeeds.
    fn remove(&self, key: &str) -> Result<(), SecretStoreError>;

    /// Every item key held by this store.
    fn keys(&self) -> Result<Vec<String>, SecretStoreError>;

    fn name(&self) -> String;
}

// ─────────────────────────────────────────────────────────────────────────────
// OS keyring
// ─────────────────────────────────────────────────────────────────────────────

/// Keyring user holding the JSON list of item keys written under a service.
const INDEX_USER: &str = "__claude_gate_index__";

/// Secret store backed by the OS keyring for one service name.
///
/// The keyring cannot enumerate its items, so the keys this store writes are
/// tracked in an index item under the same service.
#[derive(Debug, Clone)]
pub struct OsSecretStore {
    service: String,
}

impl OsSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

#[cfg(feature = "keyring")]
mod os {
    use super::{INDEX_USER, SecretStoreError};

    fn describe(err: ::keyring::Error) -> SecretStoreError {
        let message = match err {
            ::keyring::Error::PlatformFailure(e) => format!("platform failure: {}", e),
            ::keyring::Error::NoStorageAccess(e) => format!("no storage access: {}", e),
            ::keyring::Error::BadEncoding(_) => "bad encoding in stored secret".to_string(),
            ::keyring::Error::TooLong(attr, max) => {
                format!("attribute '{}' too long (max {})", attr, max)
            }
            ::keyring::Error::Invalid(attr, reason) => format!("invalid {}: {}", attr, reason),
            ::keyring::Error::Ambiguous(_) => "ambiguous credential".to_string(),
            other => other.to_string(),
        };
        SecretStoreError(message)
    }

    fn entry(service: &str, user: &str) -> Result<::keyring::Entry, SecretStoreError> {
        // Never touch the developer's real keychain from unit tests.
        if cfg!(test) {
            return Err(SecretStoreError::new(
                "keyring access disabled in tests (unsupported)",
            ));
        }
        ::keyring::Entry::new(service, user).map_err(describe)
    }

    pub(super) fn read(service: &str, user: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        match entry(service, user)?.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(::keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(describe(e)),
        }
    }

    pub(super) fn write(service: &str, user: &str, data: &[u8]) -> Result<(), SecretStoreError> {
        entry(service, user)?.set_secret(data).map_err(describe)
    }

    pub(super) fn delete(service: &str, user: &str) -> Result<(), SecretStoreError> {
        match entry(service, user)?.delete_credential() {
            Ok(()) | Err(::keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(describe(e)),
        }
    }

    pub(super) fn read_index(service: &str) -> Result<Vec<String>, SecretStoreError> {
        match read(service, INDEX_USER)? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| SecretStoreError(format!("malformed key index: {}", e))),
        }
    }

    pub(super) fn write_index(service: &str, keys: &[String]) -> Result<(), SecretStoreError> {
        if keys.is_empty() {
            return delete(service, INDEX_USER);
        }
        let raw = serde_json::to_vec(keys)
            .map_err(|e| SecretStoreError(format!("malformed key index: {}", e)))?;
        write(service, INDEX_USER, &raw)
    }
}

#[cfg(not(feature = "keyring"))]
mod os {
    use super::SecretStoreError;

    fn unsupported() -> SecretStoreError {
        SecretStoreError::new("keyring support not compiled in (enable the 'keyring' feature)")
    }

    pub(super) fn read(_service: &str, _user: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        Err(unsupported())
    }

    pub(super) fn write(_service: &str, _user: &str, _data: &[u8]) -> Result<(), SecretStoreError> {
        Err(unsupported())
    }

    pub(super) fn delete(_service: &str, _user: &str) -> Result<(), SecretStoreError> {
        Err(unsupported())
    }

    pub(super) fn read_index(_service: &str) -> Result<Vec<String>, SecretStoreError> {
        Err(unsupported())
    }

    pub(super) fn write_index(_service: &str, _keys: &[String]) -> Result<(), SecretStoreError> {
        Err(unsupported())
    }
}

impl SecretStore for OsSecretStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        os::read(&self.service, key)
    }

    fn set(
        &self,
        key: &str,
        data: &[u8],
        attributes: &ItemAttributes,
    ) -> Result<(), SecretStoreError> {
        tracing::debug!(
            service = %self.service,
            key,
            label = %attributes.label,
            "Writing keyring item"
        );
        os::write(&self.service, key, data)?;

        let mut keys = os::read_index(&self.service)?;
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
            os::write_index(&self.service, &keys)?;
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SecretStoreError> {
        os::delete(&self.service, key)?;

        let mut keys = os::read_index(&self.service)?;
        let before = keys.len();
        keys.retain(|k| k != key);
        if keys.len() != before {
            os::write_index(&self.service, &keys)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, SecretStoreError> {
        os::read_index(&self.service)
    }

    fn name(&self) -> String {
        format!("os-keyring:{}", self.service)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory secret store with injectable failures.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    items: RwLock<BTreeMap<String, (Vec<u8>, Option<ItemAttributes>)>>,
    failing_keys: RwLock<HashMap<String, String>>,
    fail_all: RwLock<Option<String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation touching `key` fail with `message`.
    pub fn fail_key(&self, key: impl Into<String>, message: impl Into<String>) {
        self.failing_keys.write().insert(key.into(), message.into());
    }

    /// Make every operation fail with `message`.
    pub fn fail_all(&self, message: impl Into<String>) {
        *self.fail_all.write() = Some(message.into());
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        self.failing_keys.write().clear();
        *self.fail_all.write() = None;
    }

    /// Store raw bytes at `key` without attributes or failure checks.
    pub fn insert_raw(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.items.write().insert(key.into(), (data.into(), None));
    }

    /// Attributes the item at `key` was last written with.
    pub fn attributes(&self, key: &str) -> Option<ItemAttributes> {
        self.items.read().get(key).and_then(|(_, attrs)| attrs.clone())
    }

    fn check(&self, key: Option<&str>) -> Result<(), SecretStoreError> {
        if let Some(message) = self.fail_all.read().as_ref() {
            return Err(SecretStoreError(message.clone()));
        }
        if let Some(key) = key
            && let Some(message) = self.failing_keys.read().get(key)
        {
            return Err(SecretStoreError(message.clone()));
        }
        Ok(())
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        self.check(Some(key))?;
        Ok(self.items.read().get(key).map(|(data, _)| data.clone()))
    }

    fn set(
        &self,
        key: &str,
        data: &[u8],
        attributes: &ItemAttributes,
    ) -> Result<(), SecretStoreError> {
        self.check(Some(key))?;
        self.items
            .write()
            .insert(key.to_string(), (data.to_vec(), Some(attributes.clone())));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SecretStoreError> {
        self.check(Some(key))?;
        self.items.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, SecretStoreError> {
        self.check(None)?;
        Ok(self.items.read().keys().cloned().collect())
    }

    fn name(&self) -> String {
        "memory".to_string()
    }
}
