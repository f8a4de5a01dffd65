//! OS keyring token storage.
//!
//! Each provider is one secure-store item keyed `"<service>.<provider>"`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{MetricsRecorder, StorageBackend, StorageMetrics};
use crate::error::{Result, StorageError, classify};
use crate::record::TokenRecord;
use crate::secret_store::{ItemAttributes, OsSecretStore, SecretStore};

/// Default keyring service name.
pub const DEFAULT_SERVICE_NAME: &str = "claude-gate";

/// Keyring backend settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyringConfig {
    pub service_name: String,
    /// Let this application read its items without prompting (macOS).
    pub trust_application: bool,
    /// Restrict items to while the device is unlocked (macOS).
    pub accessible_when_unlocked: bool,
    /// Allow items to sync through the platform cloud keychain (macOS).
    pub synchronizable: bool,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            trust_application: true,
            accessible_when_unlocked: true,
            synchronizable: false,
        }
    }
}

/// Token storage in the OS keyring (or any [`SecretStore`]).
#[derive(Debug)]
pub struct KeyringStorage {
    store: Arc<dyn SecretStore>,
    config: KeyringConfig,
    // Serializes item writes with the store's key index.
    lock: Mutex<()>,
    metrics: MetricsRecorder,
}

impl KeyringStorage {
    /// Keyring storage on the OS secure store.
    pub fn open(config: KeyringConfig) -> Self {
        let store = Arc::new(OsSecretStore::new(config.service_name.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: KeyringConfig, store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            config,
            lock: Mutex::new(()),
            metrics: MetricsRecorder::default(),
        }
    }

    pub fn config(&self) -> &KeyringConfig {
        &self.config
    }

    fn item_key(&self, provider: &str) -> String {
        format!("{}.{}", self.config.service_name, provider)
    }

    fn attributes(&self, provider: &str) -> ItemAttributes {
        ItemAttributes {
            label: format!("Claude Gate - {}", provider),
            description: format!("OAuth token for {}", provider),
            trust_application: self.config.trust_application,
            accessible_when_unlocked: self.config.accessible_when_unlocked,
            synchronizable: self.config.synchronizable,
        }
    }
}

impl StorageBackend for KeyringStorage {
    fn get(&self, provider: &str) -> Result<Option<TokenRecord>> {
        self.metrics.track("get", || {
            let key = self.item_key(provider);
            let Some(raw) = self.store.get(&key).map_err(|e| classify("get", &e.0))? else {
                return Ok(None);
            };
            let record = serde_json::from_slice(&raw).map_err(|e| {
                StorageError::Corrupted(format!("failed to decode token for {}: {}", provider, e))
            })?;
            Ok(Some(record))
        })
    }

    fn set(&self, provider: &str, record: &TokenRecord) -> Result<()> {
        self.metrics.track("set", || {
            let data = serde_json::to_vec(record).map_err(|e| {
                StorageError::Corrupted(format!("failed to encode token for {}: {}", provider, e))
            })?;

            let _guard = self.lock.lock();
            self.store
                .set(&self.item_key(provider), &data, &self.attributes(provider))
                .map_err(|e| classify("set", &e.0))?;
            debug!(provider, store = %self.store.name(), "Stored token");
            Ok(())
        })
    }

    fn remove(&self, provider: &str) -> Result<()> {
        self.metrics.track("remove", || {
            let _guard = self.lock.lock();
            self.store
                .remove(&self.item_key(provider))
                .map_err(|e| classify("remove", &e.0))
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        self.metrics.track("list", || {
            let prefix = format!("{}.", self.config.service_name);
            let keys = self.store.keys().map_err(|e| classify("list", &e.0))?;
            Ok(keys
                .iter()
                .filter_map(|key| key.strip_prefix(&prefix))
                .filter(|provider| !provider.is_empty())
                .map(str::to_string)
                .collect())
        })
    }

    fn is_available(&self) -> bool {
        self.store.keys().is_ok()
    }

    fn name(&self) -> String {
        format!("keyring:{}", self.config.service_name)
    }

    fn metrics(&self) -> StorageMetrics {
        self.metrics.snapshot()
    }
}
