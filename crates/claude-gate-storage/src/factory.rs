//! Backend selection and construction.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{Storage, StorageBackend};
use crate::claude_code::{ClaudeCodeStorage, CredentialSource};
use crate::error::{MigrationError, Result};
use crate::file::FileStorage;
use crate::keyring::{KeyringConfig, KeyringStorage};
use crate::migrator::StorageMigrator;
use crate::secret_store::SecretStore;

/// Default directory for the token file and backups (`~/.claude-gate`).
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-gate")
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    /// Keyring when available, otherwise file.
    #[default]
    Auto,
    Keyring,
    File,
    ClaudeCode,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::Auto => "auto",
            StorageKind::Keyring => "keyring",
            StorageKind::File => "file",
            StorageKind::ClaudeCode => "claude-code",
        })
    }
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(StorageKind::Auto),
            "keyring" | "keychain" => Ok(StorageKind::Keyring),
            "file" => Ok(StorageKind::File),
            "claude-code" | "claude_code" | "claudecode" => Ok(StorageKind::ClaudeCode),
            other => Err(format!(
                "unknown storage type '{}' (expected auto, keyring, file or claude-code)",
                other
            )),
        }
    }
}

/// Storage configuration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Token file used by the file backend and as the migration source.
    pub file_path: PathBuf,
    /// Where pre-migration backups are written.
    pub backup_dir: PathBuf,
    pub keyring: KeyringConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            kind: StorageKind::Auto,
            file_path: base.join("auth.json"),
            backup_dir: base.join("backups"),
            keyring: KeyringConfig::default(),
        }
    }
}

/// Builds a [`Storage`] from a [`StorageConfig`].
#[derive(Debug, Clone)]
pub struct StorageFactory {
    config: StorageConfig,
    secret_store: Option<Arc<dyn SecretStore>>,
    claude_code_sources: Option<Vec<CredentialSource>>,
}

impl StorageFactory {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            secret_store: None,
            claude_code_sources: None,
        }
    }

    /// Back the keyring backend with `store` instead of the OS keyring.
    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    /// Read Claude Code credentials from `sources` instead of the OS keyring.
    pub fn with_claude_code_sources(mut self, sources: Vec<CredentialSource>) -> Self {
        self.claude_code_sources = Some(sources);
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Construct the configured backend.
    ///
    /// `auto` never fails: a keyring that cannot be opened or reports itself
    /// unavailable falls back to the file backend.
    pub fn create(&self) -> Result<Storage> {
        let storage = match self.config.kind {
            StorageKind::File => Storage::File(self.file()),
            StorageKind::Keyring => {
                let keyring = self.keyring();
                if !keyring.is_available() {
                    warn!(
                        backend = %keyring.name(),
                        "Keyring is not currently available; operations may fail"
                    );
                }
                Storage::Keyring(keyring)
            }
            StorageKind::ClaudeCode => Storage::ClaudeCode(self.claude_code()),
            StorageKind::Auto => {
                let keyring = self.keyring();
                if keyring.is_available() {
                    Storage::Keyring(keyring)
                } else {
                    info!(
                        path = %self.config.file_path.display(),
                        "Keyring unavailable, using file storage"
                    );
                    Storage::File(self.file())
                }
            }
        };

        info!(backend = %storage.name(), "Token storage selected");
        Ok(storage)
    }

    /// Construct the configured backend, first moving any tokens found in
    /// the default token file into it.
    ///
    /// Migration runs only when the created backend is writable and not
    /// itself file-based. Migration failures are fatal for this call.
    pub fn create_with_migration(&self) -> std::result::Result<Storage, MigrationError> {
        let target = self.create()?;
        if target.as_file().is_some() || target.is_read_only() {
            return Ok(target);
        }

        let source = Storage::File(self.file());
        let pending = source.list().map_err(MigrationError::ListSource)?;
        if pending.is_empty() {
            return Ok(target);
        }

        info!(
            count = pending.len(),
            from = %source.name(),
            to = %target.name(),
            "Migrating tokens to new storage backend"
        );
        StorageMigrator::new(&source, &target)
            .with_backup_dir(self.config.backup_dir.clone())
            .migrate()?;
        Ok(target)
    }

    fn file(&self) -> FileStorage {
        FileStorage::new(self.config.file_path.clone())
    }

    fn keyring(&self) -> KeyringStorage {
        match &self.secret_store {
            Some(store) => KeyringStorage::with_store(self.config.keyring.clone(), store.clone()),
            None => KeyringStorage::open(self.config.keyring.clone()),
        }
    }

    fn claude_code(&self) -> ClaudeCodeStorage {
        match &self.claude_code_sources {
            Some(sources) => ClaudeCodeStorage::with_sources(sources.clone()),
            None => ClaudeCodeStorage::open(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TokenRecord;
    use crate::secret_store::MemorySecretStore;
    use tempfile::TempDir;

    fn config(dir: &TempDir, kind: StorageKind) -> StorageConfig {
        StorageConfig {
            kind,
            file_path: dir.path().join("auth.json"),
            backup_dir: dir.path().join("backups"),
            keyring: KeyringConfig::default(),
        }
    }

    #[test]
    fn test_parse_storage_kind() {
        assert_eq!("auto".parse::<StorageKind>().unwrap(), StorageKind::Auto);
        assert_eq!("KEYRING".parse::<StorageKind>().unwrap(), StorageKind::Keyring);
        assert_eq!("file".parse::<StorageKind>().unwrap(), StorageKind::File);
        assert_eq!(
            "claude-code".parse::<StorageKind>().unwrap(),
            StorageKind::ClaudeCode
        );
        assert!("sqlite".parse::<StorageKind>().is_err());
        assert_eq!(StorageKind::ClaudeCode.to_string(), "claude-code");
    }

    #[test]
    fn test_explicit_file() {
        let dir = TempDir::new().unwrap();
        let storage = StorageFactory::new(config(&dir, StorageKind::File))
            .create()
            .unwrap();
        assert_eq!(storage.kind(), StorageKind::File);
        assert_eq!(storage.as_file().unwrap().path(), dir.path().join("auth.json"));
    }

    #[test]
    fn test_auto_prefers_available_keyring() {
        let dir = TempDir::new().unwrap();
        let storage = StorageFactory::new(config(&dir, StorageKind::Auto))
            .with_secret_store(Arc::new(MemorySecretStore::new()))
            .create()
            .unwrap();
        assert_eq!(storage.kind(), StorageKind::Keyring);
    }

    #[test]
    fn test_auto_falls_back_to_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemorySecretStore::new());
        store.fail_all("platform failure: no secret service");

        let storage = StorageFactory::new(config(&dir, StorageKind::Auto))
            .with_secret_store(store)
            .create()
            .unwrap();
        assert_eq!(storage.kind(), StorageKind::File);
    }

    #[test]
    fn test_auto_without_os_keyring_falls_back_to_file() {
        // The OS keyring is never reachable from unit tests.
        let dir = TempDir::new().unwrap();
        let storage = StorageFactory::new(config(&dir, StorageKind::Auto))
            .create()
            .unwrap();
        assert_eq!(storage.kind(), StorageKind::File);
    }

    #[test]
    fn test_create_with_migration_moves_file_tokens() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, StorageKind::Keyring);
        let file = FileStorage::new(cfg.file_path.clone());
        let record = TokenRecord::oauth("A", "R", 1_700_000_000);
        file.set("anthropic", &record).unwrap();

        let storage = StorageFactory::new(cfg)
            .with_secret_store(Arc::new(MemorySecretStore::new()))
            .create_with_migration()
            .unwrap();

        assert_eq!(storage.kind(), StorageKind::Keyring);
        assert_eq!(storage.get("anthropic").unwrap(), Some(record));
        assert!(!file.path().exists());
        assert!(file.migrated_path().exists());
        assert_eq!(std::fs::read_dir(dir.path().join("backups")).unwrap().count(), 1);
    }

    #[test]
    fn test_create_with_migration_leaves_file_backend_alone() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, StorageKind::Auto);
        let file = FileStorage::new(cfg.file_path.clone());
        file.set("anthropic", &TokenRecord::api_key("k")).unwrap();

        // Keyring unavailable: auto picks the same file, nothing to migrate.
        let storage = StorageFactory::new(cfg).create_with_migration().unwrap();
        assert_eq!(storage.kind(), StorageKind::File);
        assert!(file.path().exists());
        assert!(!file.migrated_path().exists());
    }

    #[test]
    fn test_create_with_migration_surfaces_failures() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, StorageKind::Keyring);
        FileStorage::new(cfg.file_path.clone())
            .set("anthropic", &TokenRecord::api_key("k"))
            .unwrap();

        let store = Arc::new(MemorySecretStore::new());
        store.fail_key("claude-gate.anthropic", "permission denied");
        let err = StorageFactory::new(cfg)
            .with_secret_store(store)
            .create_with_migration()
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Partial {
                migrated: 0,
                failed: 1
            }
        ));
    }
}
