//! JSON file token storage.
//!
//! All providers live in one JSON document at a fixed path:
//!
//! ```json
//! {
//!   "anthropic": { "type": "oauth", "refresh": "...", "access": "...", "expires": 1735689600 }
//! }
//! ```
//!
//! The file is written atomically with owner-only permissions and is deleted
//! entirely when the last provider is removed.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::backend::{MetricsRecorder, StorageBackend, StorageMetrics};
use crate::error::{Result, StorageError};
use crate::fsutil;
use crate::record::TokenRecord;

/// Suffix appended to a file store once its contents have been migrated.
pub const MIGRATED_SUFFIX: &str = ".migrated";

type Document = BTreeMap<String, TokenRecord>;

/// Token storage backed by a single JSON file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: RwLock<()>,
    metrics: MetricsRecorder,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
            metrics: MetricsRecorder::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path the file is renamed to by [`mark_migrated`](Self::mark_migrated).
    pub fn migrated_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(MIGRATED_SUFFIX);
        PathBuf::from(name)
    }

    /// Copy the raw file into `backup_dir` as `auth-YYYYMMDD-HHMMSS.json`.
    ///
    /// Returns `Ok(None)` when there is no file to back up.
    pub fn backup_to(&self, backup_dir: &Path) -> Result<Option<PathBuf>> {
        let _guard = self.lock.read();

        let contents = match fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::from_io(
                    format!("failed to read '{}'", self.path.display()),
                    &e,
                ));
            }
        };

        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let backup = backup_dir.join(format!("auth-{}.json", stamp));
        fsutil::write_private(&backup, &contents)?;

        info!(backup = %backup.display(), "Backed up token file");
        Ok(Some(backup))
    }

    /// Rename the file to its `.migrated` marker, replacing a stale marker
    /// left by an earlier migration. A missing file is not an error.
    pub fn mark_migrated(&self) -> Result<()> {
        let _guard = self.lock.write();

        if !self.path.exists() {
            return Ok(());
        }

        let marker = self.migrated_path();
        match fs::remove_file(&marker) {
            Ok(()) => debug!(marker = %marker.display(), "Removed stale migration marker"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StorageError::from_io(
                    format!("failed to remove '{}'", marker.display()),
                    &e,
                ));
            }
        }

        fs::rename(&self.path, &marker).map_err(|e| {
            StorageError::from_io(
                format!("failed to rename '{}'", self.path.display()),
                &e,
            )
        })?;

        info!(marker = %marker.display(), "Marked token file as migrated");
        Ok(())
    }

    fn load(&self) -> Result<Document> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => {
                return Err(StorageError::from_io(
                    format!("failed to read '{}'", self.path.display()),
                    &e,
                ));
            }
        };

        if content.trim().is_empty() {
            return Ok(Document::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            StorageError::Corrupted(format!(
                "failed to parse '{}': {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, document: &Document) -> Result<()> {
        if document.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::from_io(
                    format!("failed to delete '{}'", self.path.display()),
                    &e,
                )),
            };
        }

        let json = serde_json::to_vec_pretty(document)
            .map_err(|e| StorageError::Corrupted(format!("failed to serialize tokens: {}", e)))?;
        fsutil::write_private(&self.path, &json)
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, provider: &str) -> Result<Option<TokenRecord>> {
        self.metrics.track("get", || {
            let _guard = self.lock.read();
            Ok(self.load()?.remove(provider))
        })
    }

    fn set(&self, provider: &str, record: &TokenRecord) -> Result<()> {
        self.metrics.track("set", || {
            let _guard = self.lock.write();
            let mut document = self.load()?;
            document.insert(provider.to_string(), record.clone());
            self.save(&document)?;
            debug!(provider, path = %self.path.display(), "Stored token");
            Ok(())
        })
    }

    fn remove(&self, provider: &str) -> Result<()> {
        self.metrics.track("remove", || {
            let _guard = self.lock.write();
            let mut document = self.load()?;
            if document.remove(provider).is_none() {
                return Ok(());
            }
            self.save(&document)?;
            debug!(provider, path = %self.path.display(), "Removed token");
            Ok(())
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        self.metrics.track("list", || {
            let _guard = self.lock.read();
            Ok(self.load()?.into_keys().collect())
        })
    }

    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn metrics(&self) -> StorageMetrics {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageErrorKind;
    use tempfile::TempDir;

    fn storage() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("auth.json"));
        (dir, storage)
    }

    #[test]
    fn test_set_then_get() {
        let (_dir, storage) = storage();
        let record = TokenRecord::oauth("A", "R", 1_700_000_000);
        storage.set("anthropic", &record).unwrap();
        assert_eq!(storage.get("anthropic").unwrap(), Some(record));
    }

    #[test]
    fn test_get_missing_is_none() {
        let (_dir, storage) = storage();
        assert_eq!(storage.get("anthropic").unwrap(), None);
        assert!(storage.list().unwrap().is_empty());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let (_dir, storage) = storage();
        storage.remove("anthropic").unwrap();
        storage.set("other", &TokenRecord::api_key("k")).unwrap();
        storage.remove("anthropic").unwrap();
        assert_eq!(storage.list().unwrap(), vec!["other".to_string()]);
    }

    #[test]
    fn test_removing_last_provider_deletes_file() {
        let (_dir, storage) = storage();
        storage.set("a", &TokenRecord::api_key("1")).unwrap();
        storage.set("b", &TokenRecord::api_key("2")).unwrap();

        storage.remove("a").unwrap();
        assert!(storage.path().exists());

        storage.remove("b").unwrap();
        assert!(!storage.path().exists());
        assert_eq!(storage.get("b").unwrap(), None);
    }

    #[test]
    fn test_file_format_uses_short_names() {
        let (_dir, storage) = storage();
        storage
            .set("anthropic", &TokenRecord::oauth("A", "R", 42))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(storage.path()).unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!({
                "anthropic": {"type": "oauth", "refresh": "R", "access": "A", "expires": 42}
            })
        );
    }

    #[test]
    fn test_corrupted_file_is_an_error() {
        let (_dir, storage) = storage();
        fs::write(storage.path(), "{not json").unwrap();

        let err = storage.get("anthropic").unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Corrupted);
        assert_eq!(storage.metrics().errors.get("get"), Some(&1));
    }

    #[test]
    fn test_empty_file_is_empty_store() {
        let (_dir, storage) = storage();
        fs::write(storage.path(), "  \n").unwrap();
        assert_eq!(storage.get("anthropic").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, storage) = storage();
        storage.set("anthropic", &TokenRecord::api_key("k")).unwrap();
        let mode = fs::metadata(storage.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_mark_migrated_is_idempotent() {
        let (_dir, storage) = storage();
        storage.set("anthropic", &TokenRecord::api_key("old")).unwrap();
        storage.mark_migrated().unwrap();
        assert!(!storage.path().exists());
        assert!(storage.migrated_path().exists());

        // A second migration replaces the stale marker.
        storage.set("anthropic", &TokenRecord::api_key("new")).unwrap();
        storage.mark_migrated().unwrap();
        let marker = fs::read_to_string(storage.migrated_path()).unwrap();
        assert!(marker.contains("new"));

        // Nothing left to mark.
        storage.mark_migrated().unwrap();
    }

    #[test]
    fn test_backup_copies_raw_file() {
        let (dir, storage) = storage();
        let backups = dir.path().join("backups");
        assert!(storage.backup_to(&backups).unwrap().is_none());

        storage.set("anthropic", &TokenRecord::api_key("k")).unwrap();
        let backup = storage.backup_to(&backups).unwrap().unwrap();

        let name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("auth-") && name.ends_with(".json"));
        assert_eq!(
            fs::read(&backup).unwrap(),
            fs::read(storage.path()).unwrap()
        );
    }

    #[test]
    fn test_metrics_count_operations() {
        let (_dir, storage) = storage();
        storage.set("a", &TokenRecord::api_key("1")).unwrap();
        storage.get("a").unwrap();
        storage.get("a").unwrap();
        storage.list().unwrap();

        let metrics = storage.metrics();
        assert_eq!(metrics.operations.get("get"), Some(&2));
        assert_eq!(metrics.operations.get("set"), Some(&1));
        assert_eq!(metrics.operations.get("list"), Some(&1));
        assert_eq!(metrics.total_errors(), 0);
        assert!(metrics.last_access.is_some());
        assert!(storage.name().starts_with("file:"));
    }
}
