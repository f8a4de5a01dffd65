//! The storage backend contract and the closed set of backends.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::claude_code::ClaudeCodeStorage;
use crate::error::{Result, StorageError};
use crate::factory::StorageKind;
use crate::file::FileStorage;
use crate::keyring::KeyringStorage;
use crate::record::TokenRecord;

// ============================================================================
// StorageBackend Trait
// ============================================================================

/// Capability set every token storage backend implements.
///
/// Backends are multi-provider maps keyed by an opaque provider string.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Fetch the record for `provider`. A missing record is `Ok(None)`.
    fn get(&self, provider: &str) -> Result<Option<TokenRecord>>;

    /// Store `record` under `provider`, replacing any previous record.
    fn set(&self, provider: &str, record: &TokenRecord) -> Result<()>;

    /// Remove the record for `provider`. Removing a missing record succeeds.
    fn remove(&self, provider: &str) -> Result<()>;

    /// All provider names with a stored record.
    fn list(&self) -> Result<Vec<String>>;

    /// Cheap liveness probe. Never mutates state.
    fn is_available(&self) -> bool;

    fn requires_unlock(&self) -> bool {
        false
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }

    fn lock(&self) -> Result<()> {
        Ok(())
    }

    /// Whether `set`/`remove` can ever succeed on this backend.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Backend name for identification, e.g. `file:/home/me/.claude-gate/auth.json`.
    fn name(&self) -> String;

    /// Snapshot of operation metrics.
    fn metrics(&self) -> StorageMetrics;
}

/// Shared handle to any storage backend.
pub type SharedBackend = Arc<dyn StorageBackend>;

// ============================================================================
// Storage (closed set of backends)
// ============================================================================

/// One of the known storage backends.
#[derive(Debug)]
pub enum Storage {
    File(FileStorage),
    Keyring(KeyringStorage),
    ClaudeCode(ClaudeCodeStorage),
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        match self {
            Storage::File(_) => StorageKind::File,
            Storage::Keyring(_) => StorageKind::Keyring,
            Storage::ClaudeCode(_) => StorageKind::ClaudeCode,
        }
    }

    pub fn as_file(&self) -> Option<&FileStorage> {
        match self {
            Storage::File(file) => Some(file),
            _ => None,
        }
    }

    fn backend(&self) -> &dyn StorageBackend {
        match self {
            Storage::File(b) => b,
            Storage::Keyring(b) => b,
            Storage::ClaudeCode(b) => b,
        }
    }
}

impl StorageBackend for Storage {
    fn get(&self, provider: &str) -> Result<Option<TokenRecord>> {
        self.backend().get(provider)
    }

    fn set(&self, provider: &str, record: &TokenRecord) -> Result<()> {
        self.backend().set(provider, record)
    }

    fn remove(&self, provider: &str) -> Result<()> {
        self.backend().remove(provider)
    }

    fn list(&self) -> Result<Vec<String>> {
        self.backend().list()
    }

    fn is_available(&self) -> bool {
        self.backend().is_available()
    }

    fn requires_unlock(&self) -> bool {
        self.backend().requires_unlock()
    }

    fn unlock(&self) -> Result<()> {
        self.backend().unlock()
    }

    fn lock(&self) -> Result<()> {
        self.backend().lock()
    }

    fn is_read_only(&self) -> bool {
        self.backend().is_read_only()
    }

    fn name(&self) -> String {
        self.backend().name()
    }

    fn metrics(&self) -> StorageMetrics {
        self.backend().metrics()
    }
}

impl From<FileStorage> for Storage {
    fn from(value: FileStorage) -> Self {
        Storage::File(value)
    }
}

impl From<KeyringStorage> for Storage {
    fn from(value: KeyringStorage) -> Self {
        Storage::Keyring(value)
    }
}

impl From<ClaudeCodeStorage> for Storage {
    fn from(value: ClaudeCodeStorage) -> Self {
        Storage::ClaudeCode(value)
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Per-backend operation metrics. Purely observational.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageMetrics {
    pub operations: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    /// Latency of the most recent successful call, per operation.
    pub latencies: BTreeMap<String, Duration>,
    pub last_error: Option<String>,
    pub last_access: Option<DateTime<Utc>>,
}

impl StorageMetrics {
    pub fn total_operations(&self) -> u64 {
        self.operations.values().sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    inner: Mutex<StorageMetrics>,
}

impl MetricsRecorder {
    pub(crate) fn snapshot(&self) -> StorageMetrics {
        self.inner.lock().clone()
    }

    /// Run `f` as operation `op`, recording its count, latency and failure.
    pub(crate) fn track<T>(&self, op: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        {
            let mut m = self.inner.lock();
            *m.operations.entry(op.to_string()).or_insert(0) += 1;
            m.last_access = Some(Utc::now());
        }

        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        let mut m = self.inner.lock();
        match &result {
            Ok(_) => {
                m.latencies.insert(op.to_string(), elapsed);
            }
            Err(err) => record_error(&mut m, op, err),
        }
        result
    }
}

fn record_error(m: &mut StorageMetrics, op: &str, err: &StorageError) {
    *m.errors.entry(op.to_string()).or_insert(0) += 1;
    m.last_error = Some(err.to_string());
}
