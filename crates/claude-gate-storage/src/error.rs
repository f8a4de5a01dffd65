//! Error types for token storage.
//!
//! Every backend reports failures through the closed [`StorageError`]
//! taxonomy. Native errors (filesystem, OS keyring) are classified once at the
//! backend boundary so callers never match on third-party error values.

use std::fmt;
use std::io;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// The kind of a [`StorageError`], without its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    NotFound,
    Locked,
    Unavailable,
    AccessDenied,
    Corrupted,
    Timeout,
    ReadOnly,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageErrorKind::NotFound => "not_found",
            StorageErrorKind::Locked => "locked",
            StorageErrorKind::Unavailable => "unavailable",
            StorageErrorKind::AccessDenied => "access_denied",
            StorageErrorKind::Corrupted => "corrupted",
            StorageErrorKind::Timeout => "timeout",
            StorageErrorKind::ReadOnly => "read_only",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by storage backends.
///
/// `NotFound` exists for completeness: a missing record is reported as
/// `Ok(None)` by [`StorageBackend::get`](crate::StorageBackend::get), never as
/// an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage is locked - unlock required: {0}")]
    Locked(String),

    #[error("storage backend not available: {0}")]
    Unavailable(String),

    #[error("storage access denied: {0}")]
    AccessDenied(String),

    #[error("storage data corrupted: {0}")]
    Corrupted(String),

    #[error("storage operation timed out: {0}")]
    Timeout(String),

    #[error("storage is read-only: {0}")]
    ReadOnly(String),
}

impl StorageError {
    /// Build an error of the given kind.
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            StorageErrorKind::NotFound => StorageError::NotFound(message),
            StorageErrorKind::Locked => StorageError::Locked(message),
            StorageErrorKind::Unavailable => StorageError::Unavailable(message),
            StorageErrorKind::AccessDenied => StorageError::AccessDenied(message),
            StorageErrorKind::Corrupted => StorageError::Corrupted(message),
            StorageErrorKind::Timeout => StorageError::Timeout(message),
            StorageErrorKind::ReadOnly => StorageError::ReadOnly(message),
        }
    }

    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::NotFound(_) => StorageErrorKind::NotFound,
            StorageError::Locked(_) => StorageErrorKind::Locked,
            StorageError::Unavailable(_) => StorageErrorKind::Unavailable,
            StorageError::AccessDenied(_) => StorageErrorKind::AccessDenied,
            StorageError::Corrupted(_) => StorageErrorKind::Corrupted,
            StorageError::Timeout(_) => StorageErrorKind::Timeout,
            StorageError::ReadOnly(_) => StorageErrorKind::ReadOnly,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StorageError::NotFound(m)
            | StorageError::Locked(m)
            | StorageError::Unavailable(m)
            | StorageError::AccessDenied(m)
            | StorageError::Corrupted(m)
            | StorageError::Timeout(m)
            | StorageError::ReadOnly(m) => m,
        }
    }

    /// Classify a filesystem error.
    pub(crate) fn from_io(context: impl fmt::Display, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => StorageErrorKind::AccessDenied,
            io::ErrorKind::TimedOut => StorageErrorKind::Timeout,
            io::ErrorKind::InvalidData => StorageErrorKind::Corrupted,
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            _ => StorageErrorKind::Unavailable,
        };
        StorageError::new(kind, format!("{}: {}", context, err))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Native error classification
// ─────────────────────────────────────────────────────────────────────────────

/// One classification rule: if the lowercased native message contains any
/// needle, the error is of `kind`.
struct Rule {
    needles: &'static [&'static str],
    kind: StorageErrorKind,
}

/// Evaluated in order; the first match wins.
const RULES: &[Rule] = &[
    Rule {
        needles: &["locked", "unlock"],
        kind: StorageErrorKind::Locked,
    },
    Rule {
        needles: &["denied", "permission", "no storage access", "not authorized"],
        kind: StorageErrorKind::AccessDenied,
    },
    Rule {
        needles: &["timeout", "timed out"],
        kind: StorageErrorKind::Timeout,
    },
    Rule {
        needles: &["bad encoding", "corrupt", "malformed"],
        kind: StorageErrorKind::Corrupted,
    },
    Rule {
        needles: &["unsupported", "not supported", "not compiled in"],
        kind: StorageErrorKind::Unavailable,
    },
];

/// Classify a backend-native error message into the closed taxonomy.
///
/// Messages that match no rule are reported as `Unavailable`.
pub fn classify(operation: &str, native: &str) -> StorageError {
    let lowered = native.to_lowercase();
    let kind = RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|n| lowered.contains(n)))
        .map(|rule| rule.kind)
        .unwrap_or(StorageErrorKind::Unavailable);
    StorageError::new(kind, format!("{} failed: {}", operation, native))
}

// ─────────────────────────────────────────────────────────────────────────────
// Migration errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors produced by [`StorageMigrator`](crate::StorageMigrator) and
/// [`StorageFactory::create_with_migration`](crate::StorageFactory::create_with_migration).
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("failed to list providers from source: {0}")]
    ListSource(#[source] StorageError),

    #[error("failed to read token for {provider}: {source}")]
    Read {
        provider: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to write token for {provider}: {source}")]
    Write {
        provider: String,
        #[source]
        source: StorageError,
    },

    #[error("no token found for provider: {0}")]
    MissingSource(String),

    #[error("migration completed with errors: {migrated} migrated, {failed} failed")]
    Partial { migrated: usize, failed: usize },

    #[error("token mismatch for provider {0}")]
    Mismatch(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rules_in_order() {
        assert_eq!(
            classify("get", "Keychain is LOCKED").kind(),
            StorageErrorKind::Locked
        );
        assert_eq!(
            classify("set", "Permission denied by user").kind(),
            StorageErrorKind::AccessDenied
        );
        assert_eq!(
            classify("list", "operation timed out after 5s").kind(),
            StorageErrorKind::Timeout
        );
        assert_eq!(
            classify("get", "bad encoding: invalid utf-8").kind(),
            StorageErrorKind::Corrupted
        );
        assert_eq!(
            classify("get", "backend not supported").kind(),
            StorageErrorKind::Unavailable
        );
        assert_eq!(
            classify("get", "something else entirely").kind(),
            StorageErrorKind::Unavailable
        );
    }

    #[test]
    fn test_classify_first_match_wins() {
        // Matches both the locked and permission rules.
        let err = classify("get", "permission check failed: keyring locked");
        assert_eq!(err.kind(), StorageErrorKind::Locked);
        assert!(err.message().starts_with("get failed:"));
    }

    #[test]
    fn test_from_io_kinds() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            StorageError::from_io("write", &denied).kind(),
            StorageErrorKind::AccessDenied
        );
        let other = io::Error::other("disk on fire");
        assert_eq!(
            StorageError::from_io("write", &other).kind(),
            StorageErrorKind::Unavailable
        );
    }

    #[test]
    fn test_partial_migration_message() {
        let err = MigrationError::Partial {
            migrated: 2,
            failed: 1,
        };
        assert_eq!(
            err.to_string(),
            "migration completed with errors: 2 migrated, 1 failed"
        );
    }

    #[test]
    fn test_new_roundtrips_kind() {
        for kind in [
            StorageErrorKind::NotFound,
            StorageErrorKind::Locked,
            StorageErrorKind::Unavailable,
            StorageErrorKind::AccessDenied,
            StorageErrorKind::Corrupted,
            StorageErrorKind::Timeout,
            StorageErrorKind::ReadOnly,
        ] {
            let err = StorageError::new(kind, "msg");
            assert_eq!(err.kind(), kind);
            assert_eq!(err.message(), "msg");
        }
    }
}
