//! Token storage for claude-gate.
//!
//! Tokens are [`TokenRecord`]s keyed by provider name (e.g. `"anthropic"`)
//! inside one of a closed set of backends:
//!
//! - [`FileStorage`]: a single owner-only JSON file
//! - [`KeyringStorage`]: the OS keyring, one item per provider
//! - [`ClaudeCodeStorage`]: read-only access to Claude Code's credentials
//!
//! [`StorageFactory`] picks and builds a backend from a [`StorageConfig`],
//! and [`StorageMigrator`] moves records between backends.

pub mod backend;
pub mod claude_code;
pub mod error;
pub mod factory;
pub mod file;
mod fsutil;
pub mod keyring;
pub mod migrator;
pub mod record;
pub mod secret_store;

pub use backend::{SharedBackend, Storage, StorageBackend, StorageMetrics};
pub use claude_code::{CLAUDE_CODE_PROVIDER, ClaudeCodeStorage, CredentialSource};
pub use error::{MigrationError, Result, StorageError, StorageErrorKind, classify};
pub use factory::{StorageConfig, StorageFactory, StorageKind, default_base_dir};
pub use file::FileStorage;
pub use keyring::{DEFAULT_SERVICE_NAME, KeyringConfig, KeyringStorage};
pub use migrator::{MigrationReport, StorageMigrator};
pub use record::{REFRESH_BUFFER_SECS, TokenKind, TokenRecord, now_secs};
pub use secret_store::{ItemAttributes, MemorySecretStore, OsSecretStore, SecretStore};
