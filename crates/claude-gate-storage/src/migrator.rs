//! Copying tokens between storage backends.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::backend::{Storage, StorageBackend};
use crate::error::MigrationError;

type Result<T> = std::result::Result<T, MigrationError>;

/// Outcome of a successful [`StorageMigrator::migrate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Providers listed by the source but holding no record.
    pub skipped: usize,
    pub backup: Option<PathBuf>,
}

/// Moves every record from `source` to `destination`.
#[derive(Debug)]
pub struct StorageMigrator<'a> {
    source: &'a Storage,
    destination: &'a Storage,
    backup_dir: Option<PathBuf>,
}

impl<'a> StorageMigrator<'a> {
    /// A migrator that does not back up the source.
    pub fn new(source: &'a Storage, destination: &'a Storage) -> Self {
        Self {
            source,
            destination,
            backup_dir: None,
        }
    }

    /// Back up a file-based source into `dir` before migrating.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn without_backup(mut self) -> Self {
        self.backup_dir = None;
        self
    }

    /// Copy all records. One failed record does not stop the others.
    ///
    /// On full success a file-based source is renamed to its `.migrated`
    /// marker; on any failure an aggregate [`MigrationError::Partial`] is
    /// returned and the source is left in place.
    pub fn migrate(&self) -> Result<MigrationReport> {
        let providers = self.source.list().map_err(MigrationError::ListSource)?;
        if providers.is_empty() {
            info!(source = %self.source.name(), "No tokens to migrate");
            return Ok(MigrationReport::default());
        }

        let mut report = MigrationReport {
            backup: self.backup(),
            ..MigrationReport::default()
        };
        let mut failed = 0;

        for provider in &providers {
            let record = match self.source.get(provider) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Failed to read token for migration");
                    failed += 1;
                    continue;
                }
            };

            match self.destination.set(provider, &record) {
                Ok(()) => {
                    info!(provider = %provider, to = %self.destination.name(), "Migrated token");
                    report.migrated += 1;
                }
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Failed to write migrated token");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(MigrationError::Partial {
                migrated: report.migrated,
                failed,
            });
        }

        if let Some(file) = self.source.as_file()
            && let Err(e) = file.mark_migrated()
        {
            warn!(error = %e, "Failed to mark token file as migrated");
        }

        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            "Migration complete"
        );
        Ok(report)
    }

    /// Copy a single provider. A missing source record is an error here.
    pub fn migrate_provider(&self, provider: &str) -> Result<()> {
        let record = self
            .source
            .get(provider)
            .map_err(|source| MigrationError::Read {
                provider: provider.to_string(),
                source,
            })?
            .ok_or_else(|| MigrationError::MissingSource(provider.to_string()))?;

        self.destination
            .set(provider, &record)
            .map_err(|source| MigrationError::Write {
                provider: provider.to_string(),
                source,
            })?;

        info!(provider, to = %self.destination.name(), "Migrated token");
        Ok(())
    }

    /// Check that every source record is present and identical in the
    /// destination.
    pub fn verify_migration(&self) -> Result<()> {
        let providers = self.source.list().map_err(MigrationError::ListSource)?;

        for provider in &providers {
            let read = |storage: &Storage| {
                storage.get(provider).map_err(|source| MigrationError::Read {
                    provider: provider.clone(),
                    source,
                })
            };

            let Some(expected) = read(self.source)? else {
                continue;
            };
            match read(self.destination)? {
                Some(actual) if actual == expected => {}
                _ => return Err(MigrationError::Mismatch(provider.clone())),
            }
        }

        info!(count = providers.len(), "Migration verified");
        Ok(())
    }

    /// Migrate back from destination to source, without a backup.
    pub fn rollback(&self) -> Result<MigrationReport> {
        StorageMigrator::new(self.destination, self.source).migrate()
    }

    fn backup(&self) -> Option<PathBuf> {
        let dir = self.backup_dir.as_ref()?;
        let file = self.source.as_file()?;
        match file.backup_to(dir) {
            Ok(backup) => backup,
            Err(e) => {
                warn!(error = %e, "Failed to back up token file; continuing without backup");
                None
            }
        }
    }
}
