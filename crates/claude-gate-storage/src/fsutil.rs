//! Owner-only filesystem helpers shared by the file backend and backups.

use std::fs;
use std::path::Path;

use crate::error::{Result, StorageError};

/// Directory mode for storage and backup directories (owner only).
pub(crate) const DIR_MODE: u32 = 0o700;

/// File mode for token files and backups (owner read/write).
pub(crate) const FILE_MODE: u32 = 0o600;

/// Create `dir` and its parents if missing, restricting a newly created
/// directory to the owner.
pub(crate) fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(|e| {
        StorageError::from_io(format!("failed to create directory '{}'", dir.display()), &e)
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE)).map_err(|e| {
            StorageError::from_io(
                format!("failed to set permissions on '{}'", dir.display()),
                &e,
            )
        })?;
    }

    Ok(())
}

/// Atomically replace `path` with `contents`: write a sibling temp file with
/// owner-only permissions, then rename over the target.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&temp_path)
            .map_err(|e| {
                StorageError::from_io(
                    format!("failed to create temp file '{}'", temp_path.display()),
                    &e,
                )
            })?;
        file.write_all(contents)
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                StorageError::from_io(
                    format!("failed to write temp file '{}'", temp_path.display()),
                    &e,
                )
            })?;
    }

    #[cfg(not(unix))]
    {
        fs::write(&temp_path, contents).map_err(|e| {
            StorageError::from_io(
                format!("failed to write temp file '{}'", temp_path.display()),
                &e,
            )
        })?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StorageError::from_io(
            format!(
                "failed to rename '{}' to '{}'",
                temp_path.display(),
                path.display()
            ),
            &e,
        ));
    }

    Ok(())
}
