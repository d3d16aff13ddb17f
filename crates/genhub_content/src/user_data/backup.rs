//! Backups of user files that are displaced by installed content.
//!
//! Backups are stored as `backups/<game>/<relative dir>/<name>.<timestamp>.genhub-backup`
//! so several backups of the same file never collide.

use std::path::{Path, PathBuf};

use chrono::Utc;
use fs_err as fs;

use crate::{manifest::GameType, utils::remove_file_if_exists};

/// The extension of every backup file.
pub const BACKUP_EXTENSION: &str = "genhub-backup";

/// Copies `original` into the backup tree and returns the path of the backup.
pub(crate) fn backup_file(
    backups_root: &Path,
    game: GameType,
    relative_path: &Path,
    original: &Path,
) -> std::io::Result<PathBuf> {
    let mut directory = backups_root.join(game.to_string());
    if let Some(parent) = relative_path.parent() {
        directory.push(parent);
    }
    fs::create_dir_all(&directory)?;

    let file_name = original
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("file"));
    let timestamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let mut backup = directory.join(format!("{file_name}.{timestamp}.{BACKUP_EXTENSION}"));
    let mut attempt = 1;
    while backup.exists() {
        backup = directory.join(format!("{file_name}.{timestamp}-{attempt}.{BACKUP_EXTENSION}"));
        attempt += 1;
    }

    fs::copy(original, &backup)?;
    tracing::debug!(
        "backed up '{}' to '{}'",
        original.display(),
        backup.display()
    );
    Ok(backup)
}

/// Moves a backup back to `destination`, replacing whatever is there.
pub(crate) fn restore_backup(backup: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_file_if_exists(destination)?;
    if let Err(err) = std::fs::rename(backup, destination) {
        // Backups may live on another volume than the user data.
        tracing::debug!("failed to move backup, copying it instead: {err}");
        fs::copy(backup, destination)?;
        fs::remove_file(backup)?;
    }
    tracing::debug!(
        "restored '{}' from '{}'",
        destination.display(),
        backup.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("data/Maps/Desert/Desert.map");
        fs::create_dir_all(original.parent().unwrap()).unwrap();
        fs::write(&original, b"user map").unwrap();

        let backups = dir.path().join("backups");
        let first =
            backup_file(&backups, GameType::Generals, Path::new("Maps/Desert/Desert.map"), &original)
                .unwrap();
        let second =
            backup_file(&backups, GameType::Generals, Path::new("Maps/Desert/Desert.map"), &original)
                .unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(backups.join("Generals/Maps/Desert")));
        assert_eq!(
            first.extension().and_then(|e| e.to_str()),
            Some(BACKUP_EXTENSION)
        );

        fs::write(&original, b"installed map").unwrap();
        restore_backup(&first, &original).unwrap();
        assert_eq!(fs::read(&original).unwrap(), b"user map");
        assert!(!first.exists());
    }
}
