use std::{
    io::{ErrorKind, Write},
    path::{Component, Path, PathBuf},
};

use fs_err as fs;
use serde::{de::DeserializeOwned, Serialize};

/// Normalizes a manifest relative path: back-slashes become path separators
/// and `.` components are dropped.
pub(crate) fn normalize_relative_path(path: &Path) -> PathBuf {
    let as_str = path.to_string_lossy();
    let path = if as_str.contains('\\') {
        PathBuf::from(as_str.replace('\\', "/"))
    } else {
        path.to_path_buf()
    };
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Removes empty directories starting at `start` and walking upwards. Stops at
/// the first non-empty directory or when `stop_at` is reached (which is never
/// removed).
pub(crate) fn prune_empty_parents(start: &Path, stop_at: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        let is_empty = match dir.read_dir() {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => false,
        };
        if !is_empty || std::fs::remove_dir(dir).is_err() {
            break;
        }
        tracing::trace!("removed empty directory '{}'", dir.display());
        current = dir.parent();
    }
}

/// Returns true if both paths refer to the same file on disk (i.e. one is a
/// hard link of the other).
pub(crate) fn is_same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    same_file::is_same_file(a, b)
}

/// Removes a file or symlink. A missing file is not an error.
pub(crate) fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Returns true if something (including a broken symlink) exists at `path`.
pub(crate) fn entry_exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Adds the executable bits to the file at `path` (or the target of a link).
#[cfg(unix)]
pub(crate) fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    if mode & 0o111 != 0o111 {
        permissions.set_mode(mode | 0o111);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

/// Executability is not a permission on this platform.
#[cfg(not(unix))]
pub(crate) fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Reads a JSON document. Returns `None` if the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Atomically writes a JSON document by writing a temporary file next to the
/// destination and renaming it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)?;
    serde_json::to_writer_pretty(&mut temp, value)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    temp.flush()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(
            normalize_relative_path(Path::new("Data\\INI\\Object\\a.ini")),
            PathBuf::from("Data/INI/Object/a.ini")
        );
        assert_eq!(
            normalize_relative_path(Path::new("./Maps/a.map")),
            PathBuf::from("Maps/a.map")
        );
    }

    #[test]
    fn test_prune_empty_parents_stops_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let deep = root.join("a/b/c");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(root.join("a/keep.txt"), b"keep").unwrap();

        prune_empty_parents(&deep, &root);

        assert!(!root.join("a/b").exists());
        assert!(root.join("a").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_json_roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/doc.json");
        assert_eq!(read_json::<Vec<u32>>(&path).unwrap(), None);

        write_json_atomic(&path, &vec![1u32, 2, 3]).unwrap();
        assert_eq!(read_json::<Vec<u32>>(&path).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_is_same_file_detects_hard_links() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        std::fs::write(&a, b"same").unwrap();
        std::fs::hard_link(&a, &b).unwrap();
        std::fs::write(&c, b"same").unwrap();

        assert!(is_same_file(&a, &b).unwrap());
        assert!(!is_same_file(&a, &c).unwrap());
    }
}
