//! This module contains the logic to materialize a file from the CAS (or any
//! other source path) at a destination path. See [`materialize_file`] and
//! [`FileMaterializer`] for more information.
//!
//! Materializing a file is expressed as an ordered list of [`LinkMethod`]s
//! that are attempted one after another. The first method that succeeds
//! determines the [`Materialized`] outcome, so callers can tell a
//! deduplicated file (a link) apart from a duplicated one (a copy).

use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use fs_err as fs;
use genhub_cas::{CasError, ContentHash, ContentStore};
use simple_spawn_blocking::{tokio::run_blocking_task, Cancelled};

/// Describes the method to "link" a file from the source (usually the CAS) to
/// the destination.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum LinkMethod {
    /// A hard link is created from the source to the destination. The file does
    /// not take up more disk-space but if it is modified in place, the content
    /// in the CAS is modified as well.
    Hardlink,

    /// A symbolic link pointing at the source is created.
    Softlink,

    /// A copy of the source is created.
    Copy,
}

impl fmt::Display for LinkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMethod::Hardlink => write!(f, "hardlink"),
            LinkMethod::Softlink => write!(f, "softlink"),
            LinkMethod::Copy => write!(f, "copy"),
        }
    }
}

/// The successful outcome of materializing a file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Materialized {
    /// The destination is a link to the source.
    Linked(LinkMethod),
    /// The destination is an independent copy of the source.
    Copied,
}

impl Materialized {
    /// Returns true if the destination shares its storage with the source.
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, Materialized::Linked(_))
    }

    /// Returns the method that produced the file.
    pub fn method(&self) -> LinkMethod {
        match self {
            Materialized::Linked(method) => *method,
            Materialized::Copied => LinkMethod::Copy,
        }
    }
}

/// Errors that can occur when materializing a file.
#[derive(Debug, thiserror::Error)]
pub enum LinkFileError {
    /// The hash is not known to the CAS or its backing file is missing.
    #[error("content {0} is not available in the content store")]
    ContentNotFound(ContentHash),

    /// The CAS failed to resolve the content.
    #[error("failed to resolve content")]
    ContentStoreError(#[from] CasError),

    /// An IO error occurred.
    #[error("unexpected io operation while {0}")]
    IoError(String, #[source] std::io::Error),

    /// Every requested method failed. Carries the error of the last attempt.
    #[error("failed to {0} file to destination")]
    FailedToLink(LinkMethod, #[source] std::io::Error),

    /// No link method was requested.
    #[error("no link method was requested")]
    NoLinkMethods,

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<Cancelled> for LinkFileError {
    fn from(_: Cancelled) -> Self {
        LinkFileError::Cancelled
    }
}

/// Materializes `source_path` at `destination_path` by trying each method of
/// `attempts` in order. Any file or symlink that already exists at the
/// destination is replaced; the parent directory is created when missing.
///
/// A failing attempt that is followed by another attempt is logged and the
/// next method is tried. If the last attempt fails its error is returned.
pub fn materialize_file(
    source_path: &Path,
    destination_path: &Path,
    attempts: &[LinkMethod],
) -> Result<Materialized, LinkFileError> {
    let (last, fallbacks) = attempts
        .split_last()
        .ok_or(LinkFileError::NoLinkMethods)?;

    if let Some(parent) = destination_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            LinkFileError::IoError(String::from("creating the destination directory"), e)
        })?;
    }

    for (idx, &method) in fallbacks.iter().enumerate() {
        match link_with(method, source_path, destination_path) {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                let next = fallbacks.get(idx + 1).unwrap_or(last);
                if method == LinkMethod::Softlink {
                    tracing::warn!(
                        "failed to {method} {}: {err}, falling back to {next}. Creating symbolic \
                         links may require administrator rights or developer mode.",
                        destination_path.display()
                    );
                } else {
                    tracing::debug!(
                        "failed to {method} {}: {err}, falling back to {next}.",
                        destination_path.display()
                    );
                }
            }
        }
    }

    link_with(*last, source_path, destination_path)
        .map_err(|err| LinkFileError::FailedToLink(*last, err))
}

fn link_with(
    method: LinkMethod,
    source_path: &Path,
    destination_path: &Path,
) -> std::io::Result<Materialized> {
    match method {
        LinkMethod::Hardlink => hardlink_to_destination(source_path, destination_path)
            .map(|()| Materialized::Linked(LinkMethod::Hardlink)),
        LinkMethod::Softlink => symlink_to_destination(source_path, destination_path)
            .map(|()| Materialized::Linked(LinkMethod::Softlink)),
        LinkMethod::Copy => {
            copy_to_destination(source_path, destination_path).map(|()| Materialized::Copied)
        }
    }
}

/// Removes whatever file or symlink exists at `path`. Directories are left
/// alone, linking onto them will fail.
fn remove_existing(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if !metadata.is_dir() => fs::remove_file(path),
        _ => Ok(()),
    }
}

/// Hard link the specified file from the source directory. If the file
/// already exists it is removed and the operation is retried.
fn hardlink_to_destination(source_path: &Path, destination_path: &Path) -> std::io::Result<()> {
    remove_existing(destination_path)?;
    loop {
        match fs::hard_link(source_path, destination_path) {
            // No need to copy file permissions, hard links share those anyway
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                fs::remove_file(destination_path)?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Symlink the specified file. If the file already exists it is removed and
/// the operation is retried.
fn symlink_to_destination(source_path: &Path, destination_path: &Path) -> std::io::Result<()> {
    let target = std::path::absolute(source_path)?;
    remove_existing(destination_path)?;
    loop {
        match symlink(&target, destination_path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                fs::remove_file(destination_path)?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Copy the specified file. If the file already exists it is removed first.
///
/// Timestamps are copied on a best-effort basis, failing to do so does not
/// fail the copy.
fn copy_to_destination(source_path: &Path, destination_path: &Path) -> std::io::Result<()> {
    // Never copy through an existing symlink, that would overwrite its target.
    remove_existing(destination_path)?;
    fs::copy(source_path, destination_path)?;

    match std::fs::metadata(source_path) {
        Ok(metadata) => {
            let file_time = filetime::FileTime::from_last_modification_time(&metadata);
            if let Err(err) = filetime::set_file_times(destination_path, file_time, file_time) {
                tracing::debug!(
                    "failed to copy timestamps to {}: {err}",
                    destination_path.display()
                );
            }
        }
        Err(err) => tracing::debug!(
            "failed to read timestamps of {}: {err}",
            source_path.display()
        ),
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(source_path: &Path, destination_path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source_path, destination_path)
}

#[cfg(windows)]
fn symlink(source_path: &Path, destination_path: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source_path, destination_path)
}

#[cfg(not(any(unix, windows)))]
fn symlink(_source_path: &Path, _destination_path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "symbolic links are not supported on this platform",
    ))
}

/// Places content from a [`ContentStore`] (or the local filesystem) at
/// destination paths. All filesystem work runs on the blocking thread pool.
#[derive(Clone)]
pub struct FileMaterializer {
    store: Arc<dyn ContentStore>,
}

impl fmt::Debug for FileMaterializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMaterializer").finish_non_exhaustive()
    }
}

impl FileMaterializer {
    /// Constructs a materializer that reads content from `store`.
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Returns the content store this materializer reads from.
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Resolves a hash to the path of its content. Fails if the hash is
    /// unknown or the backing file is missing.
    pub async fn resolve_content(&self, hash: &ContentHash) -> Result<PathBuf, LinkFileError> {
        self.store
            .content_path(hash)
            .await?
            .ok_or(LinkFileError::ContentNotFound(*hash))
    }

    /// Links content from the CAS to `destination_path`.
    ///
    /// If `use_hard_link` is set a hard link is created and there is no
    /// fallback, the caller decides what to do when it fails. Otherwise a
    /// symbolic link is attempted and, when that fails, the content is
    /// copied. Callers must inspect the returned [`Materialized`] to find out
    /// whether the result is actually a link.
    pub async fn link_from_cas(
        &self,
        hash: &ContentHash,
        destination_path: &Path,
        use_hard_link: bool,
    ) -> Result<Materialized, LinkFileError> {
        let attempts: &[LinkMethod] = if use_hard_link {
            &[LinkMethod::Hardlink]
        } else {
            &[LinkMethod::Softlink, LinkMethod::Copy]
        };
        self.materialize_from_cas(hash, destination_path, attempts)
            .await
    }

    /// Copies content from the CAS to `destination_path`.
    pub async fn copy_from_cas(
        &self,
        hash: &ContentHash,
        destination_path: &Path,
    ) -> Result<Materialized, LinkFileError> {
        self.materialize_from_cas(hash, destination_path, &[LinkMethod::Copy])
            .await
    }

    /// Materializes content from the CAS using an explicit attempt chain.
    pub async fn materialize_from_cas(
        &self,
        hash: &ContentHash,
        destination_path: &Path,
        attempts: &[LinkMethod],
    ) -> Result<Materialized, LinkFileError> {
        let source_path = self.resolve_content(hash).await?;
        self.materialize_from_path(&source_path, destination_path, attempts)
            .await
    }

    /// Materializes an arbitrary file using an explicit attempt chain.
    pub async fn materialize_from_path(
        &self,
        source_path: &Path,
        destination_path: &Path,
        attempts: &[LinkMethod],
    ) -> Result<Materialized, LinkFileError> {
        let source_path = source_path.to_path_buf();
        let destination_path = destination_path.to_path_buf();
        let attempts = attempts.to_vec();
        run_blocking_task(move || materialize_file(&source_path, &destination_path, &attempts))
            .await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use genhub_cas::{compute_bytes_hash, LocalContentStore};

    use super::*;

    async fn store_with(content: &[u8]) -> (tempfile::TempDir, FileMaterializer, ContentHash) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(dir.path().join("cas"));
        let hash = store.store_bytes(content.to_vec()).await.unwrap();
        (dir, FileMaterializer::new(Arc::new(store)), hash)
    }

    #[tokio::test]
    async fn test_unknown_hash_fails_fast() {
        let (dir, materializer, _) = store_with(b"x").await;
        let missing = compute_bytes_hash(b"missing");
        let destination = dir.path().join("out/file.txt");

        let err = materializer
            .link_from_cas(&missing, &destination, false)
            .await
            .unwrap_err();
        assert_matches!(err, LinkFileError::ContentNotFound(hash) if hash == missing);
        assert!(!destination.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_copy_from_cas_creates_parent_and_preserves_mtime() {
        let (dir, materializer, hash) = store_with(b"copied content").await;
        let destination = dir.path().join("out/nested/file.txt");

        let result = materializer.copy_from_cas(&hash, &destination).await.unwrap();
        assert_eq!(result, Materialized::Copied);
        assert!(!result.is_deduplicated());
        assert_eq!(std::fs::read(&destination).unwrap(), b"copied content");

        let source = materializer.resolve_content(&hash).await.unwrap();
        let source_mtime =
            filetime::FileTime::from_last_modification_time(&std::fs::metadata(source).unwrap());
        let destination_mtime = filetime::FileTime::from_last_modification_time(
            &std::fs::metadata(&destination).unwrap(),
        );
        assert_eq!(source_mtime, destination_mtime);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hard_link_shares_inode() {
        let (dir, materializer, hash) = store_with(b"hard linked").await;
        let destination = dir.path().join("out/file.txt");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(&destination, b"previous").unwrap();

        let result = materializer
            .link_from_cas(&hash, &destination, true)
            .await
            .unwrap();
        assert_eq!(result, Materialized::Linked(LinkMethod::Hardlink));

        let source = materializer.resolve_content(&hash).await.unwrap();
        assert!(crate::utils::is_same_file(&source, &destination).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_points_into_cas() {
        let (dir, materializer, hash) = store_with(b"symlinked").await;
        let destination = dir.path().join("out/file.txt");

        let result = materializer
            .link_from_cas(&hash, &destination, false)
            .await
            .unwrap();
        assert_eq!(result, Materialized::Linked(LinkMethod::Softlink));
        assert!(std::fs::symlink_metadata(&destination)
            .unwrap()
            .file_type()
            .is_symlink());
        assert_eq!(std::fs::read(&destination).unwrap(), b"symlinked");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_over_symlink_does_not_touch_cas() {
        let (dir, materializer, hash) = store_with(b"original").await;
        let other = materializer
            .store()
            .content_path(&hash)
            .await
            .unwrap()
            .unwrap();
        let destination = dir.path().join("out/file.txt");
        materializer
            .link_from_cas(&hash, &destination, false)
            .await
            .unwrap();

        let replacement = dir.path().join("replacement.txt");
        std::fs::write(&replacement, b"replacement").unwrap();
        materializer
            .materialize_from_path(&replacement, &destination, &[LinkMethod::Copy])
            .await
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"replacement");
        assert_eq!(std::fs::read(other).unwrap(), b"original");
    }

    #[test]
    fn test_last_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = materialize_file(
            &dir.path().join("does-not-exist"),
            &dir.path().join("out.txt"),
            &[LinkMethod::Hardlink, LinkMethod::Copy],
        );
        assert_matches!(result, Err(LinkFileError::FailedToLink(LinkMethod::Copy, _)));
    }

    #[test]
    fn test_no_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let result = materialize_file(dir.path(), &dir.path().join("out.txt"), &[]);
        assert_matches!(result, Err(LinkFileError::NoLinkMethods));
    }
}
