//! A [`ContentStore`] backed by a directory on the local filesystem.

use std::{
    collections::BTreeSet,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use simple_spawn_blocking::tokio::run_blocking_task;

use crate::{
    compute_bytes_hash, path_for_hash, CasError, ContentHash, ContentStore, HashingWriter,
    ReferenceTracker,
};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = ".tmp";
const WORKSPACE_REFS_DIR: &str = "refs/workspaces";

/// The on-disk format of a workspace reference file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkspaceReferences {
    workspace_id: String,
    hashes: BTreeSet<ContentHash>,
}

/// A content store that keeps every object as a file in a sharded directory
/// tree under `root`.
#[derive(Debug)]
pub struct LocalContentStore {
    root: PathBuf,
    refs_lock: tokio::sync::Mutex<()>,
}

impl LocalContentStore {
    /// Constructs a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            refs_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(path_for_hash(hash))
    }

    fn references_path(&self, workspace_id: &str) -> PathBuf {
        let file_name: String = workspace_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.root
            .join(WORKSPACE_REFS_DIR)
            .join(format!("{file_name}.json"))
    }

    /// Writes a byte buffer to the store, returning the content hash.
    ///
    /// The hash is computed from the in-memory buffer first. If the content is
    /// already stored the write is skipped entirely.
    pub async fn store_bytes(&self, content: Vec<u8>) -> Result<ContentHash, CasError> {
        let root = self.root.clone();
        let hash = compute_bytes_hash(&content);
        let path = self.object_path(&hash);
        run_blocking_task(move || {
            if path.exists() {
                return Ok(hash);
            }
            let mut temp = new_temp_file(&root)?;
            temp.write_all(&content)
                .map_err(|e| CasError::IoError("failed to write content".to_string(), e))?;
            persist(temp.into_temp_path(), &path)?;
            Ok(hash)
        })
        .await
    }

    /// Returns the references that are currently recorded for a workspace.
    pub async fn workspace_references(
        &self,
        workspace_id: &str,
    ) -> Result<BTreeSet<ContentHash>, CasError> {
        let path = self.references_path(workspace_id);
        match fs::tokio::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<WorkspaceReferences>(&bytes)
                .map(|refs| refs.hashes)
                .map_err(|e| CasError::InvalidReferences(path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(CasError::IoError(
                format!("failed to read references of workspace '{workspace_id}'"),
                e,
            )),
        }
    }

    /// Returns the union of all hashes referenced by any workspace.
    pub async fn referenced_hashes(&self) -> Result<BTreeSet<ContentHash>, CasError> {
        let refs_dir = self.root.join(WORKSPACE_REFS_DIR);
        run_blocking_task(move || {
            let mut result = BTreeSet::new();
            let entries = match fs::read_dir(&refs_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(result),
                Err(e) => {
                    return Err(CasError::IoError(
                        "failed to list workspace references".to_string(),
                        e,
                    ))
                }
            };
            for entry in entries {
                let path = entry
                    .map_err(|e| {
                        CasError::IoError("failed to list workspace references".to_string(), e)
                    })?
                    .path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    let bytes = fs::read(&path).map_err(|e| {
                        CasError::IoError("failed to read workspace references".to_string(), e)
                    })?;
                    let refs: WorkspaceReferences = serde_json::from_slice(&bytes)
                        .map_err(|e| CasError::InvalidReferences(path.clone(), e))?;
                    result.extend(refs.hashes);
                }
            }
            Ok(result)
        })
        .await
    }
}

fn new_temp_file(root: &Path) -> Result<tempfile::NamedTempFile, CasError> {
    let temp_dir = root.join(TMP_DIR);
    fs::create_dir_all(&temp_dir)
        .map_err(|e| CasError::IoError("failed to create temporary directory".to_string(), e))?;
    tempfile::Builder::new()
        .tempfile_in(&temp_dir)
        .map_err(|e| CasError::IoError("failed to create temporary file".to_string(), e))
}

/// Moves a temporary file to its final location, ignoring the case where a
/// concurrent writer already stored the same content.
fn persist(temp_path: tempfile::TempPath, path: &Path) -> Result<(), CasError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CasError::IoError("failed to create object directory".to_string(), e))?;
    }
    match temp_path.persist_noclobber(path) {
        Ok(()) => Ok(()),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(CasError::IoError(
            format!("failed to persist '{}'", path.display()),
            e.error,
        )),
    }
}

#[async_trait::async_trait]
impl ContentStore for LocalContentStore {
    async fn store_content(
        &self,
        path: &Path,
        expected_hash: Option<ContentHash>,
    ) -> Result<ContentHash, CasError> {
        let root = self.root.clone();
        let source = path.to_path_buf();
        let (temp_path, hash) = run_blocking_task(move || {
            let temp = new_temp_file(&root)?;
            let (file, temp_path) = temp.into_parts();
            let mut writer = HashingWriter::new(file);
            let mut reader = fs::File::open(&source)
                .map_err(|e| CasError::IoError("failed to open source file".to_string(), e))?;
            std::io::copy(&mut reader, &mut writer)
                .map_err(|e| CasError::IoError("failed to copy content".to_string(), e))?;
            writer
                .flush()
                .map_err(|e| CasError::IoError("failed to flush content".to_string(), e))?;
            let (file, hash) = writer.finalize();
            drop(file);
            Ok::<_, CasError>((temp_path, hash))
        })
        .await?;

        if let Some(expected) = expected_hash {
            if expected != hash {
                return Err(CasError::HashMismatch {
                    path: path.to_path_buf(),
                    expected,
                    actual: hash,
                });
            }
        }

        let destination = self.object_path(&hash);
        run_blocking_task(move || persist(temp_path, &destination)).await?;
        tracing::debug!("stored '{}' as {hash}", path.display());
        Ok(hash)
    }

    async fn content_path(&self, hash: &ContentHash) -> Result<Option<PathBuf>, CasError> {
        let path = self.object_path(hash);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(Some(path)),
            Ok(false) => Ok(None),
            Err(e) => Err(CasError::IoError(format!("failed to look up {hash}"), e)),
        }
    }
}

#[async_trait::async_trait]
impl ReferenceTracker for LocalContentStore {
    async fn track_workspace_references(
        &self,
        workspace_id: &str,
        hashes: &[ContentHash],
    ) -> Result<(), CasError> {
        let _guard = self.refs_lock.lock().await;
        let refs = WorkspaceReferences {
            workspace_id: workspace_id.to_string(),
            hashes: hashes.iter().copied().collect(),
        };
        let path = self.references_path(workspace_id);
        let root = self.root.clone();
        run_blocking_task(move || {
            let mut temp = new_temp_file(&root)?;
            serde_json::to_writer_pretty(&mut temp, &refs)
                .map_err(|e| CasError::InvalidReferences(path.clone(), e))?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    CasError::IoError("failed to create references directory".to_string(), e)
                })?;
            }
            temp.persist(&path).map_err(|e| {
                CasError::IoError(format!("failed to persist '{}'", path.display()), e.error)
            })?;
            Ok::<(), CasError>(())
        })
        .await?;
        tracing::debug!(
            "tracking {} content references for workspace '{workspace_id}'",
            hashes.len()
        );
        Ok(())
    }

    async fn untrack_workspace(&self, workspace_id: &str) -> Result<(), CasError> {
        let _guard = self.refs_lock.lock().await;
        let path = self.references_path(workspace_id);
        match fs::tokio::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("untracked content references of workspace '{workspace_id}'");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CasError::IoError(
                format!("failed to untrack workspace '{workspace_id}'"),
                e,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_file_hash;

    #[tokio::test]
    async fn test_store_content_deduplicates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(temp_dir.path().join("cas"));

        let source = temp_dir.path().join("a.txt");
        std::fs::write(&source, b"Duplicate content").unwrap();

        let hash1 = store.store_content(&source, None).await.unwrap();
        let hash2 = store.store_bytes(b"Duplicate content".to_vec()).await.unwrap();
        assert_eq!(hash1, hash2);

        let path = store.content_path(&hash1).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"Duplicate content");
        assert_eq!(compute_file_hash(&path).unwrap(), hash1);
    }

    #[tokio::test]
    async fn test_store_content_rejects_unexpected_hash() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(temp_dir.path().join("cas"));

        let source = temp_dir.path().join("a.txt");
        std::fs::write(&source, b"Content A").unwrap();

        let wrong = compute_bytes_hash(b"Content B");
        let err = store.store_content(&source, Some(wrong)).await.unwrap_err();
        assert!(matches!(err, CasError::HashMismatch { .. }));
        assert!(store
            .content_path(&compute_bytes_hash(b"Content A"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_hash_has_no_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(temp_dir.path());
        let hash = compute_bytes_hash(b"never stored");
        assert!(store.content_path(&hash).await.unwrap().is_none());
        assert!(matches!(
            store.open_content(&hash).await.unwrap_err(),
            CasError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_track_and_untrack_workspace() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(temp_dir.path());

        let a = store.store_bytes(b"a".to_vec()).await.unwrap();
        let b = store.store_bytes(b"b".to_vec()).await.unwrap();

        store.track_workspace_references("ws/1", &[a, b]).await.unwrap();
        store.track_workspace_references("ws-2", &[b]).await.unwrap();
        assert_eq!(store.workspace_references("ws/1").await.unwrap().len(), 2);
        assert_eq!(store.referenced_hashes().await.unwrap().len(), 2);

        store.untrack_workspace("ws/1").await.unwrap();
        assert!(store.workspace_references("ws/1").await.unwrap().is_empty());
        assert_eq!(
            store.referenced_hashes().await.unwrap(),
            BTreeSet::from([b])
        );

        // Untracking twice is fine.
        store.untrack_workspace("ws/1").await.unwrap();
    }
}
