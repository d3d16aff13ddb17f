use std::path::{Path, PathBuf};

use simple_spawn_blocking::tokio::run_blocking_task;

use super::{WorkspaceError, WorkspaceInfo};
use crate::utils::{read_json, write_json_atomic};

/// The persisted list of all known workspaces, stored as a single JSON file.
///
/// Writers are serialized through an internal lock so that concurrent updates
/// of different workspaces do not lose each other's changes.
#[derive(Debug)]
pub struct WorkspaceIndex {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl WorkspaceIndex {
    /// Constructs an index that is stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the location of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let path = self.path.clone();
        run_blocking_task(move || {
            read_json::<Vec<WorkspaceInfo>>(&path)
                .map(Option::unwrap_or_default)
                .map_err(|e| WorkspaceError::IndexError(path, e))
        })
        .await
    }

    async fn write(&self, workspaces: Vec<WorkspaceInfo>) -> Result<(), WorkspaceError> {
        let path = self.path.clone();
        run_blocking_task(move || {
            write_json_atomic(&path, &workspaces).map_err(|e| WorkspaceError::IndexError(path, e))
        })
        .await
    }

    /// Returns all workspaces in the index.
    pub async fn load_all(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Returns the workspace with the given id.
    pub async fn get(&self, id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        Ok(self.load_all().await?.into_iter().find(|info| info.id == id))
    }

    /// Inserts `info`, replacing any previous record with the same id.
    pub async fn upsert(&self, info: WorkspaceInfo) -> Result<(), WorkspaceError> {
        let _guard = self.lock.lock().await;
        let mut workspaces = self.read().await?;
        workspaces.retain(|existing| existing.id != info.id);
        workspaces.push(info);
        self.write(workspaces).await
    }

    /// Removes the workspace with the given id and returns it.
    pub async fn remove(&self, id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        let _guard = self.lock.lock().await;
        let mut workspaces = self.read().await?;
        let Some(position) = workspaces.iter().position(|info| info.id == id) else {
            return Ok(None);
        };
        let removed = workspaces.remove(position);
        self.write(workspaces).await?;
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::workspace::WorkspaceStrategyKind;

    fn info(id: &str, file_count: usize) -> WorkspaceInfo {
        WorkspaceInfo {
            id: id.to_string(),
            workspace_path: PathBuf::from("/workspaces").join(id),
            strategy: WorkspaceStrategyKind::FullCopy,
            executable_path: None,
            file_count,
            total_size_bytes: 0,
            manifest_ids: None,
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            is_prepared: true,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = WorkspaceIndex::new(dir.path().join("workspaces.json"));
        assert!(index.load_all().await.unwrap().is_empty());

        index.upsert(info("a", 1)).await.unwrap();
        index.upsert(info("b", 2)).await.unwrap();
        index.upsert(info("a", 3)).await.unwrap();

        let all = index.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(index.get("a").await.unwrap().unwrap().file_count, 3);

        assert!(index.remove("a").await.unwrap().is_some());
        assert!(index.remove("a").await.unwrap().is_none());
        assert!(index.get("a").await.unwrap().is_none());
        assert_eq!(index.load_all().await.unwrap().len(), 1);
    }
}
