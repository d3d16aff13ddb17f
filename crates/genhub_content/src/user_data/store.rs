use std::path::{Path, PathBuf};

use simple_spawn_blocking::tokio::run_blocking_task;

use super::{InstallationKey, UserDataError, UserDataIndex, UserDataManifest};
use crate::utils::{read_json, remove_file_if_exists, write_json_atomic};

/// Owns the persisted user data state: the [`UserDataIndex`] and one manifest
/// record per installation.
///
/// The index is loaded lazily and cached. Every mutation holds the lock for
/// the whole load, modify and persist cycle.
#[derive(Debug)]
pub(crate) struct UserDataStore {
    root: PathBuf,
    index: tokio::sync::Mutex<Option<UserDataIndex>>,
}

impl UserDataStore {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    pub(crate) fn backups_root(&self) -> PathBuf {
        self.root.join("backups")
    }

    fn manifest_path(&self, key: &InstallationKey) -> PathBuf {
        self.root.join("manifests").join(format!("{key}.json"))
    }

    /// Loads the index into `cache` if that did not happen yet. Must only be
    /// called while holding the lock.
    async fn load_unlocked<'a>(
        &self,
        cache: &'a mut Option<UserDataIndex>,
    ) -> Result<&'a mut UserDataIndex, UserDataError> {
        if cache.is_none() {
            let path = self.index_path();
            let index = run_blocking_task(move || {
                read_json::<UserDataIndex>(&path).map_err(|e| UserDataError::IndexError(path, e))
            })
            .await?
            .unwrap_or_default();
            tracing::debug!("loaded user data index with {} installations", index.len());
            *cache = Some(index);
        }
        Ok(cache.get_or_insert_with(UserDataIndex::default))
    }

    /// Runs `f` on the current index.
    pub(crate) async fn read<R>(
        &self,
        f: impl FnOnce(&UserDataIndex) -> R + Send,
    ) -> Result<R, UserDataError> {
        let mut guard = self.index.lock().await;
        let index = self.load_unlocked(&mut guard).await?;
        Ok(f(index))
    }

    /// Runs `f` on the current index and persists the result.
    pub(crate) async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut UserDataIndex) -> R + Send,
    ) -> Result<R, UserDataError> {
        let mut guard = self.index.lock().await;
        let index = self.load_unlocked(&mut guard).await?;
        let result = f(index);

        let snapshot = index.clone();
        let path = self.index_path();
        let persisted = run_blocking_task(move || {
            write_json_atomic(&path, &snapshot).map_err(|e| UserDataError::IndexError(path, e))
        })
        .await;
        if let Err(err) = persisted {
            // Forget the unpersisted change, the next access reloads from disk.
            *guard = None;
            return Err(err);
        }
        Ok(result)
    }

    /// Drops the cached index.
    pub(crate) async fn reset(&self) {
        *self.index.lock().await = None;
    }

    pub(crate) async fn load_manifest(
        &self,
        key: &InstallationKey,
    ) -> Result<Option<UserDataManifest>, UserDataError> {
        let path = self.manifest_path(key);
        run_blocking_task(move || {
            read_json::<UserDataManifest>(&path).map_err(|e| UserDataError::ManifestError(path, e))
        })
        .await
    }

    pub(crate) async fn save_manifest(
        &self,
        manifest: &UserDataManifest,
    ) -> Result<(), UserDataError> {
        let path = self.manifest_path(&manifest.installation_key);
        let manifest = manifest.clone();
        run_blocking_task(move || {
            write_json_atomic(&path, &manifest).map_err(|e| UserDataError::ManifestError(path, e))
        })
        .await
    }

    pub(crate) async fn delete_manifest(&self, key: &InstallationKey) -> Result<(), UserDataError> {
        let path = self.manifest_path(key);
        run_blocking_task(move || {
            remove_file_if_exists(&path)
                .map(|_| ())
                .map_err(|e| UserDataError::ManifestError(path, e))
        })
        .await
    }
}
