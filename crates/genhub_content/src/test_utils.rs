use std::{path::Path, sync::Arc};

use genhub_cas::LocalContentStore;

use crate::{
    config::ContentConfig,
    manifest::{ContentManifest, ContentType, GameType, InstallTarget, ManifestFile},
    user_data::{UserDataLocations, UserDataTracker},
};

/// A content store and configuration inside a temporary directory.
pub(crate) struct TestEnv {
    pub dir: tempfile::TempDir,
    pub store: Arc<LocalContentStore>,
    pub config: ContentConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalContentStore::new(dir.path().join("cas")));
        let config = ContentConfig::with_app_data_root(dir.path().join("GenHub"));
        Self { dir, store, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Stores every file in the CAS and returns a manifest of them.
    pub async fn manifest(
        &self,
        id: &str,
        content_type: ContentType,
        target: InstallTarget,
        files: &[(&str, &str)],
    ) -> ContentManifest {
        let mut manifest = ContentManifest::new(id, content_type);
        for (path, content) in files {
            let hash = self.store.store_bytes(content.as_bytes().to_vec()).await.unwrap();
            manifest = manifest.with_file(
                ManifestFile::new(*path, hash, content.len() as u64).with_install_target(target),
            );
        }
        manifest
    }

    pub fn user_data_locations(&self) -> UserDataLocations {
        UserDataLocations::new(self.path().join("Documents/Zero Hour Data"))
    }

    pub fn tracker(&self) -> UserDataTracker {
        UserDataTracker::new(&self.config, self.store.clone())
            .with_locations(GameType::ZeroHour, self.user_data_locations())
    }
}
