//! Switches the user data of the game between profiles.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    manifest::{ContentManifest, GameType, ManifestId, ProfileId},
    user_data::{UserDataError, UserDataOperationResult, UserDataTracker},
};

/// What switching to another profile would remove from the user data
/// directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDataSwitchAnalysis {
    /// The number of files that would be removed.
    pub files_to_remove: usize,
    /// The combined size of those files in bytes.
    pub bytes_to_remove: u64,
    /// The manifests whose files would be removed.
    pub manifests: Vec<ManifestId>,
}

impl UserDataSwitchAnalysis {
    /// Returns true if switching would not remove anything.
    pub fn is_empty(&self) -> bool {
        self.files_to_remove == 0
    }
}

/// Keeps the user data directories in line with the active profile of every
/// game.
#[derive(Debug)]
pub struct ProfileContentLinker {
    tracker: Arc<UserDataTracker>,
    active_profiles: RwLock<HashMap<GameType, ProfileId>>,
}

impl ProfileContentLinker {
    /// Constructs a linker on top of `tracker`.
    pub fn new(tracker: Arc<UserDataTracker>) -> Self {
        Self {
            tracker,
            active_profiles: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the tracker this linker drives.
    pub fn tracker(&self) -> &Arc<UserDataTracker> {
        &self.tracker
    }

    /// Returns the profile whose user data is currently linked for `game`.
    pub fn active_profile(&self, game: GameType) -> Option<ProfileId> {
        self.active_profiles.read().get(&game).cloned()
    }

    /// Installs (or reactivates) the user data of `manifests` for
    /// `profile_id` and makes it the active profile of `game`.
    ///
    /// Manifests that are already installed for the profile in the same
    /// version, natively or through adoption, are not installed again.
    #[instrument(skip_all, fields(profile = %profile_id, game = %game))]
    pub async fn prepare_profile_user_data(
        &self,
        profile_id: &ProfileId,
        manifests: &[ContentManifest],
        game: GameType,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let installed = self.tracker.get_profile_installations(profile_id).await?;
        let mut result = UserDataOperationResult::default();

        for manifest in manifests
            .iter()
            .filter(|manifest| manifest.target_game == game)
            .filter(|manifest| manifest.user_data_files().next().is_some())
        {
            let up_to_date = installed.iter().any(|record| {
                record.manifest_id == manifest.id && record.manifest_version == manifest.version
            });
            if up_to_date {
                tracing::debug!("'{}' is already installed for '{profile_id}'", manifest.id);
                continue;
            }
            result.merge(
                self.tracker
                    .install(manifest, profile_id, cancellation_token)
                    .await?,
            );
        }

        result.merge(
            self.tracker
                .activate_profile(profile_id, cancellation_token)
                .await?,
        );
        self.active_profiles.write().insert(game, profile_id.clone());
        Ok(result)
    }

    /// Removes the linked user data of `profile_id` from disk. The
    /// installations are kept so the profile can be activated again.
    #[instrument(skip(self, cancellation_token))]
    pub async fn cleanup_profile_user_data(
        &self,
        profile_id: &ProfileId,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let result = self
            .tracker
            .deactivate_profile(profile_id, cancellation_token)
            .await?;
        self.active_profiles
            .write()
            .retain(|_, active| active != profile_id);
        Ok(result)
    }

    /// Switches the user data of `game` from `old_profile_id` to
    /// `new_profile_id`.
    ///
    /// With `skip_cleanup` the files of the old profile stay in place and its
    /// installations are adopted by the new profile. This avoids relinking
    /// large amounts of content the two profiles share.
    #[instrument(skip(self, new_manifests, cancellation_token))]
    pub async fn switch_profile_user_data(
        &self,
        old_profile_id: Option<&ProfileId>,
        new_profile_id: &ProfileId,
        new_manifests: &[ContentManifest],
        game: GameType,
        skip_cleanup: bool,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let mut result = UserDataOperationResult::default();
        if let Some(old_profile_id) = old_profile_id.filter(|old| *old != new_profile_id) {
            if skip_cleanup {
                self.tracker
                    .adopt_installations(old_profile_id, new_profile_id)
                    .await?;
            } else {
                result.merge(
                    self.cleanup_profile_user_data(old_profile_id, cancellation_token)
                        .await?,
                );
            }
        }

        result.merge(
            self.prepare_profile_user_data(new_profile_id, new_manifests, game, cancellation_token)
                .await?,
        );
        tracing::info!(
            "switched user data of {game} to profile '{new_profile_id}' ({} files, {} errors)",
            result.files_processed,
            result.errors.len()
        );
        Ok(result)
    }

    /// Computes what [`ProfileContentLinker::switch_profile_user_data`] would
    /// remove when switching from `old_profile_id` to `new_profile_id`
    /// without skipping the cleanup. Nothing is modified.
    ///
    /// Manifests the target profile has installed itself, or that are part of
    /// `new_manifests`, are not reported.
    pub async fn analyze_user_data_switch(
        &self,
        old_profile_id: &ProfileId,
        new_profile_id: &ProfileId,
        new_manifests: &[ContentManifest],
    ) -> Result<UserDataSwitchAnalysis, UserDataError> {
        let mut analysis = UserDataSwitchAnalysis::default();
        if old_profile_id == new_profile_id {
            return Ok(analysis);
        }

        let mut needed: Vec<ManifestId> = self
            .tracker
            .get_profile_installations(new_profile_id)
            .await?
            .into_iter()
            .filter(|record| &record.profile_id == new_profile_id)
            .map(|record| record.manifest_id)
            .collect();
        needed.extend(new_manifests.iter().map(|manifest| manifest.id.clone()));

        for record in self
            .tracker
            .get_profile_installations(old_profile_id)
            .await?
            .into_iter()
            .filter(|record| record.is_active && !needed.contains(&record.manifest_id))
        {
            let removed: Vec<_> = record.files.iter().filter(|entry| entry.is_hard_link).collect();
            if removed.is_empty() {
                continue;
            }
            analysis.files_to_remove += removed.len();
            analysis.bytes_to_remove += removed.iter().map(|entry| entry.size).sum::<u64>();
            analysis.manifests.push(record.manifest_id);
        }
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manifest::{ContentType, InstallTarget},
        test_utils::TestEnv,
    };

    const MAPS: InstallTarget = InstallTarget::UserMapsDirectory;

    async fn setup(env: &TestEnv) -> (ProfileContentLinker, ContentManifest, ContentManifest) {
        let desert = env
            .manifest("desert", ContentType::Map, MAPS, &[("Desert.map", "desert")])
            .await;
        let tundra = env
            .manifest("tundra", ContentType::Map, MAPS, &[("Tundra.map", "tundra")])
            .await;
        (ProfileContentLinker::new(Arc::new(env.tracker())), desert, tundra)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_switch_profiles() {
        let env = TestEnv::new();
        let (linker, desert, tundra) = setup(&env).await;
        let token = CancellationToken::new();
        let (a, b) = (ProfileId::from("a"), ProfileId::from("b"));
        let maps = env.user_data_locations().maps;

        linker
            .prepare_profile_user_data(&a, &[desert.clone()], GameType::ZeroHour, &token)
            .await
            .unwrap();
        assert!(maps.join("Desert.map").exists());
        assert_eq!(linker.active_profile(GameType::ZeroHour), Some(a.clone()));

        let result = linker
            .switch_profile_user_data(
                Some(&a),
                &b,
                &[tundra.clone()],
                GameType::ZeroHour,
                false,
                &token,
            )
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(!maps.join("Desert.map").exists());
        assert!(maps.join("Tundra.map").exists());
        assert_eq!(linker.active_profile(GameType::ZeroHour), Some(b.clone()));

        // Switching back reactivates the installation instead of reinstalling.
        linker
            .switch_profile_user_data(Some(&b), &a, &[desert], GameType::ZeroHour, false, &token)
            .await
            .unwrap();
        assert!(maps.join("Desert.map").exists());
        assert!(!maps.join("Tundra.map").exists());
        assert_eq!(linker.active_profile(GameType::ZeroHour), Some(a));
    }

    #[tokio::test]
    async fn test_switch_without_cleanup_adopts() {
        let env = TestEnv::new();
        let (linker, desert, tundra) = setup(&env).await;
        let token = CancellationToken::new();
        let (a, b) = (ProfileId::from("a"), ProfileId::from("b"));
        let maps = env.user_data_locations().maps;

        linker
            .prepare_profile_user_data(&a, &[desert.clone()], GameType::ZeroHour, &token)
            .await
            .unwrap();
        linker
            .switch_profile_user_data(
                Some(&a),
                &b,
                &[desert, tundra],
                GameType::ZeroHour,
                true,
                &token,
            )
            .await
            .unwrap();

        assert!(maps.join("Desert.map").exists());
        assert!(maps.join("Tundra.map").exists());
        let installations = linker.tracker().get_profile_installations(&b).await.unwrap();
        assert_eq!(installations.len(), 2);
        // The adopted installation still belongs to the profile that made it.
        assert!(installations
            .iter()
            .any(|record| record.manifest_id.as_str() == "desert" && record.profile_id == a));
    }

    #[tokio::test]
    async fn test_analyze_user_data_switch() {
        let env = TestEnv::new();
        let (linker, desert, tundra) = setup(&env).await;
        let token = CancellationToken::new();
        let (a, b) = (ProfileId::from("a"), ProfileId::from("b"));

        linker
            .prepare_profile_user_data(&a, &[desert.clone()], GameType::ZeroHour, &token)
            .await
            .unwrap();
        assert!(linker.analyze_user_data_switch(&a, &a, &[]).await.unwrap().is_empty());
        assert!(linker
            .analyze_user_data_switch(&a, &b, &[desert.clone()])
            .await
            .unwrap()
            .is_empty());

        let analysis = linker
            .analyze_user_data_switch(&a, &b, &[tundra])
            .await
            .unwrap();
        let is_linked = linker
            .tracker()
            .get_installation(&desert.id, &a)
            .await
            .unwrap()
            .unwrap()
            .files[0]
            .is_hard_link;
        if is_linked {
            assert_eq!(analysis.files_to_remove, 1);
            assert_eq!(analysis.bytes_to_remove, 6);
            assert_eq!(analysis.manifests, vec![desert.id]);
        } else {
            assert!(analysis.is_empty());
        }
    }
}
