//! Tracks content that is installed into directories owned by the user, such
//! as the maps and replays directories of a game.
//!
//! Unlike a workspace, a user data directory also contains files the user
//! created. Every installed file is therefore recorded in a
//! [`UserDataIndex`] so that its owner is always known. A user file that has
//! to make room for installed content is backed up first and restored when
//! the content is uninstalled.
//!
//! An installation of a manifest for a profile goes through the states
//! *not installed*, *active*, *inactive* and back to *not installed*:
//!
//! * [`UserDataTracker::install`] links the files from the content store and
//!   marks the installation active.
//! * [`UserDataTracker::deactivate_profile`] removes the hard links of every
//!   active installation of a profile but keeps the records.
//! * [`UserDataTracker::activate_profile`] recreates them.
//! * [`UserDataTracker::uninstall`] removes the files, restores backups and
//!   forgets the installation.

mod backup;
mod model;
mod paths;
mod store;

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use genhub_cas::{compute_file_hash, ContentStore};
use simple_spawn_blocking::{tokio::run_blocking_task, Cancelled};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub use backup::BACKUP_EXTENSION;
pub use model::{InstallationKey, UserDataFileEntry, UserDataIndex, UserDataManifest};
pub use paths::UserDataLocations;
use store::UserDataStore;

use crate::{
    config::ContentConfig,
    link::{FileMaterializer, LinkFileError, LinkMethod, Materialized},
    manifest::{ContentManifest, GameType, ManifestId, ProfileId},
    utils::{entry_exists, is_same_file, prune_empty_parents, remove_file_if_exists},
};

const HARDLINK_OR_COPY: &[LinkMethod] = &[LinkMethod::Hardlink, LinkMethod::Copy];

/// The number of files that are verified concurrently.
const VERIFY_CONCURRENCY: usize = 4;

/// Errors that can occur while tracking user data.
#[derive(Debug, thiserror::Error)]
pub enum UserDataError {
    /// No user data directories are known for the game.
    #[error("the user data directories of {0} are not known")]
    UnknownLocations(GameType),

    /// The installation does not exist.
    #[error("{0} is not installed")]
    NotInstalled(InstallationKey),

    /// The index could not be read or written.
    #[error("failed to access the user data index at '{0}'")]
    IndexError(PathBuf, #[source] std::io::Error),

    /// An installation record could not be read or written.
    #[error("failed to access the installation record at '{0}'")]
    ManifestError(PathBuf, #[source] std::io::Error),

    /// Deleting the tracking data was refused because the directory does not
    /// look like it belongs to the application.
    #[error("refusing to delete '{0}' because it does not belong to {1}")]
    UnsafeDeletion(PathBuf, String),

    /// A generic IO error.
    #[error("{0}")]
    IoError(String, #[source] std::io::Error),

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<Cancelled> for UserDataError {
    fn from(_: Cancelled) -> Self {
        UserDataError::Cancelled
    }
}

/// The outcome of an operation that touches many files. Failures of single
/// files do not abort the operation, they are collected in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDataOperationResult {
    /// The number of files that were processed successfully.
    pub files_processed: usize,
    /// The number of bytes of all processed files.
    pub bytes_processed: u64,
    /// A message for every file that failed.
    pub errors: Vec<String>,
    /// How long the operation took.
    pub elapsed: Duration,
}

impl UserDataOperationResult {
    /// Returns true if no file failed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn merge(&mut self, other: UserDataOperationResult) {
        self.files_processed += other.files_processed;
        self.bytes_processed += other.bytes_processed;
        self.errors.extend(other.errors);
    }

    fn finish(mut self, started: Instant) -> Self {
        self.elapsed = started.elapsed();
        self
    }
}

/// Installs manifests into user data directories and keeps track of which
/// installation owns which file.
pub struct UserDataTracker {
    store: UserDataStore,
    materializer: FileMaterializer,
    locations: HashMap<GameType, UserDataLocations>,
    app_name: String,
}

impl std::fmt::Debug for UserDataTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDataTracker")
            .field("store", &self.store)
            .field("locations", &self.locations)
            .field("app_name", &self.app_name)
            .finish_non_exhaustive()
    }
}

impl UserDataTracker {
    /// Constructs a tracker that stores its state under the user data root of
    /// `config` and reads content from `content_store`. The default
    /// directories of every game are used until
    /// [`UserDataTracker::with_locations`] overrides them.
    pub fn new(config: &ContentConfig, content_store: Arc<dyn ContentStore>) -> Self {
        let locations = [GameType::Generals, GameType::ZeroHour]
            .into_iter()
            .filter_map(|game| UserDataLocations::default_for(game).map(|l| (game, l)))
            .collect();
        Self {
            store: UserDataStore::new(config.user_data_root()),
            materializer: FileMaterializer::new(content_store),
            locations,
            app_name: config.app_name.clone(),
        }
    }

    /// Uses `locations` for the user data of `game`.
    #[must_use]
    pub fn with_locations(mut self, game: GameType, locations: UserDataLocations) -> Self {
        self.locations.insert(game, locations);
        self
    }

    /// Returns the user data directories of `game`.
    pub fn locations(&self, game: GameType) -> Result<&UserDataLocations, UserDataError> {
        self.locations
            .get(&game)
            .ok_or(UserDataError::UnknownLocations(game))
    }

    fn prune_root(&self, game: GameType, entry: &UserDataFileEntry) -> Option<PathBuf> {
        self.locations
            .get(&game)
            .and_then(|locations| locations.root_for(entry.install_target))
            .map(Path::to_path_buf)
    }

    async fn content_path(&self, entry: &UserDataFileEntry) -> Option<PathBuf> {
        self.materializer
            .store()
            .content_path(&entry.source_hash)
            .await
            .ok()
            .flatten()
    }

    /// Installs the user data files of `manifest` for `profile_id` and marks
    /// the installation active.
    ///
    /// A file owned by another installation is taken over. A file the user
    /// owns is backed up before it is replaced. Installing a manifest that is
    /// already installed for the profile replaces the previous installation;
    /// files that the new version no longer contains are removed.
    #[instrument(skip_all, fields(manifest = %manifest.id, profile = %profile_id))]
    pub async fn install(
        &self,
        manifest: &ContentManifest,
        profile_id: &ProfileId,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let started = Instant::now();
        let mut result = UserDataOperationResult::default();
        let files: Vec<_> = manifest.user_data_files().collect();
        if files.is_empty() {
            tracing::debug!("manifest '{}' has no user data files", manifest.id);
            return Ok(result.finish(started));
        }

        let game = manifest.target_game;
        let key = InstallationKey::new(&manifest.id, profile_id);
        let locations = self.locations(game)?;
        let previous = self.store.load_manifest(&key).await?;
        let backups_root = self.store.backups_root();
        let mut entries = Vec::with_capacity(files.len());
        let mut cancelled = false;

        for file in files {
            if cancellation_token.is_cancelled() {
                cancelled = true;
                break;
            }
            let Some(destination) = locations.resolve(file) else {
                continue;
            };

            let owner = self
                .store
                .read(|index| index.owner_of(&destination).cloned())
                .await?;
            let (mut backup_path, mut was_overwritten) = (None, false);
            let mut fresh_backup = false;
            let mut previous_owner = None;
            match owner {
                Some(owner) if owner == key => {
                    if let Some(prior) = previous.as_ref().and_then(|m| m.entry(&destination)) {
                        backup_path = prior.backup_path.clone();
                        was_overwritten = prior.was_overwritten;
                    }
                }
                Some(owner) => {
                    tracing::warn!(
                        "'{}' is installed by {owner}, replacing it with the file of {key}",
                        destination.display()
                    );
                    was_overwritten = true;
                    previous_owner = Some(owner);
                }
                None if entry_exists(&destination) => {
                    let backups_root = backups_root.clone();
                    let relative_path = file.relative_path.clone();
                    let original = destination.clone();
                    let backup = run_blocking_task(move || {
                        Ok::<_, UserDataError>(backup::backup_file(
                            &backups_root,
                            game,
                            &relative_path,
                            &original,
                        ))
                    })
                    .await?;
                    match backup {
                        Ok(backup) => {
                            backup_path = Some(backup);
                            was_overwritten = true;
                            fresh_backup = true;
                        }
                        Err(err) => {
                            result.errors.push(format!(
                                "{}: failed to back up the existing file: {err}",
                                destination.display()
                            ));
                            continue;
                        }
                    }
                }
                None => {}
            }

            let materialized = match self
                .materializer
                .materialize_from_cas(&file.hash, &destination, HARDLINK_OR_COPY)
                .await
            {
                Ok(materialized) => materialized,
                Err(err) => {
                    if let Some(backup) = backup_path.filter(|_| fresh_backup) {
                        self.restore(backup, destination.clone()).await?;
                    }
                    if matches!(err, LinkFileError::Cancelled) {
                        cancelled = true;
                        break;
                    }
                    tracing::warn!("failed to install '{}': {err}", destination.display());
                    result
                        .errors
                        .push(format!("{}: {err}", destination.display()));
                    continue;
                }
            };

            // The backup of the user's file travels with the file.
            if let Some(previous_owner) = previous_owner {
                backup_path = self.take_backup(&previous_owner, &destination).await?;
            }

            entries.push(UserDataFileEntry {
                relative_path: file.relative_path.clone(),
                absolute_path: destination,
                source_hash: file.hash,
                size: file.size,
                install_target: file.install_target,
                is_hard_link: materialized == Materialized::Linked(LinkMethod::Hardlink),
                backup_path,
                was_overwritten,
            });
            result.files_processed += 1;
            result.bytes_processed += file.size;
        }

        if cancelled {
            // Keep the files that were already replaced tracked, otherwise
            // their backups could never be restored.
            let processed: Vec<PathBuf> =
                entries.iter().map(|entry| entry.absolute_path.clone()).collect();
            if let Some(previous) = previous {
                let untouched = self
                    .store
                    .read(|index| {
                        previous
                            .files
                            .into_iter()
                            .filter(|entry| !processed.contains(&entry.absolute_path))
                            .filter(|entry| index.owner_of(&entry.absolute_path) == Some(&key))
                            .collect::<Vec<_>>()
                    })
                    .await?;
                entries.extend(untouched);
            }
            if !entries.is_empty() {
                let record = installation_record(&key, manifest, profile_id, entries);
                self.store.save_manifest(&record).await?;
                self.store.mutate(|index| index.register(&record)).await?;
                tracing::info!(
                    "install of '{}' was cancelled, {} files are tracked",
                    manifest.id,
                    processed.len()
                );
            }
            return Err(UserDataError::Cancelled);
        }

        // Files of a previous version that the new version does not contain.
        let mut released = Vec::new();
        if let Some(previous) = previous.as_ref() {
            for stale in previous
                .files
                .iter()
                .filter(|stale| entries.iter().all(|e| e.absolute_path != stale.absolute_path))
            {
                let owner = self
                    .store
                    .read(|index| index.owner_of(&stale.absolute_path).cloned())
                    .await?;
                if owner.as_ref() == Some(&key) {
                    if let Err(message) = self.remove_installed(previous.target_game, stale).await? {
                        result.errors.push(message);
                    }
                }
                released.push(stale.absolute_path.clone());
            }
        }

        let record = installation_record(&key, manifest, profile_id, entries);
        self.store.save_manifest(&record).await?;
        self.store
            .mutate(|index| {
                index.release_files(&key, released.iter().map(PathBuf::as_path));
                index.register(&record);
            })
            .await?;

        tracing::info!(
            "installed {} user data files of '{}' for profile '{}'",
            record.files.len(),
            manifest.id,
            profile_id
        );
        Ok(result.finish(started))
    }

    /// Removes the backup of the file at `path` from the record of `owner`
    /// and returns it.
    async fn take_backup(
        &self,
        owner: &InstallationKey,
        path: &Path,
    ) -> Result<Option<PathBuf>, UserDataError> {
        let Some(mut record) = self.store.load_manifest(owner).await? else {
            return Ok(None);
        };
        let backup = record
            .files
            .iter_mut()
            .find(|entry| entry.absolute_path == path)
            .and_then(|entry| entry.backup_path.take());
        if backup.is_some() {
            self.store.save_manifest(&record).await?;
            tracing::debug!("took over the backup of '{}' from {owner}", path.display());
        }
        Ok(backup)
    }

    /// Gives the backup of `entry` to `owner` unless its record already has
    /// one for the file.
    async fn hand_over_backup(
        &self,
        owner: &InstallationKey,
        entry: &UserDataFileEntry,
    ) -> Result<(), UserDataError> {
        let Some(backup) = entry.backup_path.as_ref() else {
            return Ok(());
        };
        let Some(mut record) = self.store.load_manifest(owner).await? else {
            tracing::warn!("the record of {owner} is missing, '{}' is orphaned", backup.display());
            return Ok(());
        };
        let Some(target) = record
            .files
            .iter_mut()
            .find(|target| target.absolute_path == entry.absolute_path)
        else {
            return Ok(());
        };
        if target.backup_path.is_none() {
            target.backup_path = Some(backup.clone());
            target.was_overwritten = true;
            self.store.save_manifest(&record).await?;
            tracing::debug!("handed the backup of '{}' to {owner}", entry.absolute_path.display());
        }
        Ok(())
    }

    async fn restore(&self, backup: PathBuf, destination: PathBuf) -> Result<(), UserDataError> {
        run_blocking_task(move || {
            backup::restore_backup(&backup, &destination).map_err(|e| {
                UserDataError::IoError(
                    format!("failed to restore '{}'", destination.display()),
                    e,
                )
            })
        })
        .await
    }

    /// Removes an installed file if it still holds the installed content and
    /// restores its backup. Returns a message if the file was left in place.
    async fn remove_installed(
        &self,
        game: GameType,
        entry: &UserDataFileEntry,
    ) -> Result<Result<(), String>, UserDataError> {
        let content_path = self.content_path(entry).await;
        let prune_root = self.prune_root(game, entry);
        let entry = entry.clone();
        run_blocking_task(move || {
            let outcome = remove_installed_file(&entry, content_path.as_deref());
            if outcome.is_ok() {
                if let (Some(root), Some(parent)) = (prune_root, entry.absolute_path.parent()) {
                    prune_empty_parents(parent, &root);
                }
            }
            Ok::<_, UserDataError>(outcome)
        })
        .await
    }

    /// Recreates the missing hard links of every inactive installation of
    /// `profile_id`.
    #[instrument(skip(self, cancellation_token))]
    pub async fn activate_profile(
        &self,
        profile_id: &ProfileId,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let started = Instant::now();
        let mut result = UserDataOperationResult::default();
        let keys = self
            .store
            .read(|index| index.installations_for_profile(profile_id))
            .await?;

        for key in keys {
            let Some(mut record) = self.store.load_manifest(&key).await? else {
                tracing::warn!("the record of {key} is missing");
                continue;
            };
            if record.is_active {
                continue;
            }

            let mut relinked = Vec::new();
            for entry in record.files.iter_mut().filter(|entry| entry.is_hard_link) {
                if cancellation_token.is_cancelled() {
                    return Err(UserDataError::Cancelled);
                }
                if entry_exists(&entry.absolute_path) {
                    tracing::debug!(
                        "'{}' already exists, leaving it alone",
                        entry.absolute_path.display()
                    );
                    continue;
                }
                match self
                    .materializer
                    .materialize_from_cas(&entry.source_hash, &entry.absolute_path, HARDLINK_OR_COPY)
                    .await
                {
                    Ok(materialized) => {
                        entry.is_hard_link =
                            materialized == Materialized::Linked(LinkMethod::Hardlink);
                        relinked.push(entry.absolute_path.clone());
                        result.files_processed += 1;
                        result.bytes_processed += entry.size;
                    }
                    Err(LinkFileError::Cancelled) => return Err(UserDataError::Cancelled),
                    Err(err) => result
                        .errors
                        .push(format!("{}: {err}", entry.absolute_path.display())),
                }
            }

            record.is_active = true;
            self.store.save_manifest(&record).await?;
            // Files that were already there belong to whoever put them there.
            self.store
                .mutate(|index| index.claim_files(&key, relinked.iter().map(PathBuf::as_path)))
                .await?;
            tracing::debug!("activated {key}");
        }

        Ok(result.finish(started))
    }

    /// Removes the hard links of every active installation of `profile_id`.
    /// Copies are left alone.
    #[instrument(skip(self, cancellation_token))]
    pub async fn deactivate_profile(
        &self,
        profile_id: &ProfileId,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let started = Instant::now();
        let mut result = UserDataOperationResult::default();
        let keys = self
            .store
            .read(|index| index.installations_for_profile(profile_id))
            .await?;

        for key in keys {
            let Some(mut record) = self.store.load_manifest(&key).await? else {
                tracing::warn!("the record of {key} is missing");
                continue;
            };
            if !record.is_active {
                continue;
            }

            for entry in record.files.iter().filter(|entry| entry.is_hard_link) {
                if cancellation_token.is_cancelled() {
                    return Err(UserDataError::Cancelled);
                }
                let content_path = self.content_path(entry).await;
                let prune_root = self.prune_root(record.target_game, entry);
                let owned = entry.clone();
                let removed = run_blocking_task(move || {
                    Ok::<_, UserDataError>(remove_hard_link(
                        &owned,
                        content_path.as_deref(),
                        prune_root.as_deref(),
                    ))
                })
                .await?;
                match removed {
                    Ok(true) => {
                        result.files_processed += 1;
                        result.bytes_processed += entry.size;
                    }
                    Ok(false) => {}
                    Err(message) => result.errors.push(message),
                }
            }

            record.is_active = false;
            self.store.save_manifest(&record).await?;
            tracing::debug!("deactivated {key}");
        }

        Ok(result.finish(started))
    }

    /// Removes every file of the installation of `manifest_id` for
    /// `profile_id`, restores the backups and forgets the installation.
    ///
    /// Files that were modified since they were installed are left in place.
    #[instrument(skip(self, cancellation_token))]
    pub async fn uninstall(
        &self,
        manifest_id: &ManifestId,
        profile_id: &ProfileId,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let key = InstallationKey::new(manifest_id, profile_id);
        let Some(record) = self.store.load_manifest(&key).await? else {
            return Err(UserDataError::NotInstalled(key));
        };
        self.uninstall_record(record, cancellation_token).await
    }

    async fn uninstall_record(
        &self,
        record: UserDataManifest,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let started = Instant::now();
        let mut result = UserDataOperationResult::default();
        let key = &record.installation_key;

        for entry in &record.files {
            if cancellation_token.is_cancelled() {
                return Err(UserDataError::Cancelled);
            }
            let owner = self
                .store
                .read(|index| index.owner_of(&entry.absolute_path).cloned())
                .await?;
            if let Some(owner) = owner.filter(|owner| owner != key) {
                tracing::debug!(
                    "'{}' now belongs to {owner}, leaving it alone",
                    entry.absolute_path.display()
                );
                self.hand_over_backup(&owner, entry).await?;
                continue;
            }
            match self.remove_installed(record.target_game, entry).await? {
                Ok(()) => {
                    result.files_processed += 1;
                    result.bytes_processed += entry.size;
                }
                Err(message) => {
                    tracing::warn!("{message}");
                    result.errors.push(message);
                }
            }
        }

        self.store.delete_manifest(key).await?;
        self.store.mutate(|index| index.unregister(&record)).await?;
        tracing::info!("uninstalled {key}");
        Ok(result.finish(started))
    }

    /// Removes every installation that belongs to `profile_id`, typically
    /// because the profile was deleted. Installations the profile adopted
    /// from another profile are only detached.
    pub async fn uninstall_all_for_profile(
        &self,
        profile_id: &ProfileId,
        cancellation_token: &CancellationToken,
    ) -> Result<UserDataOperationResult, UserDataError> {
        let started = Instant::now();
        let mut result = UserDataOperationResult::default();
        let keys = self
            .store
            .read(|index| index.installations_for_profile(profile_id))
            .await?;

        for key in keys {
            match self.store.load_manifest(&key).await? {
                Some(record) if &record.profile_id == profile_id => {
                    result.merge(self.uninstall_record(record, cancellation_token).await?);
                }
                _ => {
                    self.store
                        .mutate(|index| index.disown(profile_id, &key))
                        .await?;
                }
            }
        }
        Ok(result.finish(started))
    }

    /// Checks that every file of the installation is still present and
    /// unmodified. The time of the check is recorded either way.
    pub async fn verify_installation(
        &self,
        manifest_id: &ManifestId,
        profile_id: &ProfileId,
    ) -> Result<bool, UserDataError> {
        let key = InstallationKey::new(manifest_id, profile_id);
        let Some(mut record) = self.store.load_manifest(&key).await? else {
            return Err(UserDataError::NotInstalled(key));
        };

        let checks: Vec<bool> = futures::stream::iter(record.files.clone())
            .map(|entry| async move {
                let content_path = self.content_path(&entry).await;
                run_blocking_task(move || {
                    Ok::<_, UserDataError>(verify_entry(&entry, content_path.as_deref()))
                })
                .await
            })
            .buffer_unordered(VERIFY_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;
        let is_valid = checks.into_iter().all(|valid| valid);

        record.last_verified_at = Some(Utc::now());
        self.store.save_manifest(&record).await?;
        if !is_valid {
            tracing::info!("{key} failed verification");
        }
        Ok(is_valid)
    }

    /// Makes every installation of `from` also an installation of `to`, so
    /// that the files stay in place when switching between the profiles.
    pub async fn adopt_installations(
        &self,
        from: &ProfileId,
        to: &ProfileId,
    ) -> Result<usize, UserDataError> {
        let adopted = self.store.mutate(|index| index.adopt(from, to)).await?;
        tracing::debug!("profile '{to}' adopted {adopted} installations of '{from}'");
        Ok(adopted)
    }

    /// Deletes all tracking data (records, index and backups). Installed
    /// files are not touched.
    ///
    /// The tracking directory must contain the application name, otherwise
    /// nothing is deleted.
    pub async fn delete_all(&self) -> Result<(), UserDataError> {
        let root = std::path::absolute(self.store.root()).map_err(|e| {
            UserDataError::IoError(String::from("failed to resolve the tracking root"), e)
        })?;
        let belongs_to_app = root
            .to_string_lossy()
            .to_lowercase()
            .contains(&self.app_name.to_lowercase());
        if self.app_name.trim().is_empty() || !belongs_to_app {
            return Err(UserDataError::UnsafeDeletion(root, self.app_name.clone()));
        }

        match fs_err::tokio::remove_dir_all(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(UserDataError::IoError(
                    format!("failed to delete '{}'", root.display()),
                    e,
                ))
            }
        }
        self.store.reset().await;
        tracing::info!("deleted all user data tracking in '{}'", root.display());
        Ok(())
    }

    /// Returns all installations of a profile, including adopted ones.
    pub async fn get_profile_installations(
        &self,
        profile_id: &ProfileId,
    ) -> Result<Vec<UserDataManifest>, UserDataError> {
        let keys = self
            .store
            .read(|index| index.installations_for_profile(profile_id))
            .await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.store.load_manifest(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Returns the installation of `manifest_id` for `profile_id`.
    pub async fn get_installation(
        &self,
        manifest_id: &ManifestId,
        profile_id: &ProfileId,
    ) -> Result<Option<UserDataManifest>, UserDataError> {
        self.store
            .load_manifest(&InstallationKey::new(manifest_id, profile_id))
            .await
    }

    /// Returns the installation that owns the file at `path`.
    pub async fn owner_of(&self, path: &Path) -> Result<Option<InstallationKey>, UserDataError> {
        self.store
            .read(|index| index.owner_of(path).cloned())
            .await
    }

    /// Returns true if the file at `path` was installed by any installation.
    pub async fn is_file_tracked(&self, path: &Path) -> Result<bool, UserDataError> {
        Ok(self.owner_of(path).await?.is_some())
    }
}

fn installation_record(
    key: &InstallationKey,
    manifest: &ContentManifest,
    profile_id: &ProfileId,
    files: Vec<UserDataFileEntry>,
) -> UserDataManifest {
    UserDataManifest {
        installation_key: key.clone(),
        manifest_id: manifest.id.clone(),
        profile_id: profile_id.clone(),
        target_game: manifest.target_game,
        manifest_version: manifest.version.clone(),
        installed_at: Utc::now(),
        last_verified_at: None,
        is_active: true,
        total_size_bytes: files.iter().map(|entry| entry.size).sum(),
        files,
    }
}

/// Returns true if the file at `path` still holds the installed content.
fn holds_installed_content(
    entry: &UserDataFileEntry,
    content_path: Option<&Path>,
) -> std::io::Result<bool> {
    match content_path {
        Some(content_path) if entry.is_hard_link => is_same_file(content_path, &entry.absolute_path),
        _ => Ok(compute_file_hash(&entry.absolute_path)? == entry.source_hash),
    }
}

fn remove_installed_file(entry: &UserDataFileEntry, content_path: Option<&Path>) -> Result<(), String> {
    let path = &entry.absolute_path;
    if entry_exists(path) {
        match holds_installed_content(entry, content_path) {
            Ok(true) => {
                remove_file_if_exists(path)
                    .map_err(|err| format!("{}: failed to remove: {err}", path.display()))?;
            }
            Ok(false) => {
                return Err(format!(
                    "{}: modified since it was installed, left in place",
                    path.display()
                ))
            }
            Err(err) => return Err(format!("{}: failed to inspect: {err}", path.display())),
        }
    }

    if let Some(backup) = entry.backup_path.as_deref() {
        if backup.exists() {
            backup::restore_backup(backup, path)
                .map_err(|err| format!("{}: failed to restore backup: {err}", path.display()))?;
        } else {
            tracing::warn!("the backup '{}' no longer exists", backup.display());
        }
    }
    Ok(())
}

/// Removes the hard link of `entry` to `content_path`. Without the content
/// the file is only removed if it still hashes to the installed content.
/// Returns false if nothing was there.
fn remove_hard_link(
    entry: &UserDataFileEntry,
    content_path: Option<&Path>,
    prune_root: Option<&Path>,
) -> Result<bool, String> {
    let path = &entry.absolute_path;
    if !entry_exists(path) {
        return Ok(false);
    }
    let is_installed = match content_path {
        Some(content_path) => is_same_file(content_path, path).unwrap_or(false),
        None => compute_file_hash(path).is_ok_and(|hash| hash == entry.source_hash),
    };
    if !is_installed {
        return Err(format!(
            "{}: no longer holds the installed content, left in place",
            path.display()
        ));
    }
    remove_file_if_exists(path).map_err(|err| format!("{}: failed to remove: {err}", path.display()))?;
    if let (Some(root), Some(parent)) = (prune_root, path.parent()) {
        prune_empty_parents(parent, root);
    }
    Ok(true)
}

fn verify_entry(entry: &UserDataFileEntry, content_path: Option<&Path>) -> bool {
    let path = &entry.absolute_path;
    let valid = match std::fs::metadata(path) {
        Err(_) => false,
        Ok(_) if entry.is_hard_link && content_path.is_some() => {
            holds_installed_content(entry, content_path).unwrap_or(false)
        }
        Ok(metadata) if entry.is_hard_link => metadata.len() == entry.size,
        Ok(_) => compute_file_hash(path).is_ok_and(|hash| hash == entry.source_hash),
    };
    if !valid {
        tracing::debug!("'{}' is missing or modified", path.display());
    }
    valid
}
