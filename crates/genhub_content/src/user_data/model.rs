use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use genhub_cas::ContentHash;
use serde::{Deserialize, Serialize};

use crate::manifest::{GameType, InstallTarget, ManifestId, ProfileId};

/// Identifies the installation of one manifest for one profile. Formatted as
/// `<manifest id>_<profile id>`.
///
/// The key is only ever constructed, never parsed, so ids that contain an
/// underscore are fine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallationKey(String);

impl InstallationKey {
    /// Constructs the key of `manifest_id` installed for `profile_id`.
    pub fn new(manifest_id: &ManifestId, profile_id: &ProfileId) -> Self {
        Self(format!("{manifest_id}_{profile_id}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstallationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single file installed into a user data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataFileEntry {
    /// The path of the file as declared in the manifest.
    pub relative_path: PathBuf,
    /// Where the file was installed.
    pub absolute_path: PathBuf,
    /// The hash of the installed content.
    pub source_hash: ContentHash,
    /// The size of the file in bytes.
    pub size: u64,
    /// The directory the file was installed into.
    pub install_target: InstallTarget,
    /// True if the file is a hard link to the content store.
    pub is_hard_link: bool,
    /// A copy of the user's file that was displaced by this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    /// True if a file existed at the location before installation.
    #[serde(default)]
    pub was_overwritten: bool,
}

/// The record of one installation of a manifest for a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataManifest {
    /// The key of the installation.
    pub installation_key: InstallationKey,
    /// The installed manifest.
    pub manifest_id: ManifestId,
    /// The profile the manifest is installed for.
    pub profile_id: ProfileId,
    /// The game whose user data directory contains the files.
    pub target_game: GameType,
    /// The version of the manifest that was installed.
    pub manifest_version: String,
    /// When the manifest was first installed.
    pub installed_at: DateTime<Utc>,
    /// When the files were last verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified_at: Option<DateTime<Utc>>,
    /// Whether the files are currently present on disk.
    pub is_active: bool,
    /// The installed files.
    pub files: Vec<UserDataFileEntry>,
    /// The combined size of all files in bytes.
    pub total_size_bytes: u64,
}

impl UserDataManifest {
    /// Returns the entry installed at `absolute_path`.
    pub fn entry(&self, absolute_path: &Path) -> Option<&UserDataFileEntry> {
        self.files
            .iter()
            .find(|entry| entry.absolute_path == absolute_path)
    }
}

/// Reverse lookups over all installations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserDataIndex {
    installations: BTreeSet<InstallationKey>,
    file_to_installation: BTreeMap<PathBuf, InstallationKey>,
    profile_installations: BTreeMap<ProfileId, BTreeSet<InstallationKey>>,
    manifest_installations: BTreeMap<ManifestId, BTreeSet<InstallationKey>>,
}

impl UserDataIndex {
    /// Returns true if the installation is known.
    pub fn contains(&self, key: &InstallationKey) -> bool {
        self.installations.contains(key)
    }

    /// Returns the installation that owns the file at `absolute_path`.
    pub fn owner_of(&self, absolute_path: &Path) -> Option<&InstallationKey> {
        self.file_to_installation.get(absolute_path)
    }

    /// Returns the installations that belong to (or were adopted by) a
    /// profile.
    pub fn installations_for_profile(&self, profile_id: &ProfileId) -> BTreeSet<InstallationKey> {
        self.profile_installations
            .get(profile_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns all installations of a manifest.
    pub fn installations_for_manifest(
        &self,
        manifest_id: &ManifestId,
    ) -> BTreeSet<InstallationKey> {
        self.manifest_installations
            .get(manifest_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of known installations.
    pub fn len(&self) -> usize {
        self.installations.len()
    }

    /// Returns true if nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.installations.is_empty()
    }

    /// Records `manifest` and claims all of its files.
    pub(crate) fn register(&mut self, manifest: &UserDataManifest) {
        let key = &manifest.installation_key;
        self.installations.insert(key.clone());
        self.claim_files(
            key,
            manifest.files.iter().map(|entry| entry.absolute_path.as_path()),
        );
        self.profile_installations
            .entry(manifest.profile_id.clone())
            .or_default()
            .insert(key.clone());
        self.manifest_installations
            .entry(manifest.manifest_id.clone())
            .or_default()
            .insert(key.clone());
    }

    /// Makes `key` the owner of `files`.
    pub(crate) fn claim_files<'a>(
        &mut self,
        key: &InstallationKey,
        files: impl IntoIterator<Item = &'a Path>,
    ) {
        for path in files {
            if let Some(previous) = self
                .file_to_installation
                .insert(path.to_path_buf(), key.clone())
                .filter(|previous| previous != key)
            {
                tracing::debug!("'{}' changed owner from {previous} to {key}", path.display());
            }
        }
    }

    /// Releases those of `files` that are still owned by `key`.
    pub(crate) fn release_files<'a>(
        &mut self,
        key: &InstallationKey,
        files: impl IntoIterator<Item = &'a Path>,
    ) {
        for path in files {
            if self.file_to_installation.get(path) == Some(key) {
                self.file_to_installation.remove(path);
            }
        }
    }

    /// Forgets `manifest` entirely.
    pub(crate) fn unregister(&mut self, manifest: &UserDataManifest) {
        let key = &manifest.installation_key;
        self.installations.remove(key);
        self.release_files(
            key,
            manifest.files.iter().map(|entry| entry.absolute_path.as_path()),
        );
        for keys in self.profile_installations.values_mut() {
            keys.remove(key);
        }
        self.profile_installations.retain(|_, keys| !keys.is_empty());
        if let Some(keys) = self.manifest_installations.get_mut(&manifest.manifest_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.manifest_installations.remove(&manifest.manifest_id);
            }
        }
    }

    /// Makes every installation of `from` also an installation of `to`.
    pub(crate) fn adopt(&mut self, from: &ProfileId, to: &ProfileId) -> usize {
        let adopted = self.installations_for_profile(from);
        let count = adopted.len();
        if count > 0 {
            self.profile_installations
                .entry(to.clone())
                .or_default()
                .extend(adopted);
        }
        count
    }

    /// Removes an adopted installation from a profile without touching the
    /// installation itself.
    pub(crate) fn disown(&mut self, profile_id: &ProfileId, key: &InstallationKey) {
        if let Some(keys) = self.profile_installations.get_mut(profile_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.profile_installations.remove(profile_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use genhub_cas::compute_bytes_hash;

    use super::*;

    fn manifest(manifest: &str, profile: &str, files: &[&str]) -> UserDataManifest {
        let manifest_id = ManifestId::from(manifest);
        let profile_id = ProfileId::from(profile);
        UserDataManifest {
            installation_key: InstallationKey::new(&manifest_id, &profile_id),
            manifest_id,
            profile_id,
            target_game: GameType::ZeroHour,
            manifest_version: String::from("1.0"),
            installed_at: Utc::now(),
            last_verified_at: None,
            is_active: true,
            files: files
                .iter()
                .map(|path| UserDataFileEntry {
                    relative_path: PathBuf::from(path),
                    absolute_path: PathBuf::from("/data").join(path),
                    source_hash: compute_bytes_hash(path.as_bytes()),
                    size: 1,
                    install_target: InstallTarget::UserMapsDirectory,
                    is_hard_link: true,
                    backup_path: None,
                    was_overwritten: false,
                })
                .collect(),
            total_size_bytes: files.len() as u64,
        }
    }

    #[test]
    fn test_installation_key_format() {
        let key = InstallationKey::new(&ManifestId::from("maps_pack"), &ProfileId::from("p1"));
        assert_eq!(key.as_str(), "maps_pack_p1");
    }

    #[test]
    fn test_register_unregister() {
        let mut index = UserDataIndex::default();
        let a = manifest("a", "p1", &["x.map", "y.map"]);
        let b = manifest("b", "p1", &["y.map"]);
        index.register(&a);
        index.register(&b);

        // The last writer owns a contested file.
        assert_eq!(index.owner_of(Path::new("/data/y.map")), Some(&b.installation_key));
        assert_eq!(index.installations_for_profile(&a.profile_id).len(), 2);

        // Unregistering a does not release the file b owns.
        index.unregister(&a);
        assert_eq!(index.owner_of(Path::new("/data/x.map")), None);
        assert_eq!(index.owner_of(Path::new("/data/y.map")), Some(&b.installation_key));
        assert!(index.installations_for_manifest(&a.manifest_id).is_empty());
        assert_eq!(index.len(), 1);

        index.unregister(&b);
        assert!(index.is_empty());
        assert_eq!(index, UserDataIndex::default());
    }

    #[test]
    fn test_claim_only_the_given_files() {
        let mut index = UserDataIndex::default();
        let a = manifest("a", "p1", &["x.map", "y.map"]);
        let b = manifest("b", "p2", &["y.map"]);
        index.register(&a);
        index.register(&b);

        index.claim_files(&a.installation_key, [Path::new("/data/x.map")]);
        assert_eq!(index.owner_of(Path::new("/data/x.map")), Some(&a.installation_key));
        assert_eq!(index.owner_of(Path::new("/data/y.map")), Some(&b.installation_key));
    }

    #[test]
    fn test_adopt_and_disown() {
        let mut index = UserDataIndex::default();
        let a = manifest("a", "p1", &["x.map"]);
        index.register(&a);

        let p2 = ProfileId::from("p2");
        assert_eq!(index.adopt(&a.profile_id, &p2), 1);
        assert!(index.installations_for_profile(&p2).contains(&a.installation_key));

        index.disown(&p2, &a.installation_key);
        assert!(index.installations_for_profile(&p2).is_empty());
        assert!(index.contains(&a.installation_key));
    }

    #[test]
    fn test_index_serializes_paths_as_keys() {
        let mut index = UserDataIndex::default();
        index.register(&manifest("a", "p1", &["x.map"]));
        let json = serde_json::to_string(&index).unwrap();
        assert!(json.contains("fileToInstallation"));
        let roundtrip: UserDataIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(roundtrip, index);
    }
}
