use std::path::{Component, Path, PathBuf};

use crate::{
    manifest::{GameType, InstallTarget, ManifestFile},
    utils::normalize_relative_path,
};

/// The user owned directories of a single game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDataLocations {
    /// The root of the game's user data directory.
    pub user_data_root: PathBuf,
    /// The directory custom maps are read from.
    pub maps: PathBuf,
    /// The directory replays are saved to.
    pub replays: PathBuf,
    /// The directory screenshots are saved to.
    pub screenshots: PathBuf,
}

impl UserDataLocations {
    /// Constructs the locations with the standard sub directories of
    /// `user_data_root`.
    pub fn new(user_data_root: impl Into<PathBuf>) -> Self {
        let user_data_root = user_data_root.into();
        Self {
            maps: user_data_root.join("Maps"),
            replays: user_data_root.join("Replays"),
            screenshots: user_data_root.join("Screenshots"),
            user_data_root,
        }
    }

    /// Returns the locations the game uses by default, inside the user's
    /// documents directory.
    pub fn default_for(game: GameType) -> Option<Self> {
        let directory = match game {
            GameType::Generals => "Command and Conquer Generals Data",
            GameType::ZeroHour => "Command and Conquer Generals Zero Hour Data",
        };
        dirs::document_dir().map(|documents| Self::new(documents.join(directory)))
    }

    /// Returns the directory that contains all files installed for `target`.
    pub fn root_for(&self, target: InstallTarget) -> Option<&Path> {
        match target {
            InstallTarget::UserDataDirectory => Some(&self.user_data_root),
            InstallTarget::UserMapsDirectory => Some(&self.maps),
            InstallTarget::UserReplaysDirectory => Some(&self.replays),
            InstallTarget::UserScreenshotsDirectory => Some(&self.screenshots),
            InstallTarget::Workspace | InstallTarget::System => None,
        }
    }

    /// Returns where `file` is installed, or `None` if its target is not a
    /// user data directory.
    ///
    /// Manifests often repeat the name of the target directory as the first
    /// segment of the path (`Maps/MyMap/MyMap.map`). That segment is stripped
    /// so the file does not end up in `Maps/Maps`.
    pub fn resolve(&self, file: &ManifestFile) -> Option<PathBuf> {
        let root = self.root_for(file.install_target)?;
        let relative = normalize_relative_path(&file.relative_path);
        let relative = match file.install_target {
            InstallTarget::UserMapsDirectory => strip_leading_segment(&relative, "Maps"),
            InstallTarget::UserReplaysDirectory => strip_leading_segment(&relative, "Replays"),
            InstallTarget::UserScreenshotsDirectory => {
                strip_leading_segment(&relative, "Screenshots")
            }
            _ => relative,
        };
        Some(root.join(relative))
    }
}

fn strip_leading_segment(path: &Path, segment: &str) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first))
            if first.to_string_lossy().eq_ignore_ascii_case(segment)
                && components.clone().next().is_some() =>
        {
            components.as_path().to_path_buf()
        }
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use genhub_cas::compute_bytes_hash;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(InstallTarget::UserMapsDirectory, "Maps/Desert/Desert.map", "/data/Maps/Desert/Desert.map")]
    #[case(InstallTarget::UserMapsDirectory, "maps\\Desert.map", "/data/Maps/Desert.map")]
    #[case(InstallTarget::UserMapsDirectory, "Desert.map", "/data/Maps/Desert.map")]
    #[case(InstallTarget::UserReplaysDirectory, "Replays/last.rep", "/data/Replays/last.rep")]
    #[case(InstallTarget::UserScreenshotsDirectory, "shot.bmp", "/data/Screenshots/shot.bmp")]
    #[case(InstallTarget::UserDataDirectory, "Maps/Desert.map", "/data/Maps/Desert.map")]
    fn test_resolve(#[case] target: InstallTarget, #[case] relative: &str, #[case] expected: &str) {
        let locations = UserDataLocations::new("/data");
        let file = ManifestFile::new(relative, compute_bytes_hash(b""), 0).with_install_target(target);
        assert_eq!(locations.resolve(&file), Some(PathBuf::from(expected)));
    }

    #[test]
    fn test_workspace_files_are_not_user_data() {
        let locations = UserDataLocations::new("/data");
        let file = ManifestFile::new("game.exe", compute_bytes_hash(b""), 0);
        assert_eq!(locations.resolve(&file), None);
    }

    #[test]
    fn test_a_lone_segment_is_kept() {
        assert_eq!(
            strip_leading_segment(Path::new("Maps"), "Maps"),
            PathBuf::from("Maps")
        );
    }
}
