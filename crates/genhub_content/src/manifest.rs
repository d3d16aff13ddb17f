//! The content manifests that are materialized by this crate. Manifests are
//! produced upstream (by content resolution) and are read-only here.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use genhub_cas::ContentHash;
use serde::{Deserialize, Serialize};

/// Identifies a [`ContentManifest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(String);

/// Identifies a user profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(ManifestId);
string_id!(ProfileId);

/// The kind of content a manifest describes. The kind determines which
/// manifest wins when several manifests provide the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// The base game installation.
    GameInstallation,
    /// A (community) game client, i.e. an executable that runs the game.
    GameClient,
    /// An add-on on top of the game.
    Addon,
    /// A patch of the game.
    Patch,
    /// A mod.
    Mod,
    /// A single map.
    Map,
    /// A collection of maps.
    MapPack,
    /// A replay.
    Replay,
    /// Any content type this crate does not know about.
    #[serde(other)]
    Unknown,
}

impl ContentType {
    /// Returns the priority of this content type. When multiple manifests
    /// provide the same file, the manifest with the highest priority wins.
    pub fn priority(self) -> u32 {
        match self {
            ContentType::Mod => 100,
            ContentType::Patch => 90,
            ContentType::GameClient => 50,
            ContentType::Addon => 40,
            ContentType::GameInstallation => 10,
            ContentType::Map
            | ContentType::MapPack
            | ContentType::Replay
            | ContentType::Unknown => 0,
        }
    }
}

/// The game a manifest targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GameType {
    /// Command & Conquer: Generals.
    Generals,
    /// Command & Conquer: Generals - Zero Hour.
    #[default]
    ZeroHour,
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameType::Generals => write!(f, "Generals"),
            GameType::ZeroHour => write!(f, "ZeroHour"),
        }
    }
}

/// Where a file of a manifest ends up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallTarget {
    /// The ephemeral workspace the game is run from.
    #[default]
    Workspace,
    /// A system location. Never materialized by this crate.
    System,
    /// The root of the user's game data directory.
    UserDataDirectory,
    /// The user's maps directory.
    UserMapsDirectory,
    /// The user's replays directory.
    UserReplaysDirectory,
    /// The user's screenshots directory.
    UserScreenshotsDirectory,
}

impl InstallTarget {
    /// Returns true if files with this target are written into directories
    /// owned by the user.
    pub fn is_user_data(self) -> bool {
        matches!(
            self,
            InstallTarget::UserDataDirectory
                | InstallTarget::UserMapsDirectory
                | InstallTarget::UserReplaysDirectory
                | InstallTarget::UserScreenshotsDirectory
        )
    }
}

/// Where the bytes of a file come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    /// The file was downloaded from a publisher. By the time it is
    /// materialized the content must be present in the CAS.
    Remote,
    /// The file is stored in the CAS.
    #[default]
    ContentAddressable,
    /// The file lives on the local filesystem, relative to the base
    /// installation of the configuration.
    Filesystem,
}

/// A single file of a [`ContentManifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    /// The path of the file relative to its install location.
    pub relative_path: PathBuf,

    /// The hash of the content of the file.
    pub hash: ContentHash,

    /// The size of the file in bytes.
    pub size: u64,

    /// Where the file is installed.
    #[serde(default)]
    pub install_target: InstallTarget,

    /// Where the content of the file comes from.
    #[serde(default)]
    pub source_type: SourceType,

    /// For [`SourceType::Filesystem`] files, the location of the file relative
    /// to the base installation. Defaults to `relative_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,

    /// Whether the file is an executable.
    #[serde(default)]
    pub is_executable: bool,
}

impl ManifestFile {
    /// Constructs a workspace file that is stored in the CAS.
    pub fn new(relative_path: impl Into<PathBuf>, hash: ContentHash, size: u64) -> Self {
        Self {
            relative_path: relative_path.into(),
            hash,
            size,
            install_target: InstallTarget::default(),
            source_type: SourceType::default(),
            source_path: None,
            is_executable: false,
        }
    }

    /// Sets the install target of the file.
    #[must_use]
    pub fn with_install_target(self, install_target: InstallTarget) -> Self {
        Self {
            install_target,
            ..self
        }
    }

    /// Marks the file as coming from the local filesystem at `source_path`
    /// (relative to the base installation).
    #[must_use]
    pub fn with_filesystem_source(self, source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_type: SourceType::Filesystem,
            source_path: Some(source_path.into()),
            ..self
        }
    }

    /// Returns the location of a [`SourceType::Filesystem`] file relative to
    /// the base installation.
    pub fn filesystem_source(&self) -> &Path {
        self.source_path.as_deref().unwrap_or(&self.relative_path)
    }
}

/// One unit of installable content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentManifest {
    /// The unique identifier of the manifest.
    pub id: ManifestId,

    /// A human readable name.
    #[serde(default)]
    pub name: String,

    /// The kind of content.
    pub content_type: ContentType,

    /// The version of the content.
    #[serde(default)]
    pub version: String,

    /// The game this content is meant for.
    #[serde(default)]
    pub target_game: GameType,

    /// The files of the manifest, in order.
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

impl ContentManifest {
    /// Constructs an empty manifest.
    pub fn new(id: impl Into<ManifestId>, content_type: ContentType) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            content_type,
            version: String::from("1.0"),
            target_game: GameType::default(),
            files: Vec::new(),
        }
    }

    /// Adds a file to the manifest.
    #[must_use]
    pub fn with_file(mut self, file: ManifestFile) -> Self {
        self.files.push(file);
        self
    }

    /// Sets the version of the manifest.
    #[must_use]
    pub fn with_version(self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..self
        }
    }

    /// Returns the files of this manifest that are written into user owned
    /// directories.
    pub fn user_data_files(&self) -> impl Iterator<Item = &ManifestFile> + '_ {
        self.files
            .iter()
            .filter(|file| file.install_target.is_user_data())
    }

    /// Returns the files of this manifest that are materialized in a
    /// workspace.
    pub fn workspace_files(&self) -> impl Iterator<Item = &ManifestFile> + '_ {
        self.files
            .iter()
            .filter(|file| file.install_target == InstallTarget::Workspace)
    }
}
