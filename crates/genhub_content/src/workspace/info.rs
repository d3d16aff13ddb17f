use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::{ContentManifest, ManifestId};

/// How files are placed in a workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkspaceStrategyKind {
    /// Every file is a symbolic link into the CAS.
    SymlinkOnly,
    /// Every file is a hard link to the CAS, falling back to a copy.
    HardLink,
    /// Every file is copied.
    FullCopy,
    /// Essential files are copied, everything else is symlinked.
    #[default]
    HybridCopySymlink,
}

impl fmt::Display for WorkspaceStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceStrategyKind::SymlinkOnly => write!(f, "symlink-only"),
            WorkspaceStrategyKind::HardLink => write!(f, "hard-link"),
            WorkspaceStrategyKind::FullCopy => write!(f, "full-copy"),
            WorkspaceStrategyKind::HybridCopySymlink => write!(f, "hybrid-copy-symlink"),
        }
    }
}

/// The input of a single materialization run. Not persisted.
#[derive(Debug, Clone)]
pub struct WorkspaceConfiguration {
    /// The identifier of the workspace, also the name of its directory.
    pub id: String,

    /// The directory of the base game installation. Files with a filesystem
    /// source are read relative to this directory.
    pub base_installation_path: PathBuf,

    /// The directory in which workspaces are created.
    pub workspace_root: PathBuf,

    /// The manifests to materialize, in priority-independent input order.
    pub manifests: Vec<ContentManifest>,

    /// How files are placed.
    pub strategy: WorkspaceStrategyKind,

    /// Throw away any existing workspace and start from scratch.
    pub force_recreate: bool,

    /// Validate the workspace after it has been prepared.
    pub validate_after_preparation: bool,

    /// The path of the game executable relative to the workspace, if any.
    pub executable: Option<PathBuf>,
}

impl WorkspaceConfiguration {
    /// Constructs a configuration with default flags.
    pub fn new(
        id: impl Into<String>,
        base_installation_path: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        manifests: Vec<ContentManifest>,
        strategy: WorkspaceStrategyKind,
    ) -> Self {
        Self {
            id: id.into(),
            base_installation_path: base_installation_path.into(),
            workspace_root: workspace_root.into(),
            manifests,
            strategy,
            force_recreate: false,
            validate_after_preparation: false,
            executable: None,
        }
    }

    /// Returns the directory of the workspace.
    pub fn workspace_path(&self) -> PathBuf {
        self.workspace_root.join(&self.id)
    }

    /// Returns the ids of all manifests of the configuration.
    pub fn manifest_ids(&self) -> BTreeSet<ManifestId> {
        self.manifests.iter().map(|m| m.id.clone()).collect()
    }
}

/// A snapshot of a materialized workspace. Persisted in the workspace index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    /// The identifier of the workspace.
    pub id: String,

    /// The directory of the workspace.
    pub workspace_path: PathBuf,

    /// The strategy that was used to create the workspace.
    pub strategy: WorkspaceStrategyKind,

    /// The absolute path of the game executable, if one was declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<PathBuf>,

    /// The number of files in the workspace.
    pub file_count: usize,

    /// The total size of all files of the workspace in bytes.
    #[serde(default)]
    pub total_size_bytes: u64,

    /// The manifests the workspace was built from. Older records may not have
    /// this information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_ids: Option<BTreeSet<ManifestId>>,

    /// When the workspace was first created.
    pub created_at: DateTime<Utc>,

    /// When the workspace was last prepared or reused.
    pub last_accessed_at: DateTime<Utc>,

    /// Whether preparation finished.
    #[serde(default)]
    pub is_prepared: bool,
}

impl WorkspaceInfo {
    /// Returns true if the workspace was built from exactly the manifests of
    /// `configuration` using the same strategy.
    pub fn matches(&self, configuration: &WorkspaceConfiguration) -> bool {
        self.strategy == configuration.strategy
            && self
                .manifest_ids
                .as_ref()
                .is_some_and(|ids| *ids == configuration.manifest_ids())
    }

    /// Returns the directory of the workspace.
    pub fn path(&self) -> &Path {
        &self.workspace_path
    }
}
