//! Materializes game content manifests on disk.
//!
//! Content (a base game installation, patches, mods, community clients, maps)
//! is described by [`ContentManifest`]s whose files are stored in a content
//! addressable store. This crate decides where those files end up and keeps
//! them consistent over repeated runs:
//!
//! * [`WorkspaceManager`] assembles ephemeral *workspaces* the game is
//!   launched from. Files that several manifests provide are resolved by
//!   content type priority (see [`conflict`]), and existing workspaces are
//!   repaired incrementally by the [`WorkspaceReconciler`].
//! * [`UserDataTracker`] installs content into directories the user owns,
//!   such as the maps directory, and keeps track of which installation owns
//!   which file so user files are never lost.
//! * [`ProfileContentLinker`] switches the user data between profiles.
//!
//! Files are placed with hard links, symbolic links or copies, see
//! [`link`].
#![deny(missing_docs)]

pub mod config;
pub mod conflict;
pub mod link;
pub mod manifest;
pub mod profile;
pub mod reconcile;
pub mod reporter;
pub mod user_data;
pub mod workspace;

mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ConfigError, ContentConfig, ReconcilePolicy};
pub use link::{FileMaterializer, LinkFileError, LinkMethod, Materialized};
pub use manifest::{
    ContentManifest, ContentType, GameType, InstallTarget, ManifestFile, ManifestId, ProfileId,
    SourceType,
};
pub use profile::{ProfileContentLinker, UserDataSwitchAnalysis};
pub use reconcile::{
    DeltaSummary, ReconcileError, WorkspaceDelta, WorkspaceOperation, WorkspaceReconciler,
};
pub use reporter::{PreparationPhase, ProgressEvent, Reporter};
pub use user_data::{
    InstallationKey, UserDataError, UserDataLocations, UserDataManifest, UserDataOperationResult,
    UserDataTracker,
};
pub use workspace::{
    CleanupAnalysis, PreparationStats, PreparedWorkspace, WorkspaceConfiguration, WorkspaceError,
    WorkspaceInfo, WorkspaceManager, WorkspaceStrategy, WorkspaceStrategyKind,
};
