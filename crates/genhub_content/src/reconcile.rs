//! Computes the difference between the files a workspace should contain and
//! the files that are actually on disk.
//!
//! The reconciler never modifies the filesystem. It produces a list of
//! [`WorkspaceDelta`]s that a strategy may execute. Every expected file is
//! classified as [`WorkspaceOperation::Add`], [`WorkspaceOperation::Update`]
//! or [`WorkspaceOperation::Skip`], every file on disk that is no longer
//! expected as [`WorkspaceOperation::Remove`].

use std::{
    collections::BTreeSet,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use genhub_cas::{compute_file_hash, path_for_hash};
use indexmap::IndexMap;
use simple_spawn_blocking::{tokio::run_blocking_task, Cancelled};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ReconcilePolicy,
    conflict::{resolve_expected_files, ResolvedFile},
    manifest::{InstallTarget, ManifestFile, ManifestId},
    utils::normalize_relative_path,
    workspace::{WorkspaceConfiguration, WorkspaceInfo},
};

/// What to do with a single file of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceOperation {
    /// The file does not exist yet.
    Add,
    /// The file exists but its content is outdated.
    Update,
    /// The file exists but is no longer part of any manifest.
    Remove,
    /// The file is up to date.
    Skip,
}

impl fmt::Display for WorkspaceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceOperation::Add => write!(f, "add"),
            WorkspaceOperation::Update => write!(f, "update"),
            WorkspaceOperation::Remove => write!(f, "remove"),
            WorkspaceOperation::Skip => write!(f, "skip"),
        }
    }
}

/// One planned change to a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceDelta {
    /// The kind of change.
    pub operation: WorkspaceOperation,
    /// The expected file. `None` for [`WorkspaceOperation::Remove`].
    pub file: Option<ManifestFile>,
    /// The manifest that provides the expected file.
    pub manifest_id: Option<ManifestId>,
    /// The normalized path of the file relative to the workspace.
    pub relative_path: PathBuf,
    /// The absolute path of the file in the workspace.
    pub workspace_path: PathBuf,
    /// Why this operation was chosen.
    pub reason: String,
}

/// Aggregate counts of a delta plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaSummary {
    /// Number of files to add.
    pub add: usize,
    /// Number of files to update.
    pub update: usize,
    /// Number of files to remove.
    pub remove: usize,
    /// Number of files that are up to date.
    pub skip: usize,
}

impl DeltaSummary {
    /// Counts the operations of a plan.
    pub fn from_deltas(deltas: &[WorkspaceDelta]) -> Self {
        deltas.iter().fold(Self::default(), |mut summary, delta| {
            match delta.operation {
                WorkspaceOperation::Add => summary.add += 1,
                WorkspaceOperation::Update => summary.update += 1,
                WorkspaceOperation::Remove => summary.remove += 1,
                WorkspaceOperation::Skip => summary.skip += 1,
            }
            summary
        })
    }

    /// Returns true if executing the plan would change the filesystem.
    pub fn has_changes(&self) -> bool {
        self.add + self.update + self.remove > 0
    }
}

/// Errors that can occur while reconciling a workspace.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The workspace directory could not be read.
    #[error("failed to read workspace '{0}'")]
    FailedToReadWorkspace(PathBuf, #[source] std::io::Error),

    /// A file of the workspace could not be inspected.
    #[error("failed to inspect '{0}'")]
    FailedToInspectFile(PathBuf, #[source] std::io::Error),

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<Cancelled> for ReconcileError {
    fn from(_: Cancelled) -> Self {
        ReconcileError::Cancelled
    }
}

/// Computes delta plans for workspaces.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceReconciler {
    policy: ReconcilePolicy,
}

impl WorkspaceReconciler {
    /// Constructs a reconciler that uses `policy` to decide which files to
    /// hash.
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy of this reconciler.
    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Returns the files a workspace for `configuration` should contain, after
    /// conflict resolution.
    pub fn expected_files(
        configuration: &WorkspaceConfiguration,
    ) -> IndexMap<PathBuf, ResolvedFile> {
        resolve_expected_files(&configuration.manifests, |file| {
            file.install_target == InstallTarget::Workspace
        })
    }

    /// Computes the delta plan for `configuration` given the workspace that
    /// was previously materialized, if any.
    pub async fn analyze(
        &self,
        configuration: &WorkspaceConfiguration,
        existing: Option<&WorkspaceInfo>,
        cancellation_token: &CancellationToken,
    ) -> Result<Vec<WorkspaceDelta>, ReconcileError> {
        let expected = Self::expected_files(configuration);
        let workspace_path = existing
            .map(|info| info.workspace_path.clone())
            .unwrap_or_else(|| configuration.workspace_path());

        let deltas = match existing {
            Some(info) if tokio::fs::try_exists(&info.workspace_path).await.unwrap_or(false) => {
                let policy = self.policy.clone();
                let cancellation_token = cancellation_token.clone();
                run_blocking_task(move || {
                    compute_deltas(&expected, &workspace_path, &policy, &cancellation_token)
                })
                .await?
            }
            _ => expected
                .into_iter()
                .map(|(relative_path, resolved)| WorkspaceDelta {
                    operation: WorkspaceOperation::Add,
                    workspace_path: workspace_path.join(&relative_path),
                    relative_path,
                    file: Some(resolved.file),
                    manifest_id: Some(resolved.manifest_id),
                    reason: String::from("new workspace"),
                })
                .collect(),
        };

        let summary = DeltaSummary::from_deltas(&deltas);
        tracing::info!(
            "reconciled workspace '{}': {} to add, {} to update, {} to remove, {} up to date",
            configuration.id,
            summary.add,
            summary.update,
            summary.remove,
            summary.skip
        );
        Ok(deltas)
    }
}

/// Lists all files (and symlinks) under `root` as normalized relative paths.
pub(crate) fn enumerate_files(root: &Path) -> Result<BTreeSet<PathBuf>, ReconcileError> {
    let mut files = BTreeSet::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            ReconcileError::FailedToReadWorkspace(path, e.into())
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.insert(normalize_relative_path(relative));
        }
    }
    Ok(files)
}

fn compute_deltas(
    expected: &IndexMap<PathBuf, ResolvedFile>,
    workspace_path: &Path,
    policy: &ReconcilePolicy,
    cancellation_token: &CancellationToken,
) -> Result<Vec<WorkspaceDelta>, ReconcileError> {
    let existing = enumerate_files(workspace_path)?;
    let mut deltas = Vec::with_capacity(expected.len());

    for (relative_path, resolved) in expected {
        if cancellation_token.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let absolute_path = workspace_path.join(relative_path);
        let (operation, reason) = if existing.contains(relative_path) {
            match needs_update(&absolute_path, relative_path, &resolved.file, policy)? {
                Some(reason) => (WorkspaceOperation::Update, reason),
                None => (WorkspaceOperation::Skip, String::from("up to date")),
            }
        } else {
            (WorkspaceOperation::Add, String::from("missing from workspace"))
        };

        deltas.push(WorkspaceDelta {
            operation,
            file: Some(resolved.file.clone()),
            manifest_id: Some(resolved.manifest_id.clone()),
            relative_path: relative_path.clone(),
            workspace_path: absolute_path,
            reason,
        });
    }

    for relative_path in existing {
        if !expected.contains_key(&relative_path) {
            deltas.push(WorkspaceDelta {
                operation: WorkspaceOperation::Remove,
                file: None,
                manifest_id: None,
                workspace_path: workspace_path.join(&relative_path),
                relative_path,
                reason: String::from("no longer in manifests"),
            });
        }
    }

    Ok(deltas)
}

/// Returns why the file at `path` must be updated to match `file`, or `None`
/// if it is up to date.
///
/// A symbolic link with the expected size is only skipped without hashing
/// when it points at the store object of the expected hash. A link to any
/// other object is hashed, because two store objects can have the same size
/// and the link may still point at the content of a previous winner.
fn needs_update(
    path: &Path,
    relative_path: &Path,
    file: &ManifestFile,
    policy: &ReconcilePolicy,
) -> Result<Option<String>, ReconcileError> {
    let inspect_err = |e| ReconcileError::FailedToInspectFile(path.to_path_buf(), e);
    let metadata = std::fs::symlink_metadata(path).map_err(inspect_err)?;

    if metadata.file_type().is_symlink() {
        let target = match std::fs::metadata(path) {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Some(String::from("broken symbolic link")))
            }
            Err(e) => return Err(inspect_err(e)),
        };
        if target.len() != file.size {
            return Ok(Some(format!(
                "size mismatch (expected {}, found {})",
                file.size,
                target.len()
            )));
        }

        // A link into the CAS object of the expected hash is trusted without
        // hashing. Links that point anywhere else are checked like a file.
        let points_to_expected = std::fs::read_link(path)
            .map(|link| link.ends_with(path_for_hash(&file.hash)))
            .unwrap_or(false);
        if points_to_expected {
            return Ok(None);
        }
        return verify_hash(path, relative_path, file, policy);
    }

    if metadata.is_dir() {
        return Ok(Some(String::from("a directory is in place of the file")));
    }

    if metadata.len() != file.size {
        return Ok(Some(format!(
            "size mismatch (expected {}, found {})",
            file.size,
            metadata.len()
        )));
    }

    verify_hash(path, relative_path, file, policy)
}

fn verify_hash(
    path: &Path,
    relative_path: &Path,
    file: &ManifestFile,
    policy: &ReconcilePolicy,
) -> Result<Option<String>, ReconcileError> {
    if !policy.should_hash(relative_path, file.size) {
        return Ok(None);
    }
    let actual = compute_file_hash(path)
        .map_err(|e| ReconcileError::FailedToInspectFile(path.to_path_buf(), e))?;
    Ok((actual != file.hash).then(|| String::from("hash mismatch")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use genhub_cas::compute_bytes_hash;

    use super::*;
    use crate::{
        manifest::{ContentManifest, ContentType},
        workspace::WorkspaceStrategyKind,
    };

    fn configuration(root: &Path, manifests: Vec<ContentManifest>) -> WorkspaceConfiguration {
        WorkspaceConfiguration::new(
            "ws",
            root.join("base"),
            root.join("workspaces"),
            manifests,
            WorkspaceStrategyKind::FullCopy,
        )
    }

    fn info_for(configuration: &WorkspaceConfiguration) -> WorkspaceInfo {
        WorkspaceInfo {
            id: configuration.id.clone(),
            workspace_path: configuration.workspace_path(),
            strategy: configuration.strategy,
            executable_path: None,
            file_count: 0,
            total_size_bytes: 0,
            manifest_ids: Some(configuration.manifest_ids()),
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            is_prepared: true,
        }
    }

    fn manifest(id: &str, content_type: ContentType, files: &[(&str, &[u8])]) -> ContentManifest {
        files
            .iter()
            .fold(ContentManifest::new(id, content_type), |m, (path, content)| {
                m.with_file(ManifestFile::new(
                    *path,
                    compute_bytes_hash(content),
                    content.len() as u64,
                ))
            })
    }

    fn write(path: &Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_new_workspace_is_all_adds() {
        let dir = tempfile::tempdir().unwrap();
        let config = configuration(
            dir.path(),
            vec![manifest(
                "base",
                ContentType::GameInstallation,
                &[("game.exe", b"exe"), ("Data/a.big", b"big")],
            )],
        );

        let deltas = WorkspaceReconciler::default()
            .analyze(&config, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(deltas.len(), 2);
        assert!(deltas
            .iter()
            .all(|d| d.operation == WorkspaceOperation::Add && d.reason == "new workspace"));

        // A prior record whose directory is gone is treated the same way.
        let deltas = WorkspaceReconciler::default()
            .analyze(&config, Some(&info_for(&config)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(DeltaSummary::from_deltas(&deltas).add, 2);
    }

    #[tokio::test]
    async fn test_classifies_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = configuration(
            dir.path(),
            vec![manifest(
                "base",
                ContentType::GameInstallation,
                &[
                    ("game.exe", b"exe"),
                    ("Data/INI/a.ini", b"ini"),
                    ("Data/b.ini", b"same"),
                    ("missing.txt", b"missing"),
                ],
            )],
        );
        let ws = config.workspace_path();
        write(&ws.join("game.exe"), b"exe");
        write(&ws.join("Data/INI/a.ini"), b"ini-but-longer");
        write(&ws.join("Data/b.ini"), b"SAME");
        write(&ws.join("stale.txt"), b"stale");

        let deltas = WorkspaceReconciler::default()
            .analyze(&config, Some(&info_for(&config)), &CancellationToken::new())
            .await
            .unwrap();

        let op = |path: &str| {
            deltas
                .iter()
                .find(|d| d.relative_path == Path::new(path))
                .map(|d| (d.operation, d.reason.clone()))
                .unwrap()
        };
        assert_eq!(op("game.exe").0, WorkspaceOperation::Skip);
        assert_matches!(op("Data/INI/a.ini"), (WorkspaceOperation::Update, r) if r.starts_with("size mismatch"));
        assert_eq!(
            op("Data/b.ini"),
            (WorkspaceOperation::Update, String::from("hash mismatch"))
        );
        assert_eq!(op("missing.txt").0, WorkspaceOperation::Add);
        assert_eq!(
            op("stale.txt"),
            (
                WorkspaceOperation::Remove,
                String::from("no longer in manifests")
            )
        );
    }

    #[tokio::test]
    async fn test_large_non_essential_files_trust_size() {
        let dir = tempfile::tempdir().unwrap();
        let config = configuration(
            dir.path(),
            vec![manifest(
                "base",
                ContentType::GameInstallation,
                &[("intro.bik", b"video"), ("game.exe", b"binary")],
            )],
        );
        let ws = config.workspace_path();
        write(&ws.join("intro.bik"), b"VIDEO");
        write(&ws.join("game.exe"), b"BINARY");

        let reconciler = WorkspaceReconciler::new(ReconcilePolicy {
            hash_size_ceiling: 1,
            ..ReconcilePolicy::default()
        });
        let deltas = reconciler
            .analyze(&config, Some(&info_for(&config)), &CancellationToken::new())
            .await
            .unwrap();
        let summary = DeltaSummary::from_deltas(&deltas);

        // The video is only checked by size, the executable is always hashed.
        assert_eq!(summary.skip, 1);
        assert_eq!(summary.update, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_broken_symlink_needs_update() {
        let dir = tempfile::tempdir().unwrap();
        let config = configuration(
            dir.path(),
            vec![manifest(
                "base",
                ContentType::GameInstallation,
                &[("game.exe", b"exe")],
            )],
        );
        let ws = config.workspace_path();
        std::fs::create_dir_all(&ws).unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), ws.join("game.exe")).unwrap();

        let deltas = WorkspaceReconciler::default()
            .analyze(&config, Some(&info_for(&config)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(deltas[0].operation, WorkspaceOperation::Update);
        assert_eq!(deltas[0].reason, "broken symbolic link");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_only_links_to_the_expected_object_skip_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let config = configuration(
            dir.path(),
            vec![manifest(
                "base",
                ContentType::GameInstallation,
                &[("game.exe", b"exe"), ("patch.exe", b"new")],
            )],
        );
        let objects = dir.path().join("cas");
        let expected = objects.join(path_for_hash(&compute_bytes_hash(b"exe")));
        let previous = objects.join(path_for_hash(&compute_bytes_hash(b"old")));
        write(&expected, b"exe");
        write(&previous, b"old");
        let ws = config.workspace_path();
        std::fs::create_dir_all(&ws).unwrap();
        std::os::unix::fs::symlink(&expected, ws.join("game.exe")).unwrap();
        std::os::unix::fs::symlink(&previous, ws.join("patch.exe")).unwrap();

        let deltas = WorkspaceReconciler::default()
            .analyze(&config, Some(&info_for(&config)), &CancellationToken::new())
            .await
            .unwrap();
        let op = |path: &str| {
            deltas
                .iter()
                .find(|d| d.relative_path == Path::new(path))
                .map(|d| (d.operation, d.reason.clone()))
                .unwrap()
        };
        assert_eq!(op("game.exe").0, WorkspaceOperation::Skip);
        assert_eq!(
            op("patch.exe"),
            (WorkspaceOperation::Update, String::from("hash mismatch"))
        );
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let config = configuration(
            dir.path(),
            vec![manifest("base", ContentType::GameInstallation, &[("a", b"a")])],
        );
        std::fs::create_dir_all(config.workspace_path()).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = WorkspaceReconciler::default()
            .analyze(&config, Some(&info_for(&config)), &token)
            .await;
        assert_matches!(result, Err(ReconcileError::Cancelled));
    }
}
