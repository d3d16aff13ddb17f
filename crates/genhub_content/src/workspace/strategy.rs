//! Strategies that execute a delta plan to bring a workspace on disk in line
//! with its configuration.
//!
//! All built-in strategies share the same executor and only differ in the
//! ordered [`LinkMethod`]s that are attempted to place a single file.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{WorkspaceConfiguration, WorkspaceError, WorkspaceInfo, WorkspaceStrategyKind};
use crate::{
    config::ReconcilePolicy,
    link::{FileMaterializer, LinkFileError, LinkMethod, Materialized},
    manifest::{ManifestFile, SourceType},
    reconcile::{WorkspaceDelta, WorkspaceOperation, WorkspaceReconciler},
    reporter::{PreparationPhase, ProgressTracker, Reporter},
    utils::{mark_executable, normalize_relative_path, prune_empty_parents, remove_file_if_exists},
};

/// The number of bytes a link is assumed to take up on disk.
const LINK_ENTRY_SIZE: u64 = 4096;

const COPY: &[LinkMethod] = &[LinkMethod::Copy];
const SOFTLINK_OR_COPY: &[LinkMethod] = &[LinkMethod::Softlink, LinkMethod::Copy];
const HARDLINK_OR_COPY: &[LinkMethod] = &[LinkMethod::Hardlink, LinkMethod::Copy];

/// Counters of a single preparation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparationStats {
    /// Files that were newly materialized.
    pub added: usize,
    /// Files that were replaced.
    pub updated: usize,
    /// Files that were removed.
    pub removed: usize,
    /// Files that were already up to date.
    pub skipped: usize,
    /// Files that could not be materialized.
    pub failed: usize,
    /// Materialized files that share their storage with the source.
    pub linked: usize,
    /// Materialized files that are independent copies.
    pub copied: usize,
    /// The number of bytes of all materialized files.
    pub bytes_materialized: u64,
    /// True if an existing workspace was reused without executing a plan.
    pub reused: bool,
    /// A message for every file that could not be materialized.
    pub failures: Vec<String>,
    /// How long the preparation took.
    pub elapsed: Duration,
}

impl PreparationStats {
    fn record(&mut self, operation: WorkspaceOperation, materialized: Materialized, size: u64) {
        match operation {
            WorkspaceOperation::Update => self.updated += 1,
            _ => self.added += 1,
        }
        if materialized.is_deduplicated() {
            self.linked += 1;
        } else {
            self.copied += 1;
        }
        self.bytes_materialized += size;
    }
}

/// The result of preparing a workspace.
#[derive(Debug, Clone)]
pub struct PreparedWorkspace {
    /// The persisted snapshot of the workspace.
    pub info: WorkspaceInfo,
    /// What was done to get there.
    pub stats: PreparationStats,
}

/// A way of placing files into a workspace.
///
/// The capabilities are queried by the validator before anything is written,
/// so a strategy never has to check its own prerequisites.
#[async_trait::async_trait]
pub trait WorkspaceStrategy: Send + Sync {
    /// A human readable name of the strategy.
    fn name(&self) -> &'static str;

    /// The kind of workspace this strategy produces.
    fn kind(&self) -> WorkspaceStrategyKind;

    /// Returns true if this strategy can prepare `configuration`.
    fn can_handle(&self, configuration: &WorkspaceConfiguration) -> bool {
        configuration.strategy == self.kind()
    }

    /// Whether creating the workspace requires elevated privileges.
    fn requires_admin_rights(&self) -> bool;

    /// Whether the content sources and the workspace must be on the same
    /// volume.
    fn requires_same_volume(&self) -> bool;

    /// The number of bytes the workspace will take up in addition to the
    /// content sources.
    fn estimate_disk_usage(&self, configuration: &WorkspaceConfiguration) -> u64;

    /// Executes `plan` for `configuration`. `existing` is the snapshot of the
    /// workspace the plan was computed against.
    async fn prepare(
        &self,
        configuration: &WorkspaceConfiguration,
        plan: &[WorkspaceDelta],
        existing: Option<&WorkspaceInfo>,
        reporter: Option<&dyn Reporter>,
        cancellation_token: &CancellationToken,
    ) -> Result<PreparedWorkspace, WorkspaceError>;
}

fn expected_sizes(configuration: &WorkspaceConfiguration) -> impl Iterator<Item = (PathBuf, u64)> {
    WorkspaceReconciler::expected_files(configuration)
        .into_iter()
        .map(|(path, resolved)| (path, resolved.file.size))
}

/// Executes delta plans. Shared by all built-in strategies.
#[derive(Debug, Clone)]
pub(crate) struct DeltaExecutor {
    materializer: FileMaterializer,
}

impl DeltaExecutor {
    pub(crate) fn new(materializer: FileMaterializer) -> Self {
        Self { materializer }
    }

    /// Returns where the content of `file` can be read from, or `None` if it
    /// is not available anywhere.
    async fn source_for(
        &self,
        configuration: &WorkspaceConfiguration,
        file: &ManifestFile,
    ) -> Result<Option<PathBuf>, WorkspaceError> {
        if file.source_type == SourceType::Filesystem {
            let source = configuration
                .base_installation_path
                .join(file.filesystem_source());
            if tokio::fs::try_exists(&source).await.unwrap_or(false) {
                return Ok(Some(source));
            }
            tracing::debug!(
                "'{}' does not exist, looking up {} in the content store",
                source.display(),
                file.hash
            );
        }

        match self.materializer.resolve_content(&file.hash).await {
            Ok(path) => Ok(Some(path)),
            Err(LinkFileError::ContentNotFound(_)) => Ok(None),
            Err(e) => Err(WorkspaceError::from_link_error(&file.relative_path, e)),
        }
    }

    async fn execute(
        &self,
        configuration: &WorkspaceConfiguration,
        plan: &[WorkspaceDelta],
        existing: Option<&WorkspaceInfo>,
        reporter: Option<&dyn Reporter>,
        cancellation_token: &CancellationToken,
        attempts_for: impl Fn(&Path) -> &'static [LinkMethod] + Send + Sync,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        let started = Instant::now();
        let workspace_path = configuration.workspace_path();
        let mut stats = PreparationStats::default();
        let mut failed_bytes = 0u64;

        tokio::fs::create_dir_all(&workspace_path)
            .await
            .map_err(|e| {
                WorkspaceError::IoError(
                    format!("failed to create '{}'", workspace_path.display()),
                    e,
                )
            })?;

        let total_bytes = plan
            .iter()
            .filter_map(|delta| delta.file.as_ref())
            .map(|file| file.size)
            .sum();
        let mut progress = ProgressTracker::new(
            reporter,
            PreparationPhase::Removing,
            plan.len(),
            total_bytes,
        );

        // Remove stale files first so that they never block a new file.
        for delta in plan
            .iter()
            .filter(|d| d.operation == WorkspaceOperation::Remove)
        {
            if cancellation_token.is_cancelled() {
                return Err(WorkspaceError::Cancelled);
            }
            remove_stale_entry(&delta.workspace_path).await?;
            if let Some(parent) = delta.workspace_path.parent() {
                prune_empty_parents(parent, &workspace_path);
            }
            tracing::debug!("removed '{}': {}", delta.relative_path.display(), delta.reason);
            stats.removed += 1;
            progress.advance(delta.relative_path.clone(), 0);
        }

        progress.set_phase(PreparationPhase::Materializing);
        for delta in plan
            .iter()
            .filter(|d| d.operation != WorkspaceOperation::Remove)
        {
            if cancellation_token.is_cancelled() {
                return Err(WorkspaceError::Cancelled);
            }
            let Some(file) = delta.file.as_ref() else {
                continue;
            };

            if delta.operation == WorkspaceOperation::Skip {
                stats.skipped += 1;
                progress.advance(delta.relative_path.clone(), file.size);
                continue;
            }

            let Some(source) = self.source_for(configuration, file).await? else {
                tracing::warn!(
                    "skipping '{}': content {} is not available",
                    delta.relative_path.display(),
                    file.hash
                );
                stats.failed += 1;
                failed_bytes += file.size;
                stats.failures.push(format!(
                    "{}: content {} is not available",
                    delta.relative_path.display(),
                    file.hash
                ));
                progress.advance(delta.relative_path.clone(), file.size);
                continue;
            };

            if delta.operation == WorkspaceOperation::Update {
                remove_directory_in_place(&delta.workspace_path).await?;
            }

            let materialized = self
                .materializer
                .materialize_from_path(
                    &source,
                    &delta.workspace_path,
                    attempts_for(&delta.relative_path),
                )
                .await
                .map_err(|e| WorkspaceError::from_link_error(&delta.relative_path, e))?;

            let is_declared_executable = configuration
                .executable
                .as_deref()
                .is_some_and(|executable| normalize_relative_path(executable) == delta.relative_path);
            if file.is_executable || is_declared_executable {
                if let Err(err) = mark_executable(&delta.workspace_path) {
                    tracing::warn!(
                        "failed to mark '{}' as executable: {err}",
                        delta.relative_path.display()
                    );
                }
            }

            tracing::debug!(
                "{} '{}' ({}) using {}",
                delta.operation,
                delta.relative_path.display(),
                delta.reason,
                materialized.method()
            );
            stats.record(delta.operation, materialized, file.size);
            progress.advance(delta.relative_path.clone(), file.size);
        }

        let (file_count, total_size_bytes) = plan
            .iter()
            .filter(|d| d.operation != WorkspaceOperation::Remove)
            .filter_map(|d| d.file.as_ref())
            .fold((0usize, 0u64), |(count, size), file| (count + 1, size + file.size));

        let now = Utc::now();
        let info = WorkspaceInfo {
            id: configuration.id.clone(),
            workspace_path,
            strategy: configuration.strategy,
            executable_path: configuration
                .executable
                .as_ref()
                .map(|executable| configuration.workspace_path().join(executable)),
            file_count: file_count - stats.failed,
            total_size_bytes: total_size_bytes - failed_bytes,
            manifest_ids: Some(configuration.manifest_ids()),
            created_at: existing.map_or(now, |info| info.created_at),
            last_accessed_at: now,
            is_prepared: stats.failed == 0,
        };

        stats.elapsed = started.elapsed();
        tracing::info!(
            "prepared workspace '{}' in {:?}: {} added, {} updated, {} removed, {} skipped, {} failed",
            info.id,
            stats.elapsed,
            stats.added,
            stats.updated,
            stats.removed,
            stats.skipped,
            stats.failed
        );
        Ok(PreparedWorkspace { info, stats })
    }
}

/// Removes a file or symlink that is no longer part of the workspace. A stale
/// directory is removed recursively.
async fn remove_stale_entry(path: &Path) -> Result<(), WorkspaceError> {
    let path = path.to_path_buf();
    simple_spawn_blocking::tokio::run_blocking_task(move || {
        let result = match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => fs_err::remove_dir_all(&path),
            _ => remove_file_if_exists(&path).map(|_| ()),
        };
        result.map_err(|e| {
            WorkspaceError::IoError(format!("failed to remove '{}'", path.display()), e)
        })
    })
    .await
}

/// Removes a directory that occupies the location of a file.
async fn remove_directory_in_place(path: &Path) -> Result<(), WorkspaceError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => fs_err::tokio::remove_dir_all(path)
            .await
            .map_err(|e| WorkspaceError::IoError(String::from("failed to replace a directory"), e)),
        _ => Ok(()),
    }
}

/// Every file is a symbolic link into the content store, falling back to a
/// copy where links cannot be created.
#[derive(Debug, Clone)]
pub struct SymlinkOnlyStrategy {
    executor: DeltaExecutor,
}

impl SymlinkOnlyStrategy {
    /// Constructs the strategy.
    pub fn new(materializer: FileMaterializer) -> Self {
        Self {
            executor: DeltaExecutor::new(materializer),
        }
    }
}

#[async_trait::async_trait]
impl WorkspaceStrategy for SymlinkOnlyStrategy {
    fn name(&self) -> &'static str {
        "Symlink only"
    }

    fn kind(&self) -> WorkspaceStrategyKind {
        WorkspaceStrategyKind::SymlinkOnly
    }

    fn requires_admin_rights(&self) -> bool {
        cfg!(windows)
    }

    fn requires_same_volume(&self) -> bool {
        false
    }

    fn estimate_disk_usage(&self, configuration: &WorkspaceConfiguration) -> u64 {
        expected_sizes(configuration).count() as u64 * LINK_ENTRY_SIZE
    }

    async fn prepare(
        &self,
        configuration: &WorkspaceConfiguration,
        plan: &[WorkspaceDelta],
        existing: Option<&WorkspaceInfo>,
        reporter: Option<&dyn Reporter>,
        cancellation_token: &CancellationToken,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        self.executor
            .execute(configuration, plan, existing, reporter, cancellation_token, |_| {
                SOFTLINK_OR_COPY
            })
            .await
    }
}

/// Every file is a hard link to its source. Sources on another volume are
/// copied instead.
#[derive(Debug, Clone)]
pub struct HardLinkStrategy {
    executor: DeltaExecutor,
}

impl HardLinkStrategy {
    /// Constructs the strategy.
    pub fn new(materializer: FileMaterializer) -> Self {
        Self {
            executor: DeltaExecutor::new(materializer),
        }
    }
}

#[async_trait::async_trait]
impl WorkspaceStrategy for HardLinkStrategy {
    fn name(&self) -> &'static str {
        "Hard link"
    }

    fn kind(&self) -> WorkspaceStrategyKind {
        WorkspaceStrategyKind::HardLink
    }

    fn requires_admin_rights(&self) -> bool {
        false
    }

    fn requires_same_volume(&self) -> bool {
        true
    }

    fn estimate_disk_usage(&self, configuration: &WorkspaceConfiguration) -> u64 {
        expected_sizes(configuration).count() as u64 * LINK_ENTRY_SIZE
    }

    async fn prepare(
        &self,
        configuration: &WorkspaceConfiguration,
        plan: &[WorkspaceDelta],
        existing: Option<&WorkspaceInfo>,
        reporter: Option<&dyn Reporter>,
        cancellation_token: &CancellationToken,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        self.executor
            .execute(configuration, plan, existing, reporter, cancellation_token, |_| {
                HARDLINK_OR_COPY
            })
            .await
    }
}

/// Every file is an independent copy.
#[derive(Debug, Clone)]
pub struct FullCopyStrategy {
    executor: DeltaExecutor,
}

impl FullCopyStrategy {
    /// Constructs the strategy.
    pub fn new(materializer: FileMaterializer) -> Self {
        Self {
            executor: DeltaExecutor::new(materializer),
        }
    }
}

#[async_trait::async_trait]
impl WorkspaceStrategy for FullCopyStrategy {
    fn name(&self) -> &'static str {
        "Full copy"
    }

    fn kind(&self) -> WorkspaceStrategyKind {
        WorkspaceStrategyKind::FullCopy
    }

    fn requires_admin_rights(&self) -> bool {
        false
    }

    fn requires_same_volume(&self) -> bool {
        false
    }

    fn estimate_disk_usage(&self, configuration: &WorkspaceConfiguration) -> u64 {
        expected_sizes(configuration).map(|(_, size)| size).sum()
    }

    async fn prepare(
        &self,
        configuration: &WorkspaceConfiguration,
        plan: &[WorkspaceDelta],
        existing: Option<&WorkspaceInfo>,
        reporter: Option<&dyn Reporter>,
        cancellation_token: &CancellationToken,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        self.executor
            .execute(configuration, plan, existing, reporter, cancellation_token, |_| COPY)
            .await
    }
}

/// Essential files (executables, configuration) are copied so the game can
/// modify or lock them, all other files are symbolic links.
#[derive(Debug, Clone)]
pub struct HybridCopySymlinkStrategy {
    executor: DeltaExecutor,
    policy: ReconcilePolicy,
}

impl HybridCopySymlinkStrategy {
    /// Constructs the strategy. `policy` decides which files are essential.
    pub fn new(materializer: FileMaterializer, policy: ReconcilePolicy) -> Self {
        Self {
            executor: DeltaExecutor::new(materializer),
            policy,
        }
    }
}

#[async_trait::async_trait]
impl WorkspaceStrategy for HybridCopySymlinkStrategy {
    fn name(&self) -> &'static str {
        "Hybrid copy/symlink"
    }

    fn kind(&self) -> WorkspaceStrategyKind {
        WorkspaceStrategyKind::HybridCopySymlink
    }

    fn requires_admin_rights(&self) -> bool {
        cfg!(windows)
    }

    fn requires_same_volume(&self) -> bool {
        false
    }

    fn estimate_disk_usage(&self, configuration: &WorkspaceConfiguration) -> u64 {
        expected_sizes(configuration)
            .map(|(path, size)| {
                if self.policy.is_essential(&path) {
                    size
                } else {
                    LINK_ENTRY_SIZE
                }
            })
            .sum()
    }

    async fn prepare(
        &self,
        configuration: &WorkspaceConfiguration,
        plan: &[WorkspaceDelta],
        existing: Option<&WorkspaceInfo>,
        reporter: Option<&dyn Reporter>,
        cancellation_token: &CancellationToken,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        let policy = &self.policy;
        self.executor
            .execute(configuration, plan, existing, reporter, cancellation_token, |path| {
                if policy.is_essential(path) {
                    COPY
                } else {
                    SOFTLINK_OR_COPY
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use genhub_cas::{compute_bytes_hash, LocalContentStore};
    use rstest::rstest;

    use super::*;
    use crate::manifest::{ContentManifest, ContentType};

    async fn setup(
        files: &[(&str, &[u8])],
    ) -> (tempfile::TempDir, FileMaterializer, WorkspaceConfiguration) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(dir.path().join("cas"));
        let mut manifest = ContentManifest::new("base", ContentType::GameInstallation);
        for (path, content) in files {
            let hash = store.store_bytes(content.to_vec()).await.unwrap();
            manifest = manifest.with_file(ManifestFile::new(*path, hash, content.len() as u64));
        }
        let configuration = WorkspaceConfiguration::new(
            "ws",
            dir.path().join("base"),
            dir.path().join("workspaces"),
            vec![manifest],
            WorkspaceStrategyKind::FullCopy,
        );
        (dir, FileMaterializer::new(Arc::new(store)), configuration)
    }

    async fn plan_for(configuration: &WorkspaceConfiguration) -> Vec<WorkspaceDelta> {
        WorkspaceReconciler::default()
            .analyze(configuration, None, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[cfg(unix)]
    #[rstest]
    #[case(WorkspaceStrategyKind::FullCopy, false)]
    #[case(WorkspaceStrategyKind::HybridCopySymlink, true)]
    #[case(WorkspaceStrategyKind::SymlinkOnly, true)]
    #[tokio::test]
    async fn test_strategies_place_files(
        #[case] kind: WorkspaceStrategyKind,
        #[case] big_file_is_link: bool,
    ) {
        let (_dir, materializer, mut configuration) =
            setup(&[("game.exe", b"binary"), ("Data/music.big2", b"music")]).await;
        configuration.strategy = kind;
        let strategy: Box<dyn WorkspaceStrategy> = match kind {
            WorkspaceStrategyKind::FullCopy => Box::new(FullCopyStrategy::new(materializer)),
            WorkspaceStrategyKind::SymlinkOnly => Box::new(SymlinkOnlyStrategy::new(materializer)),
            _ => Box::new(HybridCopySymlinkStrategy::new(
                materializer,
                ReconcilePolicy::default(),
            )),
        };
        assert!(strategy.can_handle(&configuration));

        let plan = plan_for(&configuration).await;
        let prepared = strategy
            .prepare(&configuration, &plan, None, None, &CancellationToken::new())
            .await
            .unwrap();

        let ws = configuration.workspace_path();
        assert_eq!(prepared.info.file_count, 2);
        assert_eq!(prepared.stats.added, 2);
        assert_eq!(std::fs::read(ws.join("Data/music.big2")).unwrap(), b"music");
        let is_link = |p: &Path| std::fs::symlink_metadata(p).unwrap().file_type().is_symlink();
        assert_eq!(is_link(&ws.join("Data/music.big2")), big_file_is_link);
        assert_eq!(
            is_link(&ws.join("game.exe")),
            kind == WorkspaceStrategyKind::SymlinkOnly
        );
    }

    #[tokio::test]
    async fn test_missing_content_is_skipped() {
        let (dir, materializer, mut configuration) = setup(&[("game.exe", b"binary")]).await;
        configuration.manifests[0].files.push(ManifestFile::new(
            "missing.dat",
            compute_bytes_hash(b"not stored"),
            10,
        ));
        configuration.manifests[0].files.push(
            ManifestFile::new("local.ini", compute_bytes_hash(b"local"), 5)
                .with_filesystem_source("Data/local.ini"),
        );
        std::fs::create_dir_all(dir.path().join("base/Data")).unwrap();
        std::fs::write(dir.path().join("base/Data/local.ini"), b"local").unwrap();

        let plan = plan_for(&configuration).await;
        let prepared = FullCopyStrategy::new(materializer)
            .prepare(&configuration, &plan, None, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(prepared.stats.added, 2);
        assert_eq!(prepared.stats.failed, 1);
        assert_eq!(prepared.stats.failures.len(), 1);
        assert_eq!(prepared.info.file_count, 2);
        assert!(!prepared.info.is_prepared);
        assert_eq!(
            std::fs::read(configuration.workspace_path().join("local.ini")).unwrap(),
            b"local"
        );
    }

    #[test]
    fn test_disk_usage_estimates() {
        let hash = compute_bytes_hash(b"");
        let configuration = WorkspaceConfiguration::new(
            "ws",
            "/base",
            "/workspaces",
            vec![ContentManifest::new("base", ContentType::GameInstallation)
                .with_file(ManifestFile::new("game.exe", hash, 1_000_000))
                .with_file(ManifestFile::new("movie.bik", hash, 5_000_000))],
            WorkspaceStrategyKind::FullCopy,
        );
        let store: Arc<dyn genhub_cas::ContentStore> =
            Arc::new(LocalContentStore::new("/nonexistent"));
        let materializer = FileMaterializer::new(store);

        assert_eq!(
            FullCopyStrategy::new(materializer.clone()).estimate_disk_usage(&configuration),
            6_000_000
        );
        assert_eq!(
            HybridCopySymlinkStrategy::new(materializer.clone(), ReconcilePolicy::default())
                .estimate_disk_usage(&configuration),
            1_000_000 + LINK_ENTRY_SIZE
        );
        assert_eq!(
            HardLinkStrategy::new(materializer).estimate_disk_usage(&configuration),
            2 * LINK_ENTRY_SIZE
        );
    }

    #[tokio::test]
    async fn test_cancellation_between_files() {
        let (_dir, materializer, configuration) =
            setup(&[("a.txt", b"a"), ("b.txt", b"b")]).await;
        let plan = plan_for(&configuration).await;
        let token = CancellationToken::new();
        token.cancel();

        let result = FullCopyStrategy::new(materializer)
            .prepare(&configuration, &plan, None, None, &token)
            .await;
        assert!(matches!(result, Err(WorkspaceError::Cancelled)));
    }
}
