//! Workspaces are ephemeral directories assembled from one or more manifests
//! that a game is launched from.
//!
//! The [`WorkspaceManager`] is the entry point. It reuses a workspace when the
//! persisted snapshot still describes it, and otherwise validates the request,
//! computes a delta plan with the [`WorkspaceReconciler`] and lets a
//! [`WorkspaceStrategy`] execute it. Finished workspaces are recorded in the
//! [`WorkspaceIndex`] and registered with the content store's
//! [`ReferenceTracker`].

mod index;
mod info;
mod strategy;
mod validation;

use std::{
    collections::BTreeSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use chrono::Utc;
use genhub_cas::{CasError, ContentHash, ContentStore, ReferenceTracker};
use simple_spawn_blocking::Cancelled;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub use index::WorkspaceIndex;
pub use info::{WorkspaceConfiguration, WorkspaceInfo, WorkspaceStrategyKind};
pub use strategy::{
    FullCopyStrategy, HardLinkStrategy, HybridCopySymlinkStrategy, PreparationStats,
    PreparedWorkspace, SymlinkOnlyStrategy, WorkspaceStrategy,
};
pub use validation::{
    ValidationIssue, ValidationIssueKind, ValidationReport, ValidationSeverity, WorkspaceValidator,
};

use crate::{
    config::ContentConfig,
    link::{FileMaterializer, LinkFileError},
    manifest::{ManifestId, SourceType},
    reconcile::{
        DeltaSummary, ReconcileError, WorkspaceDelta, WorkspaceOperation, WorkspaceReconciler,
    },
    reporter::{report_phase, PreparationPhase, Reporter},
};

/// Errors that can occur while managing workspaces.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The configuration has errors.
    #[error("invalid workspace configuration: {0}")]
    InvalidConfiguration(ValidationReport),

    /// The strategy cannot run on this machine.
    #[error("prerequisites of the workspace strategy are not met: {0}")]
    PrerequisitesNotMet(ValidationReport),

    /// The prepared workspace failed validation.
    #[error("the prepared workspace is invalid: {0}")]
    ValidationFailed(ValidationReport),

    /// No registered strategy can handle the configuration.
    #[error("no strategy is available for {0} workspaces")]
    NoStrategy(WorkspaceStrategyKind),

    /// The workspace is not known.
    #[error("workspace '{0}' does not exist")]
    NotFound(String),

    /// Reconciliation failed.
    #[error(transparent)]
    ReconcileError(ReconcileError),

    /// A file could not be materialized.
    #[error("failed to materialize '{0}'")]
    LinkError(PathBuf, #[source] LinkFileError),

    /// The content store failed.
    #[error(transparent)]
    ContentStoreError(#[from] CasError),

    /// The workspace index could not be read or written.
    #[error("failed to access the workspace index at '{0}'")]
    IndexError(PathBuf, #[source] std::io::Error),

    /// The workspace directory could not be deleted, usually because another
    /// process holds files open.
    #[error("failed to delete '{0}', close applications using this directory and try again")]
    DirectoryLocked(PathBuf, #[source] std::io::Error),

    /// A generic IO error.
    #[error("{0}")]
    IoError(String, #[source] std::io::Error),

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl WorkspaceError {
    pub(crate) fn from_link_error(path: &Path, err: LinkFileError) -> Self {
        match err {
            LinkFileError::Cancelled => WorkspaceError::Cancelled,
            err => WorkspaceError::LinkError(path.to_path_buf(), err),
        }
    }
}

impl From<Cancelled> for WorkspaceError {
    fn from(_: Cancelled) -> Self {
        WorkspaceError::Cancelled
    }
}

impl From<ReconcileError> for WorkspaceError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Cancelled => WorkspaceError::Cancelled,
            err => WorkspaceError::ReconcileError(err),
        }
    }
}

/// The outcome of [`WorkspaceManager::analyze_cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupAnalysis {
    /// The files that would be removed.
    pub removals: Vec<WorkspaceDelta>,
    /// The combined size of all removed files in bytes. A symbolic link
    /// counts with the size of its target, even though removing the link
    /// leaves the target in the content store.
    pub total_bytes: u64,
    /// Manifests of the current workspace that are not part of the new
    /// configuration.
    pub affected_manifest_ids: BTreeSet<ManifestId>,
}

/// Prepares, reuses and removes workspaces.
///
/// Preparation of a single workspace id is not serialized internally, callers
/// must not prepare the same workspace concurrently.
pub struct WorkspaceManager {
    index: WorkspaceIndex,
    reconciler: WorkspaceReconciler,
    validator: WorkspaceValidator,
    strategies: Vec<Arc<dyn WorkspaceStrategy>>,
    references: Arc<dyn ReferenceTracker>,
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("index", &self.index)
            .field("reconciler", &self.reconciler)
            .field("validator", &self.validator)
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl WorkspaceManager {
    /// Constructs a manager with the four built-in strategies.
    pub fn new(
        config: &ContentConfig,
        store: Arc<dyn ContentStore>,
        references: Arc<dyn ReferenceTracker>,
    ) -> Self {
        let materializer = FileMaterializer::new(store);
        let strategies: Vec<Arc<dyn WorkspaceStrategy>> = vec![
            Arc::new(HybridCopySymlinkStrategy::new(
                materializer.clone(),
                config.reconcile.clone(),
            )),
            Arc::new(SymlinkOnlyStrategy::new(materializer.clone())),
            Arc::new(HardLinkStrategy::new(materializer.clone())),
            Arc::new(FullCopyStrategy::new(materializer)),
        ];
        Self {
            index: WorkspaceIndex::new(config.workspace_index_path()),
            reconciler: WorkspaceReconciler::new(config.reconcile.clone()),
            validator: WorkspaceValidator::new(config.disk_space_margin),
            strategies,
            references,
        }
    }

    /// Registers an additional strategy. It takes precedence over the
    /// built-in ones.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn WorkspaceStrategy>) -> Self {
        self.strategies.insert(0, strategy);
        self
    }

    /// Checks that the content store at `content_root` is on the same volume
    /// as the workspaces for strategies that require it.
    #[must_use]
    pub fn with_content_root(mut self, content_root: impl Into<PathBuf>) -> Self {
        self.validator = self.validator.with_content_root(content_root);
        self
    }

    /// Returns the index of persisted workspaces.
    pub fn index(&self) -> &WorkspaceIndex {
        &self.index
    }

    fn strategy_for(
        &self,
        configuration: &WorkspaceConfiguration,
    ) -> Result<&Arc<dyn WorkspaceStrategy>, WorkspaceError> {
        self.strategies
            .iter()
            .find(|strategy| strategy.can_handle(configuration))
            .ok_or(WorkspaceError::NoStrategy(configuration.strategy))
    }

    /// Makes sure the workspace described by `configuration` exists on disk
    /// and is up to date.
    #[instrument(skip_all, fields(workspace = %configuration.id, strategy = %configuration.strategy))]
    pub async fn prepare_workspace(
        &self,
        configuration: &WorkspaceConfiguration,
        reporter: Option<&dyn Reporter>,
        cancellation_token: &CancellationToken,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        let started = Instant::now();
        let mut force_recreate = configuration.force_recreate;
        let mut cached = None;

        if !force_recreate {
            if let Some(info) = self.index.get(&configuration.id).await? {
                if info.strategy != configuration.strategy {
                    tracing::info!(
                        "workspace '{}' was created with the {} strategy, recreating it",
                        info.id,
                        info.strategy
                    );
                    force_recreate = true;
                } else {
                    cached = Some(info);
                }
            }
        }

        // Fast path: trust the snapshot without reading the directory tree.
        let mut plan = None;
        if let Some(info) = cached.as_ref() {
            if tokio::fs::try_exists(info.path()).await.unwrap_or(false) {
                let expected_count = WorkspaceReconciler::expected_files(configuration).len();
                if info.matches(configuration)
                    && info.file_count == expected_count
                    && passes_basic_integrity(info).await
                {
                    tracing::info!("reusing workspace '{}'", info.id);
                    return self.reuse(info.clone(), configuration, started).await;
                }

                report_phase(reporter, PreparationPhase::Reconciling, 0.0);
                let deltas = self
                    .reconciler
                    .analyze(configuration, Some(info), cancellation_token)
                    .await?;
                if !DeltaSummary::from_deltas(&deltas).has_changes() {
                    tracing::info!("workspace '{}' is up to date, reusing it", info.id);
                    let info = WorkspaceInfo {
                        file_count: expected_count,
                        manifest_ids: Some(configuration.manifest_ids()),
                        ..info.clone()
                    };
                    return self.reuse(info, configuration, started).await;
                }
                plan = Some(deltas);
            }
        }

        report_phase(reporter, PreparationPhase::Validating, 0.0);
        let report = self.validator.validate_configuration(configuration).await?;
        if !report.is_valid() {
            return Err(WorkspaceError::InvalidConfiguration(report));
        }
        report.log_warnings("workspace configuration");

        let strategy = self.strategy_for(configuration)?;
        let report = self
            .validator
            .validate_prerequisites(strategy.as_ref(), configuration)
            .await?;
        if !report.is_valid() {
            return Err(WorkspaceError::PrerequisitesNotMet(report));
        }
        report.log_warnings(strategy.name());

        if force_recreate {
            remove_workspace_directory(&configuration.workspace_path()).await?;
            cached = None;
            plan = None;
        }

        let plan = match plan {
            Some(plan) => plan,
            None => {
                report_phase(reporter, PreparationPhase::Reconciling, 0.0);
                self.reconciler
                    .analyze(configuration, cached.as_ref(), cancellation_token)
                    .await?
            }
        };

        tracing::info!(
            "preparing workspace '{}' using the {} strategy",
            configuration.id,
            strategy.name()
        );
        let mut prepared = strategy
            .prepare(
                configuration,
                &plan,
                cached.as_ref(),
                reporter,
                cancellation_token,
            )
            .await?;

        report_phase(reporter, PreparationPhase::Finalizing, 100.0);
        if configuration.validate_after_preparation {
            let report = self.validator.validate_workspace(&prepared.info).await?;
            if !report.is_valid() {
                return Err(WorkspaceError::ValidationFailed(report));
            }
            report.log_warnings("prepared workspace");
        }

        self.index.upsert(prepared.info.clone()).await?;
        self.track_references(configuration).await;

        prepared.stats.elapsed = started.elapsed();
        report_phase(reporter, PreparationPhase::Completed, 100.0);
        Ok(prepared)
    }

    async fn reuse(
        &self,
        info: WorkspaceInfo,
        configuration: &WorkspaceConfiguration,
        started: Instant,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        let info = WorkspaceInfo {
            last_accessed_at: Utc::now(),
            is_prepared: true,
            ..info
        };
        self.index.upsert(info.clone()).await?;
        self.track_references(configuration).await;
        Ok(PreparedWorkspace {
            stats: PreparationStats {
                skipped: info.file_count,
                reused: true,
                elapsed: started.elapsed(),
                ..PreparationStats::default()
            },
            info,
        })
    }

    async fn track_references(&self, configuration: &WorkspaceConfiguration) {
        let hashes: Vec<ContentHash> = WorkspaceReconciler::expected_files(configuration)
            .into_values()
            .filter(|resolved| resolved.file.source_type != SourceType::Filesystem)
            .map(|resolved| resolved.file.hash)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if let Err(err) = self
            .references
            .track_workspace_references(&configuration.id, &hashes)
            .await
        {
            tracing::warn!(
                "failed to track content references of workspace '{}': {err}",
                configuration.id
            );
        }
    }

    /// Returns all known workspaces.
    pub async fn get_all_workspaces(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        self.index.load_all().await
    }

    /// Returns the workspace with the given id.
    pub async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        self.index.get(id).await
    }

    /// Removes a workspace from disk and from the index. Returns false if the
    /// workspace was not known.
    ///
    /// Content references are released before anything is deleted, so a
    /// failed deletion never leaves references that nothing releases.
    #[instrument(skip(self))]
    pub async fn cleanup_workspace(&self, id: &str) -> Result<bool, WorkspaceError> {
        let Some(info) = self.index.get(id).await? else {
            return Ok(false);
        };

        self.references.untrack_workspace(id).await?;
        remove_workspace_directory(info.path()).await?;
        self.index.remove(id).await?;
        tracing::info!("removed workspace '{id}'");
        Ok(true)
    }

    /// Computes which files would be removed if the workspace `current_id`
    /// was prepared for `new_configuration` instead. Nothing is modified.
    pub async fn analyze_cleanup(
        &self,
        current_id: &str,
        new_configuration: &WorkspaceConfiguration,
        cancellation_token: &CancellationToken,
    ) -> Result<CleanupAnalysis, WorkspaceError> {
        let current = self
            .index
            .get(current_id)
            .await?
            .ok_or_else(|| WorkspaceError::NotFound(current_id.to_string()))?;

        let removals: Vec<WorkspaceDelta> = self
            .reconciler
            .analyze(new_configuration, Some(&current), cancellation_token)
            .await?
            .into_iter()
            .filter(|delta| delta.operation == WorkspaceOperation::Remove)
            .collect();

        // Links are counted with the size of what they point at.
        let mut total_bytes = 0;
        for delta in &removals {
            let metadata = match tokio::fs::metadata(&delta.workspace_path).await {
                Ok(metadata) => Ok(metadata),
                Err(_) => tokio::fs::symlink_metadata(&delta.workspace_path).await,
            };
            if let Ok(metadata) = metadata {
                total_bytes += metadata.len();
            }
        }

        let new_ids = new_configuration.manifest_ids();
        let affected_manifest_ids = current
            .manifest_ids
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !new_ids.contains(id))
            .collect();

        Ok(CleanupAnalysis {
            removals,
            total_bytes,
            affected_manifest_ids,
        })
    }
}

/// Checks that a cached workspace still looks usable without reading every
/// file.
async fn passes_basic_integrity(info: &WorkspaceInfo) -> bool {
    let non_empty = match tokio::fs::read_dir(info.path()).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    };
    let executable_present = match &info.executable_path {
        Some(executable) => tokio::fs::try_exists(executable).await.unwrap_or(false),
        None => true,
    };
    non_empty && executable_present
}

async fn remove_workspace_directory(path: &Path) -> Result<(), WorkspaceError> {
    match fs_err::tokio::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(WorkspaceError::DirectoryLocked(path.to_path_buf(), err)),
    }
}
