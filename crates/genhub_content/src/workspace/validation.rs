//! Checks that run before and after a workspace is prepared.
//!
//! Validation never fails with an error for a problem it finds. Instead every
//! problem becomes a [`ValidationIssue`] and the caller decides what to do
//! based on its [`ValidationSeverity`].

use std::{
    fmt,
    path::{Path, PathBuf},
};

use simple_spawn_blocking::tokio::run_blocking_task;

use super::{strategy::WorkspaceStrategy, WorkspaceConfiguration, WorkspaceError, WorkspaceInfo};
use crate::reconcile::enumerate_files;

/// How severe a [`ValidationIssue`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationSeverity {
    /// Informational, nothing needs to be done.
    Info,
    /// The operation proceeds but may be slower or use more space.
    Warning,
    /// The operation cannot proceed.
    Error,
}

/// The kind of problem a [`ValidationIssue`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationIssueKind {
    /// A required value is missing or malformed.
    InvalidConfiguration,
    /// A path does not exist.
    MissingPath,
    /// A directory cannot be written to.
    NotWritable,
    /// The strategy needs privileges the process does not have.
    InsufficientPrivileges,
    /// Two paths that should share a volume do not.
    DifferentVolumes,
    /// There is less free space than the workspace will likely need.
    InsufficientDiskSpace,
    /// The declared executable is missing or cannot be executed.
    InvalidExecutable,
    /// The number of files does not match the snapshot.
    FileCountMismatch,
    /// A symbolic link points to a file that does not exist.
    BrokenSymlink,
}

/// A single problem found by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// What kind of problem this is.
    pub kind: ValidationIssueKind,
    /// How severe the problem is.
    pub severity: ValidationSeverity,
    /// A human readable description.
    pub message: String,
    /// The path the problem relates to, if any.
    pub path: Option<PathBuf>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} ({})", self.message, path.display()),
            None => write!(f, "{}", self.message),
        }
    }
}

/// All issues found by a validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// The issues in the order they were found.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn push(
        &mut self,
        kind: ValidationIssueKind,
        severity: ValidationSeverity,
        message: impl Into<String>,
        path: Option<&Path>,
    ) {
        self.issues.push(ValidationIssue {
            kind,
            severity,
            message: message.into(),
            path: path.map(Path::to_path_buf),
        });
    }

    /// Returns true if no issue has [`ValidationSeverity::Error`].
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    /// Returns all issues with [`ValidationSeverity::Error`].
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> + '_ {
        self.issues
            .iter()
            .filter(|issue| issue.severity == ValidationSeverity::Error)
    }

    /// Returns all issues with [`ValidationSeverity::Warning`].
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> + '_ {
        self.issues
            .iter()
            .filter(|issue| issue.severity == ValidationSeverity::Warning)
    }

    /// Returns true if an issue of `kind` was found.
    pub fn contains(&self, kind: ValidationIssueKind) -> bool {
        self.issues.iter().any(|issue| issue.kind == kind)
    }

    /// Logs every warning of the report.
    pub(crate) fn log_warnings(&self, context: &str) {
        for warning in self.warnings() {
            tracing::warn!("{context}: {warning}");
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors = self.errors().peekable();
        if errors.peek().is_none() {
            return write!(f, "no errors");
        }
        for (idx, issue) in errors.enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// Validates workspace configurations, strategy prerequisites and prepared
/// workspaces.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceValidator {
    disk_space_margin: f64,
    content_root: Option<PathBuf>,
}

impl WorkspaceValidator {
    /// Constructs a validator that requires `disk_space_margin` (a fraction)
    /// of free space on top of the estimated usage.
    pub fn new(disk_space_margin: f64) -> Self {
        Self {
            disk_space_margin,
            content_root: None,
        }
    }

    /// Also requires the content store at `content_root` to be on the same
    /// volume as the workspace for strategies that need it.
    #[must_use]
    pub fn with_content_root(self, content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: Some(content_root.into()),
            ..self
        }
    }

    /// Checks the required fields and paths of `configuration`. Nothing is
    /// written except for a short-lived probe file.
    pub async fn validate_configuration(
        &self,
        configuration: &WorkspaceConfiguration,
    ) -> Result<ValidationReport, WorkspaceError> {
        let configuration = configuration.clone();
        run_blocking_task(move || Ok(validate_configuration_sync(&configuration))).await
    }

    /// Checks whether `strategy` can prepare `configuration` on this machine.
    pub async fn validate_prerequisites(
        &self,
        strategy: &dyn WorkspaceStrategy,
        configuration: &WorkspaceConfiguration,
    ) -> Result<ValidationReport, WorkspaceError> {
        let requires_admin_rights = strategy.requires_admin_rights();
        let requires_same_volume = strategy.requires_same_volume();
        let required_bytes =
            (strategy.estimate_disk_usage(configuration) as f64 * (1.0 + self.disk_space_margin)) as u64;
        let name = strategy.name();
        let workspace_root = configuration.workspace_root.clone();
        let mut sources = vec![configuration.base_installation_path.clone()];
        sources.extend(self.content_root.clone());

        run_blocking_task(move || {
            let mut report = ValidationReport::default();
            let Some(existing_root) = nearest_existing_ancestor(&workspace_root) else {
                report.push(
                    ValidationIssueKind::MissingPath,
                    ValidationSeverity::Error,
                    "no ancestor of the workspace root exists",
                    Some(&workspace_root),
                );
                return Ok(report);
            };

            if requires_admin_rights && !can_create_symlinks(&existing_root) {
                report.push(
                    ValidationIssueKind::InsufficientPrivileges,
                    ValidationSeverity::Error,
                    format!(
                        "the {name} strategy requires administrator rights or developer mode to \
                         create symbolic links"
                    ),
                    None,
                );
            }

            if requires_same_volume {
                for source in sources.iter().filter(|source| source.exists()) {
                    if !same_volume(&existing_root, source) {
                        report.push(
                            ValidationIssueKind::DifferentVolumes,
                            ValidationSeverity::Warning,
                            format!(
                                "the {name} strategy works best when the workspace root is on the \
                                 same volume as its sources, files will be copied instead"
                            ),
                            Some(source),
                        );
                    }
                }
            }

            match fs4::available_space(&existing_root) {
                Ok(available) if available < required_bytes => report.push(
                    ValidationIssueKind::InsufficientDiskSpace,
                    ValidationSeverity::Warning,
                    format!(
                        "{required_bytes} bytes are required (including a safety margin) but only \
                         {available} bytes are available"
                    ),
                    Some(&existing_root),
                ),
                Ok(_) => {}
                Err(err) => tracing::debug!(
                    "failed to determine the available space of '{}': {err}",
                    existing_root.display()
                ),
            }

            Ok(report)
        })
        .await
    }

    /// Checks a prepared workspace.
    pub async fn validate_workspace(
        &self,
        info: &WorkspaceInfo,
    ) -> Result<ValidationReport, WorkspaceError> {
        let info = info.clone();
        run_blocking_task(move || validate_workspace_sync(&info)).await
    }
}

fn validate_configuration_sync(configuration: &WorkspaceConfiguration) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !is_valid_workspace_id(&configuration.id) {
        report.push(
            ValidationIssueKind::InvalidConfiguration,
            ValidationSeverity::Error,
            format!("'{}' is not a valid workspace id", configuration.id),
            None,
        );
    }

    if configuration.manifests.is_empty() {
        report.push(
            ValidationIssueKind::InvalidConfiguration,
            ValidationSeverity::Error,
            "at least one manifest is required",
            None,
        );
    }

    if configuration.workspace_root.as_os_str().is_empty() {
        report.push(
            ValidationIssueKind::InvalidConfiguration,
            ValidationSeverity::Error,
            "the workspace root is not set",
            None,
        );
        return report;
    }

    if !configuration.base_installation_path.is_dir() {
        report.push(
            ValidationIssueKind::MissingPath,
            ValidationSeverity::Error,
            "the base installation directory does not exist",
            Some(&configuration.base_installation_path),
        );
    }

    match nearest_existing_ancestor(&configuration.workspace_root) {
        Some(existing) if is_writable_dir(&existing) => {}
        Some(existing) => report.push(
            ValidationIssueKind::NotWritable,
            ValidationSeverity::Error,
            "the workspace root is not writable",
            Some(&existing),
        ),
        None => report.push(
            ValidationIssueKind::MissingPath,
            ValidationSeverity::Error,
            "no ancestor of the workspace root exists",
            Some(&configuration.workspace_root),
        ),
    }

    report
}

fn validate_workspace_sync(info: &WorkspaceInfo) -> Result<ValidationReport, WorkspaceError> {
    let mut report = ValidationReport::default();
    let workspace_path = info.path();

    if !workspace_path.is_dir() {
        report.push(
            ValidationIssueKind::MissingPath,
            ValidationSeverity::Error,
            "the workspace directory does not exist",
            Some(workspace_path),
        );
        return Ok(report);
    }

    if let Some(executable) = &info.executable_path {
        if !executable.is_file() {
            report.push(
                ValidationIssueKind::InvalidExecutable,
                ValidationSeverity::Error,
                "the executable does not exist",
                Some(executable),
            );
        } else if !is_executable(executable) {
            report.push(
                ValidationIssueKind::InvalidExecutable,
                ValidationSeverity::Error,
                "the executable is not executable",
                Some(executable),
            );
        }
    }

    let files = enumerate_files(workspace_path)?;
    if files.len() != info.file_count {
        report.push(
            ValidationIssueKind::FileCountMismatch,
            ValidationSeverity::Warning,
            format!(
                "expected {} files but found {}",
                info.file_count,
                files.len()
            ),
            Some(workspace_path),
        );
    }

    for relative_path in &files {
        let path = workspace_path.join(relative_path);
        let is_symlink = std::fs::symlink_metadata(&path)
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink && std::fs::metadata(&path).is_err() {
            report.push(
                ValidationIssueKind::BrokenSymlink,
                ValidationSeverity::Error,
                "symbolic link points to a missing file",
                Some(&path),
            );
        }
    }

    if !is_writable_dir(workspace_path) {
        report.push(
            ValidationIssueKind::NotWritable,
            ValidationSeverity::Warning,
            "the workspace directory is not writable",
            Some(workspace_path),
        );
    }

    Ok(report)
}

/// A workspace id doubles as a directory name.
fn is_valid_workspace_id(id: &str) -> bool {
    !id.trim().is_empty()
        && id != "."
        && id != ".."
        && !id
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control())
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|ancestor| !ancestor.as_os_str().is_empty() && ancestor.is_dir())
        .map(Path::to_path_buf)
}

#[cfg(unix)]
fn is_writable_dir(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let Ok(path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: `path` is a valid nul-terminated string that outlives the call.
    unsafe { libc::access(path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn is_writable_dir(path: &Path) -> bool {
    tempfile::Builder::new()
        .prefix(".genhub-probe-")
        .tempfile_in(path)
        .is_ok()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|metadata| metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Tries to create a symbolic link in a temporary directory under `dir`.
fn can_create_symlinks(dir: &Path) -> bool {
    let Ok(probe) = tempfile::Builder::new()
        .prefix(".genhub-symlink-probe-")
        .tempdir_in(dir)
    else {
        return false;
    };
    let target = probe.path().join("target");
    let link = probe.path().join("link");
    if std::fs::write(&target, b"").is_err() {
        return false;
    }
    #[cfg(unix)]
    let result = std::os::unix::fs::symlink(&target, &link);
    #[cfg(windows)]
    let result = std::os::windows::fs::symlink_file(&target, &link);
    #[cfg(not(any(unix, windows)))]
    let result: std::io::Result<()> = Err(std::io::ErrorKind::Unsupported.into());
    result.is_ok()
}

#[cfg(unix)]
fn same_volume(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => true,
    }
}

#[cfg(not(unix))]
fn same_volume(a: &Path, b: &Path) -> bool {
    use std::path::Component;
    let prefix = |path: &Path| {
        std::path::absolute(path)
            .ok()
            .and_then(|path| match path.components().next() {
                Some(Component::Prefix(prefix)) => {
                    Some(prefix.as_os_str().to_string_lossy().to_lowercase())
                }
                _ => None,
            })
    };
    prefix(a) == prefix(b)
}
