//! Configuration of the content materialization core.
//!
//! The configuration is usually read from a TOML file, every field has a
//! sensible default:
//!
//! ```toml
//! app-data-root = "/home/user/.local/share/GenHub"
//! app-name = "GenHub"
//! disk-space-margin = 0.1
//!
//! [reconcile]
//! essential-extensions = ["exe", "dll", "ini"]
//! hash-size-ceiling = 104857600
//! ```

use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Files smaller than this are always re-hashed during reconciliation.
pub const DEFAULT_HASH_SIZE_CEILING: u64 = 100 * 1024 * 1024;

/// Errors that can occur while loading a [`ContentConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error while reading configuration file.
    #[error("IO error while reading configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Error parsing configuration file.
    #[error("Error parsing configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid value for a field.
    #[error("Invalid value for field {0}: {1}")]
    InvalidValue(String, String),
}

/// Decides which files are re-hashed when reconciling a workspace.
///
/// Hashing every file on every launch is expensive for large game archives,
/// so only files that are essential (executables, configuration, known
/// critical formats) or smaller than the ceiling are hashed. Other files are
/// trusted when their size matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReconcilePolicy {
    /// Extensions (without a leading dot, case-insensitive) of files that are
    /// always hashed.
    pub essential_extensions: Vec<String>,

    /// Files smaller than this number of bytes are always hashed.
    pub hash_size_ceiling: u64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            essential_extensions: ["exe", "dll", "ini", "cfg", "json", "xml", "big", "so", "dylib"]
                .into_iter()
                .map(String::from)
                .collect(),
            hash_size_ceiling: DEFAULT_HASH_SIZE_CEILING,
        }
    }
}

impl ReconcilePolicy {
    /// Returns true if the file at `path` is considered essential.
    pub fn is_essential(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.essential_extensions
                    .iter()
                    .any(|essential| essential.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
    }

    /// Returns true if a file whose size already matches should still be
    /// hashed before it is trusted.
    pub fn should_hash(&self, path: &Path, size: u64) -> bool {
        self.is_essential(path) || size < self.hash_size_ceiling
    }
}

/// The top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ContentConfig {
    /// The directory under which all persisted state is stored.
    pub app_data_root: PathBuf,

    /// The name of the application. Destructive operations refuse to run on
    /// directories whose path does not contain this name.
    pub app_name: String,

    /// Policy for re-hashing files during reconciliation.
    pub reconcile: ReconcilePolicy,

    /// The fraction of extra free disk space that must be available on top of
    /// the estimated usage of a workspace.
    pub disk_space_margin: f64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        let app_name = String::from("GenHub");
        Self {
            app_data_root: dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(&app_name),
            app_name,
            reconcile: ReconcilePolicy::default(),
            disk_space_margin: 0.1,
        }
    }
}

impl ContentConfig {
    /// Constructs the default configuration with a different data root.
    pub fn with_app_data_root(app_data_root: impl Into<PathBuf>) -> Self {
        Self {
            app_data_root: app_data_root.into(),
            ..Self::default()
        }
    }

    /// Loads and validates the configuration stored at `path`.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!("loaded configuration from '{}'", path.display());
        Ok(config)
    }

    /// Validates the values of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.app_data_root.is_absolute() {
            return Err(ConfigError::InvalidValue(
                String::from("app-data-root"),
                format!("'{}' is not an absolute path", self.app_data_root.display()),
            ));
        }
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                String::from("app-name"),
                String::from("must not be empty"),
            ));
        }
        if self.disk_space_margin.is_nan() || self.disk_space_margin < 0.0 {
            return Err(ConfigError::InvalidValue(
                String::from("disk-space-margin"),
                format!("{} is not a positive fraction", self.disk_space_margin),
            ));
        }
        Ok(())
    }

    /// The file that stores all known workspaces.
    pub fn workspace_index_path(&self) -> PathBuf {
        self.app_data_root.join("workspaces.json")
    }

    /// The root directory of user data tracking state.
    pub fn user_data_root(&self) -> PathBuf {
        self.app_data_root.join("user_data")
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("GameData.INI", 500 * 1024 * 1024, true)]
    #[case("generals.exe", 500 * 1024 * 1024, true)]
    #[case("Music.big", 500 * 1024 * 1024, true)]
    #[case("intro.bik", 500 * 1024 * 1024, false)]
    #[case("intro.bik", 1024, true)]
    #[case("no_extension", DEFAULT_HASH_SIZE_CEILING, false)]
    fn test_should_hash(#[case] path: &str, #[case] size: u64, #[case] expected: bool) {
        let policy = ReconcilePolicy::default();
        assert_eq!(policy.should_hash(Path::new(path), size), expected);
    }

    #[test]
    fn test_load_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let root = dir.path().join("GenHub");
        fs::write(
            &path,
            format!(
                "app-data-root = {:?}\n\n[reconcile]\nhash-size-ceiling = 10\n",
                root.to_string_lossy()
            ),
        )
        .unwrap();

        let config = ContentConfig::load_from_path(&path).unwrap();
        assert_eq!(config.app_data_root, root);
        assert_eq!(config.app_name, "GenHub");
        assert_eq!(config.reconcile.hash_size_ceiling, 10);
        assert!(!config.reconcile.essential_extensions.is_empty());
        assert_eq!(config.user_data_root(), root.join("user_data"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "app-data-root = \"relative/path\"\n").unwrap();
        assert!(matches!(
            ContentConfig::load_from_path(&path),
            Err(ConfigError::InvalidValue(field, _)) if field == "app-data-root"
        ));

        fs::write(&path, "disk-space-margin = \"lots\"\n").unwrap();
        assert!(matches!(
            ContentConfig::load_from_path(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
