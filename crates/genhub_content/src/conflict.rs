//! Resolves which manifest provides a file when several manifests contribute
//! the same relative path.
//!
//! Manifests are ranked by [`ContentType::priority`]. When two manifests of
//! equal priority contribute the same path, the one that appears first in the
//! input wins. Callers that need a deterministic result across runs must
//! therefore pass manifests in a stable order.

use std::{cmp::Reverse, path::PathBuf};

use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    manifest::{ContentManifest, ContentType, ManifestFile, ManifestId},
    utils::normalize_relative_path,
};

/// A file contributed by a single manifest.
#[derive(Debug, Clone, Copy)]
pub struct FileContribution<'a> {
    /// The contributed file.
    pub file: &'a ManifestFile,
    /// The content type of the manifest that contributed the file.
    pub content_type: ContentType,
    /// The manifest that contributed the file.
    pub manifest_id: &'a ManifestId,
}

/// The file that won conflict resolution for a relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// The winning file.
    pub file: ManifestFile,
    /// The manifest the file came from.
    pub manifest_id: ManifestId,
    /// The content type of that manifest.
    pub content_type: ContentType,
}

/// Picks the winning contribution for `relative_path`. Returns `None` only if
/// `contributions` is empty.
pub fn resolve_conflict<'a>(
    relative_path: &std::path::Path,
    contributions: &[FileContribution<'a>],
) -> Option<FileContribution<'a>> {
    // `sort_by_key` is stable, so equal priorities keep their input order.
    let ranked = contributions
        .iter()
        .copied()
        .sorted_by_key(|c| Reverse(c.content_type.priority()))
        .collect::<Vec<_>>();

    let (winner, losers) = ranked.split_first()?;
    if !losers.is_empty() {
        tracing::debug!(
            "conflict for '{}': {} ({:?}) wins over {}",
            relative_path.display(),
            winner.manifest_id,
            winner.content_type,
            losers
                .iter()
                .map(|c| format!("{} ({:?})", c.manifest_id, c.content_type))
                .join(", ")
        );
        let tied = losers
            .iter()
            .filter(|c| c.content_type.priority() == winner.content_type.priority())
            .count();
        if tied > 0 {
            tracing::warn!(
                "'{}' is provided by {} manifests with equal priority, using the first: {}",
                relative_path.display(),
                tied + 1,
                winner.manifest_id
            );
        }
    }
    Some(*winner)
}

/// Groups all files of `manifests` that match `include` by their normalized
/// relative path and resolves conflicts between them.
///
/// The returned map preserves the order in which paths were first seen.
pub fn resolve_expected_files<'a>(
    manifests: impl IntoIterator<Item = &'a ContentManifest>,
    include: impl Fn(&ManifestFile) -> bool,
) -> IndexMap<PathBuf, ResolvedFile> {
    let mut grouped: IndexMap<PathBuf, Vec<FileContribution<'a>>> = IndexMap::new();
    for manifest in manifests {
        for file in manifest.files.iter().filter(|f| include(f)) {
            grouped
                .entry(normalize_relative_path(&file.relative_path))
                .or_default()
                .push(FileContribution {
                    file,
                    content_type: manifest.content_type,
                    manifest_id: &manifest.id,
                });
        }
    }

    grouped
        .into_iter()
        .filter_map(|(path, contributions)| {
            let winner = resolve_conflict(&path, &contributions)?;
            Some((
                path,
                ResolvedFile {
                    file: winner.file.clone(),
                    manifest_id: winner.manifest_id.clone(),
                    content_type: winner.content_type,
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use genhub_cas::compute_bytes_hash;
    use rstest::rstest;

    use super::*;
    use crate::manifest::{InstallTarget, ManifestFile};

    fn manifest(id: &str, content_type: ContentType, content: &[u8]) -> ContentManifest {
        ContentManifest::new(id, content_type).with_file(ManifestFile::new(
            "foo.txt",
            compute_bytes_hash(content),
            content.len() as u64,
        ))
    }

    #[rstest]
    #[case::base_first(false)]
    #[case::mod_first(true)]
    fn test_mod_wins_over_game_installation(#[case] reversed: bool) {
        let a = manifest("a", ContentType::GameInstallation, b"base");
        let b = manifest("b", ContentType::Mod, b"modded");
        let manifests = if reversed { vec![&b, &a] } else { vec![&a, &b] };

        let resolved = resolve_expected_files(manifests, |_| true);
        let winner = &resolved[Path::new("foo.txt")];
        assert_eq!(winner.manifest_id.as_str(), "b");
        assert_eq!(winner.file.hash, compute_bytes_hash(b"modded"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_equal_priority_first_seen_wins() {
        let a = manifest("patch-a", ContentType::Patch, b"a");
        let b = manifest("patch-b", ContentType::Patch, b"b");

        let resolved = resolve_expected_files([&a, &b], |_| true);
        assert_eq!(resolved[Path::new("foo.txt")].manifest_id.as_str(), "patch-a");
        assert!(logs_contain("provided by 2 manifests with equal priority"));

        let resolved = resolve_expected_files([&b, &a], |_| true);
        assert_eq!(resolved[Path::new("foo.txt")].manifest_id.as_str(), "patch-b");
    }

    #[test]
    fn test_priority_order_across_all_types() {
        let manifests = [
            manifest("base", ContentType::GameInstallation, b"1"),
            manifest("addon", ContentType::Addon, b"2"),
            manifest("client", ContentType::GameClient, b"3"),
            manifest("patch", ContentType::Patch, b"4"),
        ];
        let resolved = resolve_expected_files(&manifests, |_| true);
        assert_eq!(resolved[Path::new("foo.txt")].manifest_id.as_str(), "patch");
    }

    #[test]
    fn test_separators_are_normalized_and_filter_applies() {
        let hash = compute_bytes_hash(b"x");
        let a = ContentManifest::new("a", ContentType::GameInstallation)
            .with_file(ManifestFile::new("Data\\INI\\a.ini", hash, 1))
            .with_file(
                ManifestFile::new("Maps/m.map", hash, 1)
                    .with_install_target(InstallTarget::UserMapsDirectory),
            );
        let b = ContentManifest::new("b", ContentType::Mod)
            .with_file(ManifestFile::new("Data/INI/a.ini", hash, 1));

        let resolved = resolve_expected_files([&a, &b], |f| {
            f.install_target == InstallTarget::Workspace
        });
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[Path::new("Data/INI/a.ini")].manifest_id.as_str(), "b");
    }

    #[test]
    fn test_empty_contributions() {
        assert!(resolve_conflict(Path::new("x"), &[]).is_none());
    }
}
