#![deny(missing_docs)]

//! Content Addressable Store (CAS) for deduplicating game content across
//! workspaces and user data directories.
//!
//! # Architecture
//!
//! The CAS stores files in a directory structure based on their SHA-256 hash:
//! ```text
//! <cas_root>/
//!   objects/
//!     <first 2 hex chars>/
//!       <next 2 hex chars>/
//!         <remaining hex chars>
//!   refs/
//!     workspaces/
//!       <workspace id>.json
//! ```
//!
//! Consumers only depend on the [`ContentStore`] and [`ReferenceTracker`]
//! traits. [`LocalContentStore`] implements both on top of a local directory.
//!
//! # Deduplication
//!
//! When the same content is stored multiple times, the CAS keeps a single
//! copy. The hash is computed while the content is written to a temporary
//! file, and if a file with the same hash already exists the temporary file is
//! discarded.

mod hash;
mod store;

use std::path::{Path, PathBuf};

pub use hash::{
    compute_bytes_hash, compute_file_hash, ContentHash, HashingWriter, ParseContentHashError,
};
use simple_spawn_blocking::Cancelled;
pub use store::LocalContentStore;

/// Errors that can occur when interacting with a content store.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// The requested content is not present in the store.
    #[error("content {0} is not present in the store")]
    NotFound(ContentHash),

    /// The content that was stored did not hash to the expected value.
    #[error("hash mismatch for '{path}': expected {expected}, found {actual}")]
    HashMismatch {
        /// The file that was being stored.
        path: PathBuf,
        /// The hash the caller expected.
        expected: ContentHash,
        /// The hash of the actual content.
        actual: ContentHash,
    },

    /// A generic IO error occurred.
    #[error("{0}")]
    IoError(String, #[source] std::io::Error),

    /// Reference bookkeeping could not be (de)serialized.
    #[error("failed to read workspace references '{0}'")]
    InvalidReferences(PathBuf, #[source] serde_json::Error),

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<Cancelled> for CasError {
    fn from(_: Cancelled) -> Self {
        CasError::Cancelled
    }
}

/// The content side of a CAS: store files and resolve hashes to on-disk
/// locations.
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    /// Stores the file at `path` in the CAS and returns its hash. If
    /// `expected_hash` is given and the content hashes to something else the
    /// content is not stored and [`CasError::HashMismatch`] is returned.
    async fn store_content(
        &self,
        path: &Path,
        expected_hash: Option<ContentHash>,
    ) -> Result<ContentHash, CasError>;

    /// Returns the path of the stored content, or `None` if the hash is
    /// unknown or its backing file is missing.
    async fn content_path(&self, hash: &ContentHash) -> Result<Option<PathBuf>, CasError>;

    /// Opens the stored content for reading.
    async fn open_content(&self, hash: &ContentHash) -> Result<fs_err::tokio::File, CasError> {
        let path = self
            .content_path(hash)
            .await?
            .ok_or(CasError::NotFound(*hash))?;
        fs_err::tokio::File::open(&path)
            .await
            .map_err(|e| CasError::IoError(format!("failed to open content {hash}"), e))
    }
}

/// Reference bookkeeping so garbage collection of the store knows which
/// content is still in use by a workspace.
#[async_trait::async_trait]
pub trait ReferenceTracker: Send + Sync {
    /// Records that `workspace_id` uses all of `hashes`. Replaces any set that
    /// was previously recorded for the workspace.
    async fn track_workspace_references(
        &self,
        workspace_id: &str,
        hashes: &[ContentHash],
    ) -> Result<(), CasError>;

    /// Forgets every reference held by `workspace_id`.
    async fn untrack_workspace(&self, workspace_id: &str) -> Result<(), CasError>;
}

/// Returns the relative path in the CAS for a given hash. Note that the path
/// might not exist.
pub fn path_for_hash(hash: &ContentHash) -> PathBuf {
    let hash_str = hash.to_hex();
    PathBuf::from(format!(
        "{}/{}/{}",
        &hash_str[0..2],
        &hash_str[2..4],
        &hash_str[4..]
    ))
}
