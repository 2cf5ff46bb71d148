//! Module cache assembly.
//!
//! Two merge strategies exist side by side:
//!
//! - [`link::link_recursive`] walks every source cache, maps each relative
//!   file path to one source (the later source wins on collisions), and
//!   rewrites every manifest to one unified version map.
//! - [`flat::link_recursive_flat`] links whole entries and recurses only into
//!   directories present in several sources; any other collision is an error.
//!
//! The walk-based merge silently resolves collisions that the flat merge
//! rejects. Both behaviours are intentional and kept separate.

pub mod copy;
pub mod finder;
pub mod flat;
pub mod link;
pub mod proxy_output;
pub mod versions;
pub mod walker;

use gobuild_schema::ModFileError;
use std::path::PathBuf;

use crate::parexec::{Cancelled, TaskError};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error(transparent)]
    Manifest(#[from] ModFileError),

    #[error("Found both directory & non directory sources for {target}:\n{listing}")]
    Conflict { target: PathBuf, listing: String },

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("invalid version list {0}")]
    VersionList(PathBuf),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl MergeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MergeError::Io {
            path: path.into(),
            source,
        }
    }
}

impl TaskError for MergeError {
    fn is_cancelled(&self) -> bool {
        matches!(self, MergeError::Cancelled(_))
    }
}

/// Writes a manifest, replacing whatever is at `path`.
///
/// Symlinks are removed first so a linked read-only store file is never
/// written through.
pub(crate) async fn write_replacing(path: &std::path::Path, contents: &str) -> Result<(), MergeError> {
    let is_link = tokio::fs::symlink_metadata(path)
        .await
        .is_ok_and(|meta| meta.file_type().is_symlink());
    if is_link {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| MergeError::io(path, e))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| MergeError::io(path, e))
}
