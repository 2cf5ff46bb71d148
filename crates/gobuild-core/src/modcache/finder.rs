//! Locating module manifests inside a proxy download directory.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::MergeError;
use gobuild_schema::proxy::VERSION_DIR;

/// Finds every `@v/*.mod` file below `download_dir`, in sorted order.
///
/// Symlinked directories are not descended into.
pub fn find_proxy_mods(download_dir: &Path) -> Result<Vec<PathBuf>, MergeError> {
    let mut mods = Vec::new();
    for entry in WalkDir::new(download_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(download_dir).to_path_buf();
            MergeError::io(path, e.into())
        })?;

        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let in_version_dir = path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|name| name == VERSION_DIR);
        if in_version_dir && path.extension().is_some_and(|ext| ext == "mod") {
            mods.push(path.to_path_buf());
        }
    }
    Ok(mods)
}
