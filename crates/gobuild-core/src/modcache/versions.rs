//! Module version discovery from proxy `@v/list` files.

use gobuild_schema::proxy::{DOWNLOAD_DIR, VERSION_DIR, module_path_from_dir};
use gobuild_schema::{ModuleVersion, VersionMap, VersionSource};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use walkdir::WalkDir;

use super::MergeError;
use crate::parexec::{FailurePolicy, ParallelExecutor};

/// Reads the highest listed version of every module in one cache root.
pub fn versions_in_root(root: &Path) -> Result<Vec<(String, ModuleVersion)>, MergeError> {
    let download_dir = root.join(DOWNLOAD_DIR);
    let mut found = Vec::new();

    let walker = WalkDir::new(&download_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != VERSION_DIR);

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(&download_dir).to_path_buf();
            MergeError::io(path, e.into())
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }

        let list = entry.path().join(VERSION_DIR).join("list");
        if !list.is_file() {
            continue;
        }

        let contents = std::fs::read_to_string(&list).map_err(|e| MergeError::io(&list, e))?;
        let Some(version) = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ModuleVersion::new)
            .max()
        else {
            tracing::debug!("Skipping empty version list {}", list.display());
            continue;
        };

        let relative = entry
            .path()
            .strip_prefix(&download_dir)
            .map_err(|_| MergeError::VersionList(list.clone()))?;
        let module = module_path_from_dir(relative).ok_or_else(|| MergeError::VersionList(list.clone()))?;
        found.push((module, version));
    }

    Ok(found)
}

/// Discovers module versions across every cache root concurrently.
///
/// A module present in several roots gets its highest version.
pub async fn discover_versions(roots: &[PathBuf], workers: usize) -> Result<VersionMap, MergeError> {
    let versions = Arc::new(Mutex::new(VersionMap::new()));
    let exec: ParallelExecutor<MergeError> = ParallelExecutor::new(workers, FailurePolicy::CollectFirst);

    for root in roots {
        let root = root.clone();
        let versions = Arc::clone(&versions);
        exec.spawn(async move {
            let scan_root = root.clone();
            let found = tokio::task::spawn_blocking(move || versions_in_root(&scan_root))
                .await
                .map_err(|e| MergeError::io(&root, std::io::Error::other(e)))??;

            let mut versions = versions.lock().unwrap_or_else(PoisonError::into_inner);
            for (module, version) in found {
                versions.insert(module, version, VersionSource::ProxyLayout);
            }
            Ok(())
        });
    }
    exec.wait().await?;

    let versions = std::mem::take(&mut *versions.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_list(root: &Path, escaped: &str, versions: &str) {
        let dir = root.join(DOWNLOAD_DIR).join(escaped).join(VERSION_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("list"), versions).unwrap();
    }

    #[test]
    fn reads_highest_listed_version() {
        let root = TempDir::new().unwrap();
        write_list(root.path(), "golang.org/x/mod", "v0.16.0\nv0.17.0\nv0.9.0\n");
        write_list(root.path(), "github.com/!burnt!sushi/toml", "v1.3.2\n");
        write_list(root.path(), "empty.com/x", "");

        let found = versions_in_root(root.path()).unwrap();
        assert_eq!(
            found,
            vec![
                ("github.com/BurntSushi/toml".to_string(), ModuleVersion::new("v1.3.2")),
                ("golang.org/x/mod".to_string(), ModuleVersion::new("v0.17.0")),
            ]
        );
    }

    #[test]
    fn nested_modules_are_found() {
        let root = TempDir::new().unwrap();
        write_list(root.path(), "cloud.google.com/go", "v0.110.0\n");
        write_list(root.path(), "cloud.google.com/go/storage", "v1.30.0\n");
        let found = versions_in_root(root.path()).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn merges_roots_by_highest_version() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write_list(a.path(), "x.com/m", "v1.2.0\n");
        write_list(b.path(), "x.com/m", "v1.10.0\n");
        write_list(b.path(), "y.com/n", "v0.1.0\n");

        for roots in [
            vec![a.path().to_path_buf(), b.path().to_path_buf()],
            vec![b.path().to_path_buf(), a.path().to_path_buf()],
        ] {
            let versions = discover_versions(&roots, 2).await.unwrap();
            assert_eq!(versions.get("x.com/m").unwrap(), "v1.10.0");
            assert_eq!(versions.get("y.com/n").unwrap(), "v0.1.0");
        }
    }

    #[tokio::test]
    async fn root_without_download_dir_fails() {
        let root = TempDir::new().unwrap();
        assert!(discover_versions(&[root.path().to_path_buf()], 1).await.is_err());
    }
}
