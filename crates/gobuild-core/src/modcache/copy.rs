//! Writable copies of source trees with manifests pinned to a version map.

use glob::Pattern;
use gobuild_schema::VersionMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use super::link::read_manifest;
use super::{MergeError, write_replacing};
use crate::parexec::{FailurePolicy, ParallelExecutor};

/// Checksum files are meaningless once manifests are rewritten.
const SKIPPED_FILES: &[&str] = &["go.sum", "go.work.sum"];

/// Copies `src` into `dst`.
///
/// Files whose base name matches `manifest_glob` are parsed, pinned to
/// `versions` and written out formatted. Other regular files are copied and
/// made writable. Symlinks and checksum files are skipped.
pub async fn copy_dir(
    src: &Path,
    dst: &Path,
    manifest_glob: &str,
    versions: &VersionMap,
    workers: usize,
) -> Result<(), MergeError> {
    let pattern = Pattern::new(manifest_glob).map_err(|source| MergeError::Pattern {
        pattern: manifest_glob.to_string(),
        source,
    })?;

    let meta = tokio::fs::metadata(src)
        .await
        .map_err(|e| MergeError::io(src, e))?;
    if !meta.is_dir() {
        return Err(MergeError::NotADirectory(src.to_path_buf()));
    }

    let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            MergeError::io(path, e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| MergeError::NotADirectory(entry.path().to_path_buf()))?;
        let destination = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            tokio::fs::create_dir_all(&destination)
                .await
                .map_err(|e| MergeError::io(&destination, e))?;
        } else if file_type.is_file() {
            let skipped = entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIPPED_FILES.contains(&name));
            if !skipped {
                files.push((entry.into_path(), destination));
            }
        }
    }

    let pattern = Arc::new(pattern);
    let versions = Arc::new(versions.clone());
    let exec: ParallelExecutor<MergeError> =
        ParallelExecutor::new(workers, FailurePolicy::CollectFirst);
    for (source, destination) in files {
        let pattern = Arc::clone(&pattern);
        let versions = Arc::clone(&versions);
        exec.spawn(async move {
            let is_manifest = source
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern.matches(name));
            if is_manifest {
                let mut manifest = read_manifest(&source).await?;
                manifest.set_require_versions(&versions);
                write_replacing(&destination, &manifest.format()).await
            } else {
                copy_writable(&source, &destination).await
            }
        });
    }
    exec.wait().await
}

async fn copy_writable(source: &Path, destination: &Path) -> Result<(), MergeError> {
    tokio::fs::copy(source, destination)
        .await
        .map_err(|e| MergeError::io(destination, e))?;
    let mut permissions = tokio::fs::metadata(destination)
        .await
        .map_err(|e| MergeError::io(destination, e))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o666);
    tokio::fs::set_permissions(destination, permissions)
        .await
        .map_err(|e| MergeError::io(destination, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gobuild_schema::VersionSource;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn versions() -> VersionMap {
        let mut versions = VersionMap::new();
        versions.insert("b.com/y", "v1.4.0", VersionSource::ProxyLayout);
        versions
    }

    #[tokio::test]
    async fn rewrites_matching_manifests() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        touch(src.path(), "go.mod", "module a.com/x\n\nrequire b.com/y v1.0.0\n");
        touch(src.path(), "go.sum", "b.com/y v1.0.0 h1:x=\n");
        touch(src.path(), "cmd/main.go", "package main\n");

        copy_dir(src.path(), &dst.path().join("src"), "go.mod", &versions(), 2)
            .await
            .unwrap();

        let out = dst.path().join("src");
        let manifest = std::fs::read_to_string(out.join("go.mod")).unwrap();
        assert!(manifest.contains("require b.com/y v1.4.0"));
        assert!(!out.join("go.sum").exists());
        assert_eq!(
            std::fs::read_to_string(out.join("cmd/main.go")).unwrap(),
            "package main\n"
        );
    }

    #[tokio::test]
    async fn glob_selects_proxy_manifests() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let proxy_mod = "cache/download/a.com/x/@v/v1.0.0.mod";
        touch(src.path(), proxy_mod, "module a.com/x\n\nrequire b.com/y v1.0.0\n");
        touch(src.path(), "cache/download/a.com/x/@v/list", "v1.0.0\n");

        copy_dir(src.path(), dst.path(), "*.mod", &versions(), 2).await.unwrap();

        let manifest = std::fs::read_to_string(dst.path().join(proxy_mod)).unwrap();
        assert!(manifest.contains("b.com/y v1.4.0"));
        assert_eq!(
            std::fs::read_to_string(dst.path().join("cache/download/a.com/x/@v/list")).unwrap(),
            "v1.0.0\n"
        );
    }

    #[tokio::test]
    async fn copies_are_writable_and_symlinks_skipped() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        touch(src.path(), "data.txt", "data");
        let data = src.path().join("data.txt");
        std::fs::set_permissions(&data, std::fs::Permissions::from_mode(0o444)).unwrap();
        std::os::unix::fs::symlink(&data, src.path().join("link.txt")).unwrap();

        copy_dir(src.path(), dst.path(), "go.mod", &VersionMap::new(), 2)
            .await
            .unwrap();

        let mode = std::fs::metadata(dst.path().join("data.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o666, 0o666);
        assert!(std::fs::symlink_metadata(dst.path().join("link.txt")).is_err());
    }

    #[tokio::test]
    async fn invalid_glob_is_rejected() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let err = copy_dir(src.path(), dst.path(), "[", &VersionMap::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Pattern { .. }));
    }
}
