//! Walk-based cache merge.
//!
//! Source files keep their identity through symlinks, except where the Go
//! toolchain cannot use one: non-Go files may be embedded with `go:embed`,
//! which refuses symlinks, so those are copied. Manifests are parsed, pinned
//! to the unified version map, and written out fresh.

use gobuild_schema::proxy::{DOWNLOAD_DIR, coordinate_from_cache_path};
use gobuild_schema::{ModFile, VersionMap, VersionSource};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::walker::walk_sources;
use super::{MergeError, write_replacing};
use crate::concurrent::ConcurrentMap;
use crate::parexec::{FailurePolicy, ParallelExecutor};

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    /// `cache/download/<module>/@v/<version>.mod`; the name carries the version.
    ProxyManifest(String),
    /// A `go.mod` anywhere else. No version can be inferred from its location.
    Manifest,
    /// Checksum files are never usable in a merged cache.
    Skip,
    Source,
    Resource,
}

fn classify(relative: &Path) -> EntryKind {
    if relative.starts_with(DOWNLOAD_DIR) && relative.extension().is_some_and(|e| e == "mod") {
        return match coordinate_from_cache_path(relative) {
            Some(coordinate) => EntryKind::ProxyManifest(coordinate.version.to_string()),
            None => EntryKind::Resource,
        };
    }
    match relative.file_name().and_then(|n| n.to_str()) {
        Some("go.mod") => EntryKind::Manifest,
        Some("go.sum") => EntryKind::Skip,
        Some(name) if name.ends_with(".go") => EntryKind::Source,
        _ => EntryKind::Resource,
    }
}

/// Merges `sources` into `target` and returns the unified version map.
///
/// Proxy manifests contribute their file-name version; when several versions
/// of one module are present the highest is used. Every manifest written to
/// `target` requires exactly the unified versions for the modules the map
/// knows about.
pub async fn link_recursive(
    target: &Path,
    sources: &[PathBuf],
    workers: usize,
) -> Result<VersionMap, MergeError> {
    let files = walk_sources(sources, workers).await?;

    let entries: Vec<(PathBuf, PathBuf, EntryKind)> = files
        .into_iter()
        .map(|(relative, source)| {
            let kind = classify(&relative);
            (relative, source, kind)
        })
        .filter(|(_, _, kind)| *kind != EntryKind::Skip)
        .collect();

    create_dirs(target, entries.iter().map(|(relative, _, _)| relative.as_path()), workers).await?;

    let manifests: Arc<ConcurrentMap<PathBuf, ModFile>> = Arc::new(ConcurrentMap::new());
    let versions = Arc::new(Mutex::new(VersionMap::new()));
    {
        let exec: ParallelExecutor<MergeError> =
            ParallelExecutor::new(workers, FailurePolicy::CollectFirst);
        for (relative, source, kind) in entries {
            let destination = target.join(&relative);
            let manifests = Arc::clone(&manifests);
            let versions = Arc::clone(&versions);
            exec.spawn(async move {
                match kind {
                    EntryKind::ProxyManifest(version) => {
                        let manifest = read_manifest(&source).await?;
                        let module = manifest.module_path().map(str::to_string).or_else(|| {
                            coordinate_from_cache_path(&relative).map(|c| c.path)
                        });
                        if let Some(module) = module {
                            versions
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(module, version, VersionSource::ProxyLayout);
                        }
                        manifests.insert(relative, manifest);
                    }
                    EntryKind::Manifest => {
                        manifests.insert(relative, read_manifest(&source).await?);
                    }
                    EntryKind::Source => {
                        tokio::fs::symlink(&source, &destination)
                            .await
                            .map_err(|e| MergeError::io(&destination, e))?;
                    }
                    EntryKind::Resource => copy_file(&source, &destination).await?,
                    EntryKind::Skip => {}
                }
                Ok(())
            });
        }
        exec.wait().await?;
    }

    let versions = std::mem::take(&mut *versions.lock().unwrap_or_else(PoisonError::into_inner));
    tracing::debug!("Unified {} module versions", versions.len());

    let exec: ParallelExecutor<MergeError> =
        ParallelExecutor::new(workers, FailurePolicy::CollectFirst);
    for (relative, mut manifest) in manifests.snapshot() {
        manifest.set_require_versions(&versions);
        let destination = target.join(relative);
        exec.spawn(async move { write_replacing(&destination, &manifest.format()).await });
    }
    exec.wait().await?;

    Ok(versions)
}

/// Creates the parent directory of every entry, shallowest first.
pub(crate) async fn create_dirs<'a>(
    target: &Path,
    relative_files: impl Iterator<Item = &'a Path>,
    workers: usize,
) -> Result<(), MergeError> {
    let dirs: BTreeSet<PathBuf> = relative_files
        .filter_map(Path::parent)
        .map(|parent| target.join(parent))
        .chain(std::iter::once(target.to_path_buf()))
        .collect();

    let exec: ParallelExecutor<MergeError> =
        ParallelExecutor::new(workers, FailurePolicy::CollectFirst);
    for dir in dirs {
        exec.spawn(async move {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| MergeError::io(&dir, e))
        });
    }
    exec.wait().await
}

pub(crate) async fn read_manifest(path: &Path) -> Result<ModFile, MergeError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MergeError::io(path, e))?;
    Ok(ModFile::parse(&path.display().to_string(), &contents)?)
}

/// Copies file contents into a new, writable file.
pub(crate) async fn copy_file(source: &Path, destination: &Path) -> Result<(), MergeError> {
    let mut reader = tokio::fs::File::open(source)
        .await
        .map_err(|e| MergeError::io(source, e))?;
    let mut writer = tokio::fs::File::create(destination)
        .await
        .map_err(|e| MergeError::io(destination, e))?;
    tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(|e| MergeError::io(destination, e))?;
    Ok(())
}
