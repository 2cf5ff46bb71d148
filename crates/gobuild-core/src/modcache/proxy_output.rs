//! Module-proxy output assembly.
//!
//! Builds `<out>/cache/download` from the proxy trees of the inputs. Archives
//! and metadata are symlinked; `.mod` files are rewritten so every module in
//! the output requires the highest version of each dependency found across
//! the inputs and the dependency proxies.

use gobuild_schema::proxy::{DOWNLOAD_DIR, VERSION_DIR};
use gobuild_schema::{ModFile, VersionMap, VersionSource};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use walkdir::WalkDir;

use super::finder::find_proxy_mods;
use super::link::read_manifest;
use super::{MergeError, write_replacing};
use crate::concurrent::ConcurrentMap;
use crate::parexec::{FailurePolicy, ParallelExecutor};

/// A `.mod` file to be parsed, and where its rewrite goes if it is an output.
struct ManifestJob {
    source: PathBuf,
    destination: Option<PathBuf>,
    version: Option<String>,
}

/// Assembles a proxy tree under `out` from `sources`.
///
/// `dependency_proxies` are only read, to learn module versions. Returns the
/// version map every output manifest was pinned to.
pub async fn assemble_proxy_output(
    out: &Path,
    sources: &[PathBuf],
    dependency_proxies: &[PathBuf],
    workers: usize,
) -> Result<VersionMap, MergeError> {
    let output_dir = out.join(DOWNLOAD_DIR);
    let input_dirs: Vec<PathBuf> = sources.iter().map(|s| s.join(DOWNLOAD_DIR)).collect();
    let dependency_proxies = dependency_proxies.to_vec();

    let jobs = tokio::task::spawn_blocking(move || -> Result<Vec<ManifestJob>, MergeError> {
        let mut jobs = link_proxy_tree(&output_dir, &input_dirs)?;
        for proxy in &dependency_proxies {
            for source in find_proxy_mods(proxy)? {
                let version = version_from_name(&source);
                jobs.push(ManifestJob {
                    source,
                    destination: None,
                    version,
                });
            }
        }
        Ok(jobs)
    })
    .await
    .map_err(|e| MergeError::io(out, std::io::Error::other(e)))??;

    let outputs: Arc<ConcurrentMap<PathBuf, ModFile>> = Arc::new(ConcurrentMap::new());
    let versions = Arc::new(Mutex::new(VersionMap::new()));
    {
        let exec: ParallelExecutor<MergeError> =
            ParallelExecutor::new(workers, FailurePolicy::CollectFirst);
        for job in jobs {
            let outputs = Arc::clone(&outputs);
            let versions = Arc::clone(&versions);
            exec.spawn(async move {
                let manifest = read_manifest(&job.source).await?;
                if let (Some(module), Some(version)) = (manifest.module_path(), job.version) {
                    versions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(module, version, VersionSource::ProxyLayout);
                }
                if let Some(destination) = job.destination {
                    outputs.insert(destination, manifest);
                }
                Ok(())
            });
        }
        exec.wait().await?;
    }

    let versions = std::mem::take(&mut *versions.lock().unwrap_or_else(PoisonError::into_inner));
    tracing::debug!("Selected {} module versions for proxy output", versions.len());

    let exec: ParallelExecutor<MergeError> =
        ParallelExecutor::new(workers, FailurePolicy::CollectFirst);
    for (destination, mut manifest) in outputs.snapshot() {
        manifest.set_require_versions(&versions);
        exec.spawn(async move { write_replacing(&destination, &manifest.format()).await });
    }
    exec.wait().await?;

    Ok(versions)
}

/// The version encoded in an `@v/<version>.mod` file name.
fn version_from_name(path: &Path) -> Option<String> {
    let in_version_dir = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|name| name == VERSION_DIR);
    if !in_version_dir {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

/// Mirrors the directories of `inputs` under `output`, symlinking every
/// non-manifest file. The first input providing a file wins.
fn link_proxy_tree(output: &Path, inputs: &[PathBuf]) -> Result<Vec<ManifestJob>, MergeError> {
    let mut manifests: BTreeMap<PathBuf, ManifestJob> = BTreeMap::new();

    for input in inputs {
        for entry in WalkDir::new(input).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(input).to_path_buf();
                MergeError::io(path, e.into())
            })?;
            let relative = entry
                .path()
                .strip_prefix(input)
                .map_err(|_| MergeError::NotADirectory(entry.path().to_path_buf()))?;
            let destination = output.join(relative);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&destination)
                    .map_err(|e| MergeError::io(&destination, e))?;
                continue;
            }

            if entry.path().extension().is_some_and(|e| e == "mod") {
                if !manifests.contains_key(&destination) {
                    let version = version_from_name(relative);
                    manifests.insert(
                        destination.clone(),
                        ManifestJob {
                            source: entry.path().to_path_buf(),
                            destination: Some(destination),
                            version,
                        },
                    );
                }
                continue;
            }

            if std::fs::symlink_metadata(&destination).is_ok() {
                tracing::debug!("Keeping existing {}", destination.display());
                continue;
            }
            std::os::unix::fs::symlink(entry.path(), &destination)
                .map_err(|e| MergeError::io(&destination, e))?;
        }
    }

    Ok(manifests.into_values().collect())
}
