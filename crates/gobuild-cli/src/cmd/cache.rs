//! Module cache commands

use anyhow::{Context, Result};
use gobuild_core::modcache::link::link_recursive;
use gobuild_core::modcache::proxy_output::assemble_proxy_output;
use gobuild_schema::{DUMMY_MODULE_PATH, ModFile, VersionMap};
use std::path::{Path, PathBuf};

/// A manifest requiring every module of `versions`.
pub fn pinned_manifest(versions: &VersionMap) -> ModFile {
    let mut manifest = ModFile::new(DUMMY_MODULE_PATH);
    for (path, version) in versions.iter() {
        manifest.add_require(path, version.clone());
    }
    manifest
}

/// Merge `sources` into `target`, optionally writing a pinned manifest.
pub async fn merge_cache(
    target: &Path,
    sources: &[PathBuf],
    manifest: Option<&Path>,
    workers: usize,
) -> Result<()> {
    let versions = link_recursive(target, sources, workers)
        .await
        .with_context(|| format!("error merging module caches into {}", target.display()))?;
    tracing::info!("Merged {} sources, {} modules", sources.len(), versions.len());

    if let Some(path) = manifest {
        std::fs::write(path, pinned_manifest(&versions).format())
            .with_context(|| format!("error writing {}", path.display()))?;
        tracing::info!("Wrote {}", path.display());
    }
    Ok(())
}

/// Assemble a module proxy in `out` from `sources`.
pub async fn proxy_output(
    out: &Path,
    sources: &[PathBuf],
    proxies: &[PathBuf],
    workers: usize,
) -> Result<()> {
    let proxies: Vec<PathBuf> = proxies
        .iter()
        .filter(|p| !p.as_os_str().is_empty())
        .cloned()
        .collect();
    let versions = assemble_proxy_output(out, sources, &proxies, workers)
        .await
        .with_context(|| format!("error assembling module proxy in {}", out.display()))?;
    tracing::info!("Wrote module proxy with {} modules", versions.len());
    Ok(())
}
