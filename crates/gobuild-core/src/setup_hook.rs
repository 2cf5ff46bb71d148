//! Exporting a derivation's module cache to its dependents.
//!
//! The own proxies are copied into `$out/nix-support/gobuild-nix/mod` with
//! their manifests pinned, and the setup hook adds that directory to
//! `NIX_GOBUILD_MODCACHE` for every derivation that depends on this one.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::config::BuildEnv;
use crate::modcache::copy::copy_dir;
use crate::modcache::versions::discover_versions;
use crate::parexec::{FailurePolicy, ParallelExecutor};

/// Module cache directory below `$out`.
pub const MODCACHE_OUTPUT_DIR: &str = "nix-support/gobuild-nix/mod";

pub const SEARCH_PATH_VAR: &str = "NIX_GOBUILD_MODCACHE";

pub fn search_path_directive(dir: &Path) -> String {
    format!("addToSearchPath {SEARCH_PATH_VAR} '{}'\n", dir.display())
}

/// Copies the own proxies into `$out` and appends the search-path directive.
///
/// Returns the exported cache directory.
pub async fn write_setup_hook(env: &BuildEnv) -> Result<PathBuf> {
    let out = env.out()?;
    let nix_support = out.join("nix-support");
    let modcache_dir = out.join(MODCACHE_OUTPUT_DIR);

    let srcs = env.proxy_srcs()?;
    let versions = discover_versions(&env.modcache_dirs()?, env.workers)
        .await
        .context("Error loading module versions")?;
    let versions = Arc::new(versions);

    let exec: ParallelExecutor<anyhow::Error> =
        ParallelExecutor::new(env.workers, FailurePolicy::CollectFirst);
    for src in srcs {
        let versions = Arc::clone(&versions);
        let modcache_dir = modcache_dir.clone();
        let workers = env.workers;
        exec.spawn(async move {
            copy_dir(&src, &modcache_dir, "*.mod", &versions, workers)
                .await
                .with_context(|| {
                    format!("error copying {} to {}", src.display(), modcache_dir.display())
                })
        });
    }
    exec.wait().await?;

    tokio::fs::create_dir_all(&modcache_dir)
        .await
        .with_context(|| format!("error creating {}", modcache_dir.display()))?;

    let hook = nix_support.join("setup-hook");
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&hook)
        .await
        .with_context(|| format!("error opening {}", hook.display()))?;
    file.write_all(search_path_directive(&modcache_dir).as_bytes())
        .await
        .with_context(|| format!("error writing {}", hook.display()))?;
    file.flush().await?;

    tracing::info!("Exported module cache to {}", modcache_dir.display());
    Ok(modcache_dir)
}
