//! Build-phase commands: unpack, build, install and setup-hook

use anyhow::{Context, Result};
use gobuild_core::gotool::{default_patterns, proxy_module_paths};
use gobuild_core::{BuildEnv, GoTool};
use std::collections::BTreeSet;
use std::path::Path;

/// Link module caches under `root` and prepare `root/src`.
pub async fn unpack(root: &Path, env: &BuildEnv) -> Result<()> {
    let go = GoTool::locate(env.workers)?;
    let versions = gobuild_core::unpack::unpack(root, env, &go).await?;
    tracing::info!("Unpacked {} modules", versions.len());
    Ok(())
}

/// Packages to act on: the explicit list if given, otherwise everything in
/// the own proxies and the local tree.
async fn packages(
    go: &GoTool,
    env: &BuildEnv,
    explicit: Option<&[String]>,
    dir: &Path,
) -> Result<Vec<String>> {
    let (patterns, known) = match explicit {
        Some(explicit) => (explicit.to_vec(), BTreeSet::new()),
        None => {
            let modules = proxy_module_paths(&env.src_download_dirs()?, env.workers)
                .await
                .context("error reading source proxies")?;
            (default_patterns(&modules), modules)
        }
    };
    Ok(go.list_packages(dir, &patterns, known).await?)
}

/// Build every package once, tolerating failures.
pub async fn build(dir: &Path, env: &BuildEnv) -> Result<()> {
    let go = GoTool::locate(env.workers)?;
    let packages = packages(&go, env, env.build_packages.as_deref(), dir).await?;
    tracing::info!("Building {} packages", packages.len());

    let failed = go.build_packages(dir, &env.build_flags, &packages).await;
    if !failed.is_empty() {
        tracing::warn!("{} packages failed to build: {}", failed.len(), failed.join(" "));
    }
    Ok(())
}

/// Install packages into `$out/bin`.
pub async fn install(dir: &Path, env: &BuildEnv) -> Result<()> {
    let out = env.out()?;
    let go = GoTool::locate(env.workers)?;
    let packages = packages(&go, env, env.install_packages.as_deref(), dir).await?;
    tracing::info!("Installing {} packages", packages.len());

    go.install_packages(dir, &env.install_flags, &packages, &out.join("bin"))
        .await
        .context("error installing packages")?;
    Ok(())
}

pub async fn setup_hook(env: &BuildEnv) -> Result<()> {
    gobuild_core::setup_hook::write_setup_hook(env).await?;
    Ok(())
}
