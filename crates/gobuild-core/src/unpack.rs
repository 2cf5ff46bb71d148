//! Build tree assembly.
//!
//! Every module cache is flat-linked into `go/pkg/mod`. A local source tree
//! is then copied to `src` with its manifest pinned; without one, `src`
//! holds a synthetic module requiring every cached module at its unified
//! version, so the cached packages can be built on their own.

use anyhow::{Context, Result};
use gobuild_schema::coordinate::is_local_path;
use gobuild_schema::{DUMMY_MODULE_PATH, ModFile, VersionMap};
use std::path::Path;

use crate::config::BuildEnv;
use crate::gotool::GoTool;
use crate::modcache::copy::copy_dir;
use crate::modcache::flat::link_recursive_flat;
use crate::modcache::versions::discover_versions;

/// Source tree directory below the build root.
pub const SRC_DIR: &str = "src";

/// Module cache directory below the build root.
pub const MODCACHE_DIR: &str = "go/pkg/mod";

/// Assembles the build tree under `root` and returns the unified versions.
pub async fn unpack(root: &Path, env: &BuildEnv, go: &GoTool) -> Result<VersionMap> {
    let modcache_dirs = env.modcache_dirs()?;

    let versions = discover_versions(&modcache_dirs, env.workers)
        .await
        .context("Error loading module versions")?;
    tracing::debug!("Discovered {} module versions", versions.len());

    let target = root.join(MODCACHE_DIR);
    tokio::task::spawn_blocking(move || link_recursive_flat(&target, &modcache_dirs))
        .await?
        .context("error symlinking sources")?;

    let src_dir = root.join(SRC_DIR);
    match env.local_src() {
        Some(local) => unpack_local(local, &src_dir, &versions, env.workers, go).await?,
        None => unpack_synthetic(&src_dir, &versions, go).await?,
    }

    Ok(versions)
}

async fn unpack_local(
    local: &Path,
    src_dir: &Path,
    versions: &VersionMap,
    workers: usize,
    go: &GoTool,
) -> Result<()> {
    copy_dir(local, src_dir, "go.mod", versions, workers)
        .await
        .with_context(|| format!("error copying {}", local.display()))?;

    let manifest_path = src_dir.join("go.mod");
    if !manifest_path.is_file() {
        tracing::warn!("{} has no go.mod, skipping module download", local.display());
        return Ok(());
    }

    let manifest = ModFile::parse_file(&manifest_path)?;
    let required: Vec<String> = manifest
        .require_paths()
        .into_iter()
        .filter(|p| !is_local_path(p))
        .collect();
    if required.is_empty() {
        return Ok(());
    }
    go.download_required(src_dir, &required)
        .await
        .context("error downloading local dependencies")?;
    Ok(())
}

async fn unpack_synthetic(src_dir: &Path, versions: &VersionMap, go: &GoTool) -> Result<()> {
    tokio::fs::create_dir(src_dir)
        .await
        .with_context(|| format!("error creating {}", src_dir.display()))?;

    let mut manifest = ModFile::new(DUMMY_MODULE_PATH);
    manifest.go = Some(go.go_version().await?);
    for (path, version) in versions.iter() {
        manifest.add_require(path, version.clone());
    }

    let manifest_path = src_dir.join("go.mod");
    tokio::fs::write(&manifest_path, manifest.format())
        .await
        .with_context(|| format!("error writing {}", manifest_path.display()))?;

    let failed = go.download_modules(src_dir, &versions.paths()).await;
    if !failed.is_empty() {
        tracing::warn!("{} modules failed to download: {}", failed.len(), failed.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    /// A stand-in `go` that records its arguments.
    fn fake_go(dir: &Path) -> (PathBuf, PathBuf) {
        let log = dir.join("go.log");
        let script = dir.join("go");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nif [ \"$1\" = env ]; then echo go1.22.1; exit 0; fi\necho \"$@\" >> '{}'\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    fn cache(dir: &Path, name: &str, module: &str, version: &str) -> PathBuf {
        let root = dir.join(name);
        touch(&root, &format!("cache/download/{module}/@v/list"), &format!("{version}\n"));
        touch(
            &root,
            &format!("cache/download/{module}/@v/{version}.mod"),
            &format!("module {module}\n"),
        );
        root
    }

    #[tokio::test]
    async fn synthesises_module_without_local_source() {
        let dir = TempDir::new().unwrap();
        let (go, log) = fake_go(dir.path());
        let a = cache(dir.path(), "a", "a.com/x", "v1.0.0");
        let b = cache(dir.path(), "b", "b.com/y", "v0.2.0");
        let root = dir.path().join("build");
        std::fs::create_dir(&root).unwrap();

        let env = BuildEnv {
            srcs: vec![a],
            modcaches: vec![b],
            workers: 2,
            ..BuildEnv::default()
        };
        let versions = unpack(&root, &env, &GoTool::new(go, 2)).await.unwrap();
        assert_eq!(versions.len(), 2);

        let manifest = std::fs::read_to_string(root.join("src/go.mod")).unwrap();
        assert!(manifest.contains("module gobuild.nix/build"));
        assert!(manifest.contains("go 1.22.1"));
        assert!(manifest.contains("a.com/x v1.0.0"));
        assert!(manifest.contains("b.com/y v0.2.0"));

        assert!(root.join("go/pkg/mod/cache/download/a.com").exists());
        assert!(root.join("go/pkg/mod/cache/download/b.com").exists());

        let calls = std::fs::read_to_string(log).unwrap();
        assert_eq!(calls, "mod download a.com/x b.com/y\n");
    }

    #[tokio::test]
    async fn copies_local_source_with_pinned_manifest() {
        let dir = TempDir::new().unwrap();
        let (go, log) = fake_go(dir.path());
        let dep = cache(dir.path(), "dep", "b.com/y", "v1.5.0");
        let local = dir.path().join("local");
        touch(
            &local,
            "go.mod",
            "module a.com/app\n\nrequire (\n\tb.com/y v1.0.0\n\tc.com/z v0.1.0\n)\n",
        );
        touch(&local, "go.sum", "b.com/y v1.0.0 h1:x=\n");
        touch(&local, "main.go", "package main\n");
        let root = dir.path().join("build");
        std::fs::create_dir(&root).unwrap();

        let env = BuildEnv {
            src: Some(local),
            modcaches: vec![dep],
            workers: 2,
            ..BuildEnv::default()
        };
        unpack(&root, &env, &GoTool::new(go, 2)).await.unwrap();

        let manifest = std::fs::read_to_string(root.join("src/go.mod")).unwrap();
        assert!(manifest.contains("b.com/y v1.5.0"));
        assert!(manifest.contains("c.com/z v0.1.0"));
        assert!(root.join("src/main.go").exists());
        assert!(!root.join("src/go.sum").exists());

        let calls = std::fs::read_to_string(log).unwrap();
        assert_eq!(calls, "mod download b.com/y c.com/z\n");
    }
}
