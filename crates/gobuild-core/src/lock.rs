//! Lock file generation.
//!
//! Resolution seeds come from the project's checksum file (pinned) and its
//! manifest's direct requirements. Every resolved module is then hashed
//! through the [`HashPrefetcher`], unless the previous lock file already
//! recorded a hash for the same `path@version`.

use anyhow::{Context, Result};
use gobuild_schema::coordinate::is_local_path;
use gobuild_schema::{GoSum, LOCK_FILE, LockEntry, LockFile, ModFile, ModuleDownload};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::concurrent::ConcurrentMap;
use crate::cycles::find_all_cycles;
use crate::fetch::ModuleFetcher;
use crate::hash::HashPrefetcher;
use crate::parexec::{FailurePolicy, ParallelExecutor};
use crate::resolver::{DependencyResolver, Seed};

#[derive(Debug)]
pub struct LockBuilder<F, H> {
    dir: PathBuf,
    lock_path: PathBuf,
    fetcher: Arc<F>,
    prefetcher: Arc<H>,
    workers: usize,
    token: CancellationToken,
}

impl<F, H> LockBuilder<F, H>
where
    F: ModuleFetcher + 'static,
    H: HashPrefetcher + 'static,
{
    pub fn new(dir: impl Into<PathBuf>, fetcher: F, prefetcher: H, workers: usize) -> Self {
        let dir = dir.into();
        Self {
            lock_path: dir.join(LOCK_FILE),
            dir,
            fetcher: Arc::new(fetcher),
            prefetcher: Arc::new(prefetcher),
            workers,
            token: CancellationToken::new(),
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Reads and writes the lock at `path` instead of next to the manifest.
    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Seeds for the project in `dir`.
    ///
    /// Checksummed modules are pinned at their highest checksummed version;
    /// direct requirements of the manifest (after its replacements) join
    /// unpinned. Either file may be missing.
    pub fn seeds(&self) -> Result<Vec<Seed>> {
        let mut seeds = Vec::new();

        let sum_path = self.dir.join("go.sum");
        if sum_path.exists() {
            let sum = GoSum::parse_file(&sum_path)?;
            seeds.extend(
                sum.pinned_versions()
                    .into_iter()
                    .map(|(path, version)| Seed::pinned(path, version)),
            );
        }

        let mod_path = self.dir.join("go.mod");
        if mod_path.exists() {
            let manifest = ModFile::parse_file(&mod_path)?;
            for require in &manifest.requires {
                let seed = match manifest.replacement_for(require) {
                    Some(replacement) => match replacement.coordinate() {
                        Some(target) => Seed {
                            coordinate: target,
                            pinned: false,
                        },
                        None => continue,
                    },
                    None => Seed::unpinned(require.path.clone(), require.version.clone()),
                };
                seeds.push(seed);
            }
        }

        Ok(seeds)
    }

    /// Resolves, hashes, and assembles the lock model without writing it.
    pub async fn build(&self) -> Result<LockFile> {
        let previous = LockFile::load_previous(self.lock_path())
            .map(|lock| lock.hashes_by_coordinate())
            .unwrap_or_default();

        let seeds = self.seeds().context("error reading project manifests")?;

        tracing::info!("Downloading dependencies");
        let downloads = DependencyResolver::from_arc(Arc::clone(&self.fetcher), self.workers)
            .with_token(self.token.clone())
            .resolve(seeds)
            .await
            .context("error resolving dependencies")?;
        tracing::info!("Done downloading dependencies");

        let locked = self.lock_entries(downloads, previous).await?;

        let mut lock = LockFile::new();
        lock.require = locked.keys().cloned().collect();
        lock.locked = locked;
        lock.filter_unsatisfied();
        let cycles = find_all_cycles(&lock.graph());
        lock.assign_cycles(&cycles);

        Ok(lock)
    }

    /// Builds the lock model and writes it next to the project manifest.
    pub async fn generate(&self) -> Result<LockFile> {
        let lock = self.build().await?;
        let path = self.lock_path();
        lock.save(path)?;
        tracing::info!("Wrote {}", path.display());
        Ok(lock)
    }

    async fn lock_entries(
        &self,
        downloads: Vec<ModuleDownload>,
        previous: HashMap<String, String>,
    ) -> Result<BTreeMap<String, LockEntry>> {
        let exec: ParallelExecutor<anyhow::Error> = ParallelExecutor::with_token(
            self.workers,
            FailurePolicy::CancelOnError,
            self.token.child_token(),
        );
        let entries = Arc::new(ConcurrentMap::new());
        let previous = Arc::new(previous);

        for download in downloads {
            let prefetcher = Arc::clone(&self.prefetcher);
            let entries = Arc::clone(&entries);
            let previous = Arc::clone(&previous);
            let task_exec = exec.clone();
            exec.spawn(async move {
                let coordinate = download.coordinate();
                let require = read_requirements(&download).await?;

                let hash = match previous.get(&coordinate.key()) {
                    Some(hash) => hash.clone(),
                    None => {
                        let hash = prefetcher.prefetch(&coordinate).await.with_context(|| {
                            format!("error fetching module mismatch hash for {coordinate}")
                        })?;
                        task_exec.check()?;
                        hash
                    }
                };

                entries.insert(
                    coordinate.path.clone(),
                    LockEntry {
                        version: coordinate.version,
                        hash,
                        require,
                    },
                );
                Ok(())
            });
        }

        exec.wait().await?;
        Ok(Arc::try_unwrap(entries)
            .map_or_else(|shared| shared.snapshot(), ConcurrentMap::into_inner))
    }
}

/// Requirement paths of a downloaded module.
///
/// The `// indirect` marker is not trusted, so every requirement is kept.
async fn read_requirements(download: &ModuleDownload) -> Result<Vec<String>> {
    let Some(path) = download.manifest_path.as_deref() else {
        anyhow::bail!("download of {} did not report a manifest", download.coordinate());
    };
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("error reading {}", path.display()))?;
    let manifest = ModFile::parse(&path.display().to_string(), &contents)?;
    Ok(manifest
        .require_paths()
        .into_iter()
        .filter(|p| !is_local_path(p))
        .collect())
}
