//! Generate command

use anyhow::Result;
use gobuild_core::{Config, GoModDownloader, LockBuilder, NixPrefetcher};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Resolve the project in `dir` and write its lock file.
pub async fn generate(dir: &Path, config: &Config, lock_file: Option<PathBuf>) -> Result<()> {
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let fetcher = GoModDownloader::new(dir);
    let prefetcher = NixPrefetcher::new(config.nixpkgs.as_str(), config.go_attr.as_str());
    let mut builder =
        LockBuilder::new(dir, fetcher, prefetcher, config.workers).with_token(token);
    if let Some(path) = lock_file {
        builder = builder.with_lock_path(path);
    }

    let lock = builder.generate().await?;
    tracing::info!(
        "Locked {} modules, {} in cycles",
        lock.locked.len(),
        lock.cycles.len()
    );
    Ok(())
}
