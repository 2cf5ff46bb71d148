//! `GOCACHEPROG` helper command

use anyhow::{Context, Result};
use gobuild_core::{CacheConfig, CacheProcess, DiskCache};
use tokio::io::BufReader;

/// Serve `go`'s build cache over stdin/stdout until it closes the session.
pub async fn gocacheprog() -> Result<()> {
    let config = CacheConfig::from_env()?;

    if !config.inputs.is_empty() {
        tracing::info!("Using cache inputs:");
        for dir in &config.inputs {
            tracing::info!("{} ...", dir.display());
        }
    }
    if let Some(out) = &config.out {
        tracing::info!("Using cache output: {} ...", out.display());
    }
    if let Some(nanos) = config.time_nanos {
        tracing::info!("Using cache timestamp {nanos} ...");
    }

    let cache = DiskCache::open(&config)
        .await
        .context("error opening build cache")?;
    let process = CacheProcess::new(cache, config.verbose);
    process
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("build cache session failed")?;
    Ok(())
}
