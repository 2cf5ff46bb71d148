//! Layered on-disk build cache.
//!
//! Each directory holds two kinds of file: `a-<action id>` is a small JSON
//! index entry naming an output, and `o-<output id>` is the output itself.
//! Lookups search the input directories in order and then the output
//! directory. Writes only ever go to the output directory, through a
//! temporary file and a rename.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

use super::CacheError;
use crate::config::CacheConfig;

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    #[serde(rename = "v")]
    version: u32,
    #[serde(rename = "o")]
    output_id: String,
    #[serde(rename = "n")]
    size: u64,
    #[serde(rename = "t")]
    time_nanos: i64,
}

/// A cached output found by [`DiskCache::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub output_id: Vec<u8>,
    pub size: u64,
    pub time_nanos: i64,
    pub disk_path: PathBuf,
}

#[derive(Debug)]
pub struct DiskCache {
    lookup: Vec<PathBuf>,
    out: PathBuf,
    time_nanos: Option<i64>,
    next_temp: AtomicU64,
    /// Backs `out` when no output directory is configured.
    _scratch: Option<TempDir>,
}

impl DiskCache {
    /// Opens the cache described by `config`, creating the output directory.
    ///
    /// Without an output directory, new entries go to a temporary directory
    /// that is removed when the cache is dropped.
    pub async fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        // go insists on absolute disk paths.
        let mut lookup = config
            .lookup_dirs()
            .into_iter()
            .map(|dir| std::path::absolute(&dir).map_err(|e| CacheError::io(dir, e)))
            .collect::<Result<Vec<_>, _>>()?;
        let (out, scratch) = match &config.out {
            Some(out) => {
                tokio::fs::create_dir_all(out)
                    .await
                    .map_err(|e| CacheError::io(out, e))?;
                let out = std::path::absolute(out).map_err(|e| CacheError::io(out, e))?;
                (out, None)
            }
            None => {
                let scratch = TempDir::with_prefix("gobuild-nix-cache")
                    .map_err(|e| CacheError::io(std::env::temp_dir(), e))?;
                let out = scratch.path().to_path_buf();
                lookup.push(out.clone());
                (out, Some(scratch))
            }
        };

        Ok(Self {
            lookup,
            out,
            time_nanos: config.time_nanos,
            next_temp: AtomicU64::new(0),
            _scratch: scratch,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out
    }

    /// Looks `action_id` up in every layer. Corrupt or dangling entries are misses.
    pub async fn get(&self, action_id: &[u8]) -> Result<Option<CacheHit>, CacheError> {
        let action = format!("a-{}", hex::encode(action_id));
        for dir in &self.lookup {
            let index_path = dir.join(&action);
            let raw = match tokio::fs::read(&index_path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CacheError::io(&index_path, e)),
            };

            let entry: IndexEntry = match serde_json::from_slice(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Ignoring corrupt cache entry {}: {e}", index_path.display());
                    continue;
                }
            };
            let Ok(output_id) = hex::decode(&entry.output_id) else {
                tracing::debug!("Ignoring cache entry {} with bad output id", index_path.display());
                continue;
            };

            let disk_path = dir.join(format!("o-{}", entry.output_id));
            match tokio::fs::metadata(&disk_path).await {
                Ok(meta) if meta.len() == entry.size => {
                    return Ok(Some(CacheHit {
                        output_id,
                        size: entry.size,
                        time_nanos: entry.time_nanos,
                        disk_path,
                    }));
                }
                Ok(_) => {
                    tracing::debug!("Ignoring truncated cache output {}", disk_path.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&disk_path, e)),
            }
        }
        Ok(None)
    }

    /// Stores `body` as `output_id` and points `action_id` at it. Returns the output's path.
    pub async fn put(&self, action_id: &[u8], output_id: &[u8], body: &[u8]) -> Result<PathBuf, CacheError> {
        let output_hex = hex::encode(output_id);
        let disk_path = self.out.join(format!("o-{output_hex}"));

        let present = tokio::fs::metadata(&disk_path)
            .await
            .is_ok_and(|meta| meta.len() == body.len() as u64);
        if !present {
            self.write_atomic(&disk_path, body).await?;
        }

        let entry = IndexEntry {
            version: INDEX_VERSION,
            output_id: output_hex,
            size: body.len() as u64,
            time_nanos: self.timestamp(),
        };
        let raw = serde_json::to_vec(&entry).map_err(CacheError::Encode)?;
        let index_path = self.out.join(format!("a-{}", hex::encode(action_id)));
        self.write_atomic(&index_path, &raw).await?;

        Ok(disk_path)
    }

    fn timestamp(&self) -> i64 {
        self.time_nanos
            .unwrap_or_else(|| Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), CacheError> {
        let n = self.next_temp.fetch_add(1, Ordering::Relaxed);
        let mut temp = path.as_os_str().to_owned();
        temp.push(format!(".{}.{n}.tmp", std::process::id()));
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, contents)
            .await
            .map_err(|e| CacheError::io(&temp, e))?;
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                tracing::debug!("Leaving {}: {cleanup}", temp.display());
            }
            return Err(CacheError::io(path, e));
        }
        Ok(())
    }
}

/// Formats Unix nanoseconds the way `go` expects a cache entry's time.
pub fn format_time(nanos: i64) -> String {
    let seconds = nanos.div_euclid(1_000_000_000);
    let sub = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(seconds, sub)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
}
