//! Module fetching through the Go toolchain's download stream.
//!
//! `go mod download -json` prints one JSON object per module, back to back.
//! The objects are decoded one at a time; reaching the end of the stream is
//! the normal way the sequence ends.

use async_trait::async_trait;
use gobuild_schema::{ModuleCoordinate, ModuleDownload};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

use crate::parexec::{Cancelled, TaskError};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run '{command}' ({status})\n{stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("error decoding module download stream: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("error downloading module {coordinate}: {message}")]
    Module { coordinate: String, message: String },

    #[error("error downloading {0}: no module download returned")]
    Missing(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl TaskError for FetchError {
    fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled(_))
    }
}

/// Fetches a single module coordinate and reports where its files landed.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn download(&self, coordinate: &ModuleCoordinate) -> Result<ModuleDownload, FetchError>;
}

/// Decodes a concatenated stream of download records.
///
/// Records carrying an `Error` field are surfaced as [`FetchError::Module`].
pub fn decode_downloads(stream: &[u8]) -> Result<Vec<ModuleDownload>, FetchError> {
    let mut downloads = Vec::new();
    for record in serde_json::Deserializer::from_slice(stream).into_iter::<ModuleDownload>() {
        let download = record?;
        if let Some(message) = &download.error {
            return Err(FetchError::Module {
                coordinate: download.coordinate().key(),
                message: message.clone(),
            });
        }
        downloads.push(download);
    }
    Ok(downloads)
}

/// [`ModuleFetcher`] backed by `go mod download -json`, run inside a module directory.
#[derive(Debug, Clone)]
pub struct GoModDownloader {
    dir: PathBuf,
    go: PathBuf,
}

impl GoModDownloader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            go: PathBuf::from("go"),
        }
    }

    /// Uses a specific `go` binary instead of the one on `PATH`.
    pub fn with_go(mut self, go: impl Into<PathBuf>) -> Self {
        self.go = go.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Downloads `targets` (`path@version` queries). With no targets the
    /// toolchain downloads every module required by the directory's manifest.
    pub async fn download_many(&self, targets: &[String]) -> Result<Vec<ModuleDownload>, FetchError> {
        let command = format!("go mod download -json {}", targets.join(" "));
        let command = command.trim_end().to_string();

        let output = Command::new(&self.go)
            .args(["mod", "download", "-json"])
            .args(targets)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| FetchError::Spawn {
                command: command.clone(),
                source,
            })?;

        // A failed download still prints its record, whose Error field is
        // more useful than the exit status.
        let downloads = decode_downloads(&output.stdout)?;

        if !output.status.success() {
            return Err(FetchError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(downloads)
    }
}

#[async_trait]
impl ModuleFetcher for GoModDownloader {
    async fn download(&self, coordinate: &ModuleCoordinate) -> Result<ModuleDownload, FetchError> {
        tracing::debug!("Downloading {coordinate}");
        self.download_many(&[coordinate.key()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Missing(coordinate.key()))
    }
}
