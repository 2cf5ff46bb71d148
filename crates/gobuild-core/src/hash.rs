//! Content-hash discovery through a fixed-output derivation.
//!
//! Each module is realised once with a fake hash. The store rejects the
//! result and reports the hash it actually got on its error stream; that
//! report is the only output we trust.
//!
//! The report looks like:
//!
//! ```text
//! error: hash mismatch in fixed-output derivation '/nix/store/...-go-proxy.drv':
//!          specified: sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=
//!             got:    sha256-0nQm5Ys6GkTHmYw2Ay6n0Xz1xL3kq1vR2wFqJm9eLk4=
//! ```

use async_trait::async_trait;
use gobuild_schema::ModuleCoordinate;
use regex::Regex;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::Command;

use crate::parexec::{Cancelled, TaskError};

/// Prefix of the line that opens a hash-mismatch report.
pub const HASH_MISMATCH_MARKER: &str = "error: hash mismatch in fixed-output";

const SPECIFIED_PATTERN: &str = r"^\s+specified:\s+\S";
const GOT_PATTERN: &str = r"^\s+got:\s+(\S.*?)\s*$";

const FETCHER_EXPR: &str = include_str!("fetcher.nix");

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid hash pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("error reading fetch output: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("nix-instantiate failed for {coordinate} ({status})\n{stderr}")]
    Instantiate {
        coordinate: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("hash mismatch pattern not found in stream")]
    PatternNotFound,

    #[error("hash mismatch reported without an actual hash")]
    MissingActualHash,

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl TaskError for HashError {
    fn is_cancelled(&self) -> bool {
        matches!(self, HashError::Cancelled(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExtractState {
    Looking,
    HashMismatchHeader,
    SpecifiedHashLine,
    ActualHashLine(String),
}

/// Line-driven state machine that finds the actual hash in a mismatch report.
#[derive(Debug)]
pub struct HashExtractor {
    state: ExtractState,
    specified: Regex,
    got: Regex,
}

impl HashExtractor {
    pub fn new() -> Result<Self, HashError> {
        Ok(Self {
            state: ExtractState::Looking,
            specified: Regex::new(SPECIFIED_PATTERN)?,
            got: Regex::new(GOT_PATTERN)?,
        })
    }

    /// Feeds one line. Returns true once the actual hash has been captured.
    pub fn feed(&mut self, line: &str) -> bool {
        match &self.state {
            ExtractState::Looking => {
                if line.starts_with(HASH_MISMATCH_MARKER) {
                    self.state = ExtractState::HashMismatchHeader;
                }
            }
            ExtractState::HashMismatchHeader => {
                if self.specified.is_match(line) {
                    self.state = ExtractState::SpecifiedHashLine;
                }
            }
            ExtractState::SpecifiedHashLine => {
                if let Some(hash) = self.got.captures(line).and_then(|c| c.get(1)) {
                    self.state = ExtractState::ActualHashLine(hash.as_str().to_string());
                }
            }
            ExtractState::ActualHashLine(_) => {}
        }
        self.is_done()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ExtractState::ActualHashLine(_))
    }

    /// Ends the scan and returns the captured hash.
    pub fn finish(self) -> Result<String, HashError> {
        match self.state {
            ExtractState::ActualHashLine(hash) => Ok(hash),
            ExtractState::SpecifiedHashLine => Err(HashError::MissingActualHash),
            ExtractState::Looking | ExtractState::HashMismatchHeader => {
                Err(HashError::PatternNotFound)
            }
        }
    }

    /// Scans `reader` to the end and returns the actual hash.
    ///
    /// Lines after the hash are read and discarded so the producer never
    /// blocks on a full pipe.
    pub async fn extract<R>(mut self, mut reader: R) -> Result<String, HashError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            if !self.is_done() {
                // Build logs may carry arbitrary bytes; only the report lines need to decode.
                let line = String::from_utf8_lossy(&buf);
                self.feed(line.trim_end_matches(['\n', '\r']));
            }
        }
        self.finish()
    }
}

/// Computes the content hash of one module.
#[async_trait]
pub trait HashPrefetcher: Send + Sync {
    async fn prefetch(&self, coordinate: &ModuleCoordinate) -> Result<String, HashError>;
}

/// [`HashPrefetcher`] that instantiates the embedded fetcher derivation with a
/// fake hash and realises it with `nix-store -r`.
#[derive(Debug, Clone)]
pub struct NixPrefetcher {
    nixpkgs: String,
    go_attr: String,
}

impl NixPrefetcher {
    pub fn new(nixpkgs: impl Into<String>, go_attr: impl Into<String>) -> Self {
        Self {
            nixpkgs: nixpkgs.into(),
            go_attr: go_attr.into(),
        }
    }

    /// The expression passed to `nix-instantiate --expr`.
    pub fn expression(&self) -> String {
        format!(
            "(with import {} {{ }}; callPackage ({}) {{ go = pkgs.\"{}\"; }}).fetchModuleProxy",
            self.nixpkgs, FETCHER_EXPR, self.go_attr
        )
    }

    async fn instantiate(&self, coordinate: &ModuleCoordinate) -> Result<String, HashError> {
        let output = Command::new("nix-instantiate")
            .arg("--expr")
            .arg(self.expression())
            .args(["--argstr", "goPackagePath", &coordinate.path])
            .args(["--argstr", "version", coordinate.version.as_str()])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| HashError::Spawn {
                program: "nix-instantiate".to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(HashError::Instantiate {
                coordinate: coordinate.key(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl HashPrefetcher for NixPrefetcher {
    async fn prefetch(&self, coordinate: &ModuleCoordinate) -> Result<String, HashError> {
        tracing::debug!("Fetching {coordinate}");
        let extractor = HashExtractor::new()?;
        let drv_path = self.instantiate(coordinate).await?;

        let mut child = Command::new("nix-store")
            .args(["-r", &drv_path])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| HashError::Spawn {
                program: "nix-store".to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let drain = async move {
            if let Some(mut stdout) = stdout {
                tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let scan = async move {
            match stderr {
                Some(stderr) => extractor.extract(tokio::io::BufReader::new(stderr)).await,
                None => Err(HashError::PatternNotFound),
            }
        };

        let (hash, drained) = tokio::join!(scan, drain);

        // The non-zero exit is expected: the fake hash never matches.
        let status = child.wait().await?;
        drained?;
        let hash = hash?;
        tracing::trace!("{coordinate} exited with {status}");

        Ok(hash)
    }
}
