//! `GOCACHEPROG` helper: serves `go`'s build cache from layered Nix outputs.
//!
//! Dependency derivations export their build caches; a build reads all of
//! them ([`CacheConfig::inputs`](crate::config::CacheConfig)) and writes
//! whatever it compiles itself to one output cache, stamped with
//! `SOURCE_DATE_EPOCH` so the output stays reproducible.

pub mod disk;
pub mod process;
pub mod protocol;

pub use disk::{CacheHit, DiskCache};
pub use process::{CacheProcess, CacheStats};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error talking to go: {0}")]
    Stream(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Request(#[source] serde_json::Error),

    #[error("error encoding cache data: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("request {id} has an undecodable body: {source}")]
    Body {
        id: i64,
        #[source]
        source: base64::DecodeError,
    },

    #[error("request {id} announced {expected} body bytes but sent {actual}")]
    BodySize { id: i64, expected: u64, actual: u64 },

    #[error("request {id} is missing its {field}")]
    MissingField { id: i64, field: &'static str },

    #[error("stream ended inside request {0}")]
    Truncated(i64),
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}
