//! gobuild-nix - Go modules for Nix
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Two halves share one binary:
//!
//! - `generate` runs at development time. It resolves the module closure of a
//!   Go project, hashes every module as a fixed-output derivation and writes
//!   `gobuild-nix.lock`.
//! - The remaining commands run inside Nix builds. They read the derivation
//!   environment (`src`, `srcs`, `out`, `NIX_GOBUILD_MODCACHE`, ...) and
//!   assemble module caches before handing over to the Go toolchain.
//! - `gocacheprog` is run by `go` itself and serves its build cache from the
//!   caches of dependency derivations.

pub mod cmd;

use clap::{Parser, Subcommand};
use gobuild_core::DEFAULT_RESOLVE_WORKERS;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "gobuild-nix")]
#[command(author, version, about = "Go module locking and module cache assembly for Nix")]
pub struct Cli {
    /// Number of concurrent workers
    #[arg(short, long, global = true)]
    pub jobs: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Resolve dependencies and write the lock file
    Generate {
        /// Project directory containing go.mod
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Nixpkgs expression used to prefetch modules
        #[arg(short = 'f', long, default_value = "<nixpkgs>")]
        nixpkgs: String,
        /// Go toolchain attribute in nixpkgs
        #[arg(short = 'a', long, default_value = "go")]
        go_attr: String,
        /// Lock file path (defaults to gobuild-nix.lock in the project)
        #[arg(long)]
        lock_file: Option<PathBuf>,
    },
    /// Link module caches and prepare the source tree
    Unpack {
        /// Build root
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Build packages to warm the build cache
    Build {
        /// Directory to build in
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Install packages into $out/bin
    Install {
        /// Directory to install from
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Export the module cache to dependent derivations
    #[command(name = "setup-hook")]
    SetupHook,
    /// Merge module caches, pinning every manifest to one version set
    #[command(name = "merge-cache")]
    MergeCache {
        /// Directory to create
        #[arg(long)]
        target: PathBuf,
        /// Also write a manifest requiring every merged module
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Source caches; later sources win on collisions
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
    /// Assemble a module proxy from source proxies
    #[command(name = "proxy-output")]
    ProxyOutput {
        /// Proxy root to create
        #[arg(long)]
        out: PathBuf,
        /// Dependency proxies consulted for versions only
        #[arg(long, env = "NIX_GOBUILD_PROXY", value_delimiter = ':')]
        proxy: Vec<PathBuf>,
        /// Source proxies
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
    /// Serve go's build cache (GOCACHEPROG) from NIX_GOBUILD_CACHE layers
    Gocacheprog,
    /// Parse and reformat a go.mod file
    #[command(name = "fmt-mod")]
    FmtMod {
        /// Manifest to format (stdin when omitted)
        file: Option<PathBuf>,
    },
}

impl Cli {
    /// Worker count for lock generation.
    pub fn resolve_workers(&self) -> usize {
        self.jobs.unwrap_or(DEFAULT_RESOLVE_WORKERS).max(1)
    }
}
