//! Concurrent engines behind gobuild-nix.
//!
//! Lock generation ([`LockBuilder`]) resolves the module closure with a
//! [`DependencyResolver`], hashes each module through a [`HashPrefetcher`]
//! and records dependency cycles. The build phases ([`unpack`],
//! [`setup_hook`], [`gotool`]) assemble module caches from [`modcache`] and
//! drive the Go toolchain, and [`buildcache`] serves `go`'s build cache from
//! layered derivation outputs.

pub mod buildcache;
pub mod concurrent;
pub mod config;
pub mod cycles;
pub mod fetch;
pub mod gotool;
pub mod hash;
pub mod lock;
pub mod modcache;
pub mod parexec;
pub mod resolver;
pub mod setup_hook;
pub mod unpack;

#[cfg(test)]
mod testing;

pub use buildcache::{CacheError, CacheProcess, DiskCache};
pub use concurrent::ConcurrentMap;
pub use config::{BuildEnv, CacheConfig, Config};
pub use fetch::{FetchError, GoModDownloader, ModuleFetcher};
pub use gotool::{BatchRunner, GoTool, ToolError};
pub use hash::{HashError, HashExtractor, HashPrefetcher, NixPrefetcher};
pub use lock::LockBuilder;
pub use modcache::MergeError;
pub use parexec::{Cancelled, FailurePolicy, ParallelExecutor, TaskError};
pub use resolver::{DependencyResolver, ResolveError, Seed};

/// Default number of concurrent fetches during lock generation.
pub const DEFAULT_RESOLVE_WORKERS: usize = 10;

/// Default number of build workers when `NIX_BUILD_CORES` is unset.
pub const DEFAULT_BUILD_WORKERS: usize = 4;
