//! Shared types and file formats for gobuild-nix.
//!
//! Everything in this crate is synchronous and free of process execution:
//! the module coordinate model, Go-flavoured version ordering, the module
//! manifest (`go.mod`) and checksum (`go.sum`) formats, the lock file, and
//! the module-proxy directory conventions. The concurrent engines live in
//! `gobuild-core`.

pub mod coordinate;
pub mod gosum;
pub mod lockfile;
pub mod modfile;
pub mod proxy;
pub mod version;
pub mod version_map;

// Re-exports
pub use coordinate::{ModuleCoordinate, ModuleDownload};
pub use gosum::GoSum;
pub use lockfile::{LOCK_FILE, LockEntry, LockFile, LockFileError, SCHEMA_VERSION};
pub use modfile::{ModFile, ModFileError, Replace, Require};
pub use version::ModuleVersion;
pub use version_map::{VersionMap, VersionSource};

/// Module path of the synthetic manifest created when building without a local source tree.
pub const DUMMY_MODULE_PATH: &str = "gobuild.nix/build";
