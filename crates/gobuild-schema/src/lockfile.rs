//! The persisted lock file (`gobuild-nix.lock`).
//!
//! The lock file records, for every module in the resolved closure, the
//! selected version, its content hash and the requirement edges that stayed
//! inside the closure. Modules that form dependency cycles are additionally
//! tagged with a cycle id so that consumers can build them together.

use crate::version::ModuleVersion;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Schema version written to and expected from lock files.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the lock file inside a project directory.
pub const LOCK_FILE: &str = "gobuild-nix.lock";

/// Errors from reading or writing a lock file.
#[derive(thiserror::Error, Debug)]
pub enum LockFileError {
    /// The lock file could not be read or written.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Lock file location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The lock file is not valid TOML for this schema.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// Lock file location.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// The lock file was written with a different schema version.
    #[error("Unsupported lock file schema {found} (expected {SCHEMA_VERSION})")]
    Schema {
        /// Schema version found in the file.
        found: u32,
    },

    /// The lock model could not be serialized.
    #[error("Failed to serialize lock file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Lock data for a single module path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Selected version.
    pub version: ModuleVersion,
    /// Content hash reported by the content-addressed fetcher.
    pub hash: String,
    /// Required module paths, restricted to paths that are themselves locked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require: Vec<String>,
}

/// The resolved closure of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    /// Schema version; see [`SCHEMA_VERSION`].
    pub schema: u32,
    /// Every locked module path, sorted.
    #[serde(default)]
    pub require: Vec<String>,
    /// Module path → cycle id, for modules inside multi-member cycles.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cycles: BTreeMap<String, usize>,
    /// Module path → lock entry.
    #[serde(default)]
    pub locked: BTreeMap<String, LockEntry>,
}

impl Default for LockFile {
    fn default() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            require: Vec::new(),
            cycles: BTreeMap::new(),
            locked: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
struct SchemaHeader {
    schema: Option<u32>,
}

impl LockFile {
    /// Creates an empty lock file with the current schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses lock file text, rejecting other schema versions.
    ///
    /// # Errors
    ///
    /// Returns [`LockFileError::Schema`] on a schema mismatch and
    /// [`LockFileError::Parse`] if the text is not a valid lock file.
    pub fn from_toml(path: &Path, content: &str) -> Result<Self, LockFileError> {
        let parse_err = |source| LockFileError::Parse {
            path: path.to_path_buf(),
            source,
        };

        let header: SchemaHeader = toml::from_str(content).map_err(parse_err)?;
        if let Some(found) = header.schema.filter(|s| *s != SCHEMA_VERSION) {
            return Err(LockFileError::Schema { found });
        }

        toml::from_str(content).map_err(parse_err)
    }

    /// Loads and validates the lock file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, cannot be parsed, or has
    /// a different schema version.
    pub fn load(path: &Path) -> Result<Self, LockFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| LockFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(path, &content)
    }

    /// Best-effort load of a previous lock file.
    ///
    /// A missing file, unreadable file, parse failure or schema mismatch all
    /// mean "no prior data" and yield `None`.
    pub fn load_previous(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match Self::load(path) {
            Ok(lock) => Some(lock),
            Err(e) => {
                tracing::warn!("Ignoring previous lock file: {e}");
                None
            }
        }
    }

    /// Hashes of every locked module keyed by `path@version`.
    pub fn hashes_by_coordinate(&self) -> HashMap<String, String> {
        self.locked
            .iter()
            .map(|(path, entry)| (format!("{path}@{}", entry.version), entry.hash.clone()))
            .collect()
    }

    /// Drops requirement edges that point outside the locked set.
    ///
    /// Such edges belong to optional dependencies never used by the target.
    pub fn filter_unsatisfied(&mut self) {
        let locked: std::collections::HashSet<String> = self.locked.keys().cloned().collect();
        for entry in self.locked.values_mut() {
            entry.require.retain(|r| locked.contains(r));
        }
    }

    /// The requirement graph of the locked set, in sorted path order.
    pub fn graph(&self) -> BTreeMap<String, Vec<String>> {
        self.locked
            .iter()
            .map(|(path, entry)| (path.clone(), entry.require.clone()))
            .collect()
    }

    /// Tags every member of each cycle with the cycle's index.
    pub fn assign_cycles(&mut self, cycles: &[Vec<String>]) {
        self.cycles.clear();
        for (id, cycle) in cycles.iter().enumerate() {
            for path in cycle {
                self.cycles.insert(path.clone(), id);
            }
        }
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`LockFileError::Serialize`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, LockFileError> {
        Ok(toml::to_string(self)?)
    }

    /// Atomically persists this lock file at `path`.
    ///
    /// The file is first written to a temporary location and then renamed so
    /// that readers never observe a partially written lock file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, writing, or the rename fails.
    pub fn save(&self, path: &Path) -> Result<(), LockFileError> {
        let content = self.to_toml()?;
        let io_err = |source| LockFileError::Io {
            path: path.to_path_buf(),
            source,
        };

        let temp_path = path.with_extension("lock.tmp");
        std::fs::write(&temp_path, &content).map_err(io_err)?;
        std::fs::rename(&temp_path, path).map_err(io_err)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(version: &str, require: &[&str]) -> LockEntry {
        LockEntry {
            version: ModuleVersion::new(version),
            hash: format!("sha256-{version}"),
            require: require.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn sample() -> LockFile {
        let mut lock = LockFile::new();
        lock.locked.insert("a".to_string(), entry("v1.0.0", &["b", "optional"]));
        lock.locked.insert("b".to_string(), entry("v1.0.0", &["a", "c"]));
        lock.locked.insert("c".to_string(), entry("v2.0.0", &[]));
        lock.require = lock.locked.keys().cloned().collect();
        lock
    }

    #[test]
    fn filter_drops_unlocked_requirements() {
        let mut lock = sample();
        lock.filter_unsatisfied();
        assert_eq!(lock.locked["a"].require, vec!["b"]);
        for entry in lock.locked.values() {
            assert!(entry.require.iter().all(|r| lock.locked.contains_key(r)));
        }
    }

    #[test]
    fn assign_cycles_uses_component_index() {
        let mut lock = sample();
        lock.assign_cycles(&[vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(lock.cycles.get("a"), Some(&0));
        assert_eq!(lock.cycles.get("b"), Some(&0));
        assert!(!lock.cycles.contains_key("c"));
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);
        let mut lock = sample();
        lock.filter_unsatisfied();
        lock.save(&path).unwrap();

        let loaded = LockFile::load(&path).unwrap();
        assert_eq!(loaded, lock);
        assert!(!dir.path().join("gobuild-nix.lock.tmp").exists());
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = sample().to_toml().unwrap();
        let b = sample().to_toml().unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("schema = 1\n"));
        assert!(!a.contains("cycles"));
    }

    #[test]
    fn schema_mismatch_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);
        std::fs::write(&path, "schema = 99\n[locked.a]\nversion = \"v1.0.0\"\nhash = \"x\"\n").unwrap();

        assert!(matches!(
            LockFile::load(&path),
            Err(LockFileError::Schema { found: 99 })
        ));
        assert!(LockFile::load_previous(&path).is_none());
    }

    #[test]
    fn malformed_previous_lock_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);
        std::fs::write(&path, "this is = = not toml").unwrap();
        assert!(LockFile::load_previous(&path).is_none());
        assert!(LockFile::load_previous(&dir.path().join("missing.lock")).is_none());
    }

    #[test]
    fn hashes_are_keyed_by_coordinate() {
        let hashes = sample().hashes_by_coordinate();
        assert_eq!(hashes["c@v2.0.0"], "sha256-v2.0.0");
    }
}
