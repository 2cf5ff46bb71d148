//! The unified `module path → version` map enforced across a merged cache tree.

use crate::version::ModuleVersion;
use std::collections::BTreeMap;

/// Where a version in a [`VersionMap`] came from, in increasing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VersionSource {
    /// Found by live discovery; used only when nothing better is known.
    Discovered,
    /// Recovered from a module-proxy directory or file name.
    ProxyLayout,
    /// Taken from checksum data; authoritative and never replaced.
    Checksum,
}

/// Single source of truth for which version of each module is authoritative.
///
/// Insertion rules:
/// - a higher-priority [`VersionSource`] always replaces a lower one;
/// - a lower-priority source never replaces a higher one;
/// - within the same priority the higher version wins, except for
///   [`VersionSource::Checksum`] entries, which are immutable once set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMap {
    entries: BTreeMap<String, (ModuleVersion, VersionSource)>,
}

impl VersionMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `version` for `path`, following the priority rules.
    ///
    /// Returns true if the map changed.
    pub fn insert(
        &mut self,
        path: impl Into<String>,
        version: impl Into<ModuleVersion>,
        source: VersionSource,
    ) -> bool {
        let path = path.into();
        let version = version.into();

        match self.entries.get(&path) {
            Some((current, current_source)) => {
                let replace = match source.cmp(current_source) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => {
                        source != VersionSource::Checksum && version.is_newer_than(current)
                    }
                };
                if replace {
                    self.entries.insert(path, (version, source));
                }
                replace
            }
            None => {
                self.entries.insert(path, (version, source));
                true
            }
        }
    }

    /// Merges every entry of `other` into `self` using the same rules as [`VersionMap::insert`].
    pub fn extend(&mut self, other: VersionMap) {
        for (path, (version, source)) in other.entries {
            self.insert(path, version, source);
        }
    }

    /// The unified version for `path`.
    pub fn get(&self, path: &str) -> Option<&ModuleVersion> {
        self.entries.get(path).map(|(v, _)| v)
    }

    /// The source that supplied the version for `path`.
    pub fn source(&self, path: &str) -> Option<VersionSource> {
        self.entries.get(path).map(|(_, s)| *s)
    }

    /// Iterates `(path, version)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModuleVersion)> {
        self.entries.iter().map(|(p, (v, _))| (p.as_str(), v))
    }

    /// Module paths in sorted order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of modules in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map holds no modules.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_version_wins_within_same_source() {
        let mut map = VersionMap::new();
        assert!(map.insert("a", "v1.0.0", VersionSource::ProxyLayout));
        assert!(map.insert("a", "v1.2.0", VersionSource::ProxyLayout));
        assert!(!map.insert("a", "v1.1.0", VersionSource::ProxyLayout));
        assert_eq!(map.get("a").unwrap(), "v1.2.0");
    }

    #[test]
    fn checksum_entries_are_immutable() {
        let mut map = VersionMap::new();
        map.insert("a", "v1.0.0", VersionSource::Checksum);
        assert!(!map.insert("a", "v9.0.0", VersionSource::Checksum));
        assert!(!map.insert("a", "v9.0.0", VersionSource::ProxyLayout));
        assert_eq!(map.get("a").unwrap(), "v1.0.0");
    }

    #[test]
    fn higher_priority_source_overrides() {
        let mut map = VersionMap::new();
        map.insert("a", "v2.0.0", VersionSource::Discovered);
        assert!(map.insert("a", "v1.0.0", VersionSource::ProxyLayout));
        assert_eq!(map.get("a").unwrap(), "v1.0.0");
        assert_eq!(map.source("a"), Some(VersionSource::ProxyLayout));
        assert!(!map.insert("a", "v3.0.0", VersionSource::Discovered));
    }

    #[test]
    fn iteration_is_sorted() {
        let mut map = VersionMap::new();
        map.insert("z.com/m", "v1.0.0", VersionSource::Discovered);
        map.insert("a.com/m", "v1.0.0", VersionSource::Discovered);
        assert_eq!(map.paths(), vec!["a.com/m", "z.com/m"]);
    }
}
