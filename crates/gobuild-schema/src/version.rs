//! Go-flavoured semantic version ordering.
//!
//! Module versions always carry a `v` prefix (`v1.2.3`). The shorthands
//! `v1` and `v1.2` are accepted and mean `v1.0.0` / `v1.2.0`. Build metadata
//! such as `+incompatible` takes no part in ordering. Strings that are not
//! valid versions sort below every valid version and compare equal to each
//! other.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

fn parse(v: &str) -> Option<semver::Version> {
    let rest = v.strip_prefix('v')?;
    let core_end = rest.find(['-', '+']).unwrap_or(rest.len());
    let core = &rest[..core_end];
    let shorthand = core_end == rest.len();

    let normalized = match core.matches('.').count() {
        0 if shorthand => format!("{core}.0.0"),
        1 if shorthand => format!("{core}.0"),
        2 => rest.to_string(),
        _ => return None,
    };

    let mut parsed = semver::Version::parse(&normalized).ok()?;
    parsed.build = semver::BuildMetadata::EMPTY;
    Some(parsed)
}

/// Returns true if `v` is a valid module version.
pub fn is_valid(v: &str) -> bool {
    parse(v).is_some()
}

/// Compare two module versions using semantic-version precedence.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Returns true if `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}

/// A module version string such as `v1.2.3` or `v0.0.0-20240101000000-abcdef123456`.
///
/// Ordering follows semantic-version precedence; versions of equal precedence
/// but different spelling (`v1.2` and `v1.2.0`) fall back to string order so
/// that `Ord` stays consistent with `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ModuleVersion(String);

impl ModuleVersion {
    /// Create a new version from the given string (stored as-is).
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    /// Return the version string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this version is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &ModuleVersion) -> bool {
        is_newer(&self.0, &other.0)
    }

    /// Returns true if the string parses as a module version.
    pub fn is_valid(&self) -> bool {
        is_valid(&self.0)
    }
}

impl Ord for ModuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for ModuleVersion {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for ModuleVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModuleVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModuleVersion {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl PartialEq<str> for ModuleVersion {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ModuleVersion {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
