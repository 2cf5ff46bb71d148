//! Module coordinates and the records produced by fetching them.

use crate::version::ModuleVersion;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A module path plus one concrete version: the unit of resolution and caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleCoordinate {
    /// Hierarchical module path (e.g. `golang.org/x/mod`).
    pub path: String,
    /// Selected version (e.g. `v0.17.0`).
    pub version: ModuleVersion,
}

impl ModuleCoordinate {
    /// Create a coordinate from a path and version.
    pub fn new(path: impl Into<String>, version: impl Into<ModuleVersion>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
        }
    }

    /// The `path@version` key used to de-duplicate fetches and to look up cached hashes.
    pub fn key(&self) -> String {
        format!("{}@{}", self.path, self.version)
    }
}

impl std::fmt::Display for ModuleCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.path, self.version)
    }
}

/// Returns true for manifest references that point at the local filesystem
/// (`./x`, `../x`, `/abs`) rather than at a fetchable module.
pub fn is_local_path(path: &str) -> bool {
    path.starts_with('.') || path.starts_with('/')
}

/// One record of the module fetch stream (`go mod download -json`).
///
/// Field names follow the stream's PascalCase keys. All locations are
/// optional because the stream omits them for modules that failed to
/// download, in which case `error` is populated instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleDownload {
    /// Module path.
    pub path: String,
    /// Version that was fetched.
    pub version: ModuleVersion,
    /// Human-readable `.info` file.
    #[serde(default, rename = "Info", skip_serializing_if = "Option::is_none")]
    pub info_path: Option<PathBuf>,
    /// Location of the module's manifest (`.mod` file).
    #[serde(default, rename = "GoMod", skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    /// Location of the module archive.
    #[serde(default, rename = "Zip", skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    /// Directory the archive was extracted into.
    #[serde(default, rename = "Dir", skip_serializing_if = "Option::is_none")]
    pub extracted_dir: Option<PathBuf>,
    /// Checksum of the module contents.
    #[serde(default, rename = "Sum", skip_serializing_if = "Option::is_none")]
    pub content_sum: Option<String>,
    /// Checksum of the manifest alone.
    #[serde(default, rename = "GoModSum", skip_serializing_if = "Option::is_none")]
    pub manifest_sum: Option<String>,
    /// Error reported by the fetcher for this module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModuleDownload {
    /// The coordinate this download was produced for.
    pub fn coordinate(&self) -> ModuleCoordinate {
        ModuleCoordinate::new(self.path.clone(), self.version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_key_and_display() {
        let coord = ModuleCoordinate::new("golang.org/x/mod", "v0.17.0");
        assert_eq!(coord.key(), "golang.org/x/mod@v0.17.0");
        assert_eq!(coord.to_string(), coord.key());
    }

    #[test]
    fn local_paths_are_detected() {
        assert!(is_local_path("./local"));
        assert!(is_local_path("../sibling"));
        assert!(is_local_path("/abs/path"));
        assert!(!is_local_path("github.com/foo/bar"));
    }

    #[test]
    fn download_decodes_fetch_stream_fields() {
        let json = r#"{
            "Path": "golang.org/x/mod",
            "Version": "v0.17.0",
            "Info": "/cache/download/golang.org/x/mod/@v/v0.17.0.info",
            "GoMod": "/cache/download/golang.org/x/mod/@v/v0.17.0.mod",
            "Zip": "/cache/download/golang.org/x/mod/@v/v0.17.0.zip",
            "Dir": "/mod/golang.org/x/mod@v0.17.0",
            "Sum": "h1:abc=",
            "GoModSum": "h1:def="
        }"#;
        let dl: ModuleDownload = serde_json::from_str(json).unwrap();
        assert_eq!(dl.coordinate(), ModuleCoordinate::new("golang.org/x/mod", "v0.17.0"));
        assert_eq!(
            dl.manifest_path.as_deref(),
            Some(std::path::Path::new("/cache/download/golang.org/x/mod/@v/v0.17.0.mod"))
        );
        assert_eq!(dl.manifest_sum.as_deref(), Some("h1:def="));
        assert!(dl.error.is_none());
    }

    #[test]
    fn download_with_error_has_no_locations() {
        let json = r#"{"Path": "example.com/gone", "Version": "v1.0.0", "Error": "not found"}"#;
        let dl: ModuleDownload = serde_json::from_str(json).unwrap();
        assert_eq!(dl.error.as_deref(), Some("not found"));
        assert!(dl.manifest_path.is_none());
    }
}
