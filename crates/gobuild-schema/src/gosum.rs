//! Checksum file (`go.sum`) parsing.
//!
//! Each line is `<module-path> <version>[/go.mod] <hash>`. Entries with the
//! `/go.mod` suffix only vouch for a module's manifest, the others for its
//! full contents.

use crate::modfile::ModFileError;
use crate::version::ModuleVersion;
use std::collections::BTreeMap;
use std::path::Path;

/// A single checksum line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumEntry {
    /// Module path.
    pub path: String,
    /// Module version, without the `/go.mod` suffix.
    pub version: ModuleVersion,
    /// True when the entry only covers the module's manifest.
    pub manifest_only: bool,
    /// Recorded hash (e.g. `h1:...=`).
    pub hash: String,
}

/// A parsed checksum file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoSum {
    /// Entries in file order.
    pub entries: Vec<SumEntry>,
}

impl GoSum {
    /// Parses checksum text. `file` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ModFileError::Syntax`] for lines that do not have exactly three fields.
    pub fn parse(file: &str, contents: &str) -> Result<Self, ModFileError> {
        let mut entries = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [] => {}
                [path, version, hash] => {
                    let (version, manifest_only) = match version.strip_suffix("/go.mod") {
                        Some(v) => (v, true),
                        None => (*version, false),
                    };
                    entries.push(SumEntry {
                        path: (*path).to_string(),
                        version: ModuleVersion::new(version),
                        manifest_only,
                        hash: (*hash).to_string(),
                    });
                }
                _ => {
                    return Err(ModFileError::Syntax {
                        file: file.to_string(),
                        line: idx + 1,
                        message: format!("malformed checksum line: {line}"),
                    });
                }
            }
        }
        Ok(Self { entries })
    }

    /// Reads and parses the checksum file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ModFileError::Io`] if the file cannot be read, or
    /// [`ModFileError::Syntax`] if a line is malformed.
    pub fn parse_file(path: &Path) -> Result<Self, ModFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ModFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&path.display().to_string(), &contents)
    }

    /// The pinned version of every module whose full contents are checksummed.
    ///
    /// When a path appears with several versions the highest one is kept.
    pub fn pinned_versions(&self) -> BTreeMap<String, ModuleVersion> {
        let mut pinned: BTreeMap<String, ModuleVersion> = BTreeMap::new();
        for entry in self.entries.iter().filter(|e| !e.manifest_only) {
            let newer = pinned
                .get(&entry.path)
                .is_none_or(|current| entry.version.is_newer_than(current));
            if newer {
                pinned.insert(entry.path.clone(), entry.version.clone());
            }
        }
        pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
github.com/pkg/errors v0.9.1 h1:FEBLx1zS214owpjy7qsBeixbURkuhQAwrK5UwLGTwt4=
github.com/pkg/errors v0.9.1/go.mod h1:bwawxfHBFNV+L2hUp1rHADufV3IMtnDRdf1r5NINEl0=
golang.org/x/mod v0.16.0 h1:aaa=
golang.org/x/mod v0.17.0 h1:bbb=
golang.org/x/sys v0.20.0/go.mod h1:ccc=
";

    #[test]
    fn parses_entries_and_suffixes() {
        let sum = GoSum::parse("go.sum", SAMPLE).unwrap();
        assert_eq!(sum.entries.len(), 5);
        assert!(!sum.entries[0].manifest_only);
        assert!(sum.entries[1].manifest_only);
        assert_eq!(sum.entries[1].version, "v0.9.1");
    }

    #[test]
    fn pinned_versions_skip_manifest_only_and_keep_highest() {
        let pinned = GoSum::parse("go.sum", SAMPLE).unwrap().pinned_versions();
        assert_eq!(pinned.len(), 2);
        assert_eq!(pinned["golang.org/x/mod"], "v0.17.0");
        assert!(!pinned.contains_key("golang.org/x/sys"));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let err = GoSum::parse("go.sum", "only two\n").unwrap_err();
        assert!(matches!(err, ModFileError::Syntax { line: 1, .. }));
    }
}
