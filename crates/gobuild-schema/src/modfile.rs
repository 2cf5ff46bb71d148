//! Parser and formatter for module manifests (`go.mod` and proxy `.mod` files).
//!
//! Format:
//! ```text
//! module <module-path>
//!
//! go <language-version>
//!
//! require <module-path> <version> [// indirect]
//! require (
//!     <module-path> <version>
//! )
//!
//! replace <old-path> [<old-version>] => <new-path> [<new-version>]
//! exclude <module-path> <version>
//! retract <version-or-range>
//! ```
//!
//! Comments other than the `// indirect` marker are not preserved by
//! [`ModFile::format`]; directive order within each section is.

use crate::coordinate::ModuleCoordinate;
use crate::version::{self, ModuleVersion};
use crate::version_map::VersionMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors produced while reading or parsing a manifest.
#[derive(thiserror::Error, Debug)]
pub enum ModFileError {
    /// The manifest text is malformed.
    #[error("{file}:{line}: {message}")]
    Syntax {
        /// Name used for the manifest in messages (usually its path).
        file: String,
        /// 1-indexed line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// The manifest could not be read from disk.
    #[error("error reading {path}: {source}")]
    Io {
        /// Manifest location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// A single requirement of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Require {
    /// Required module path.
    pub path: String,
    /// Required (minimum) version.
    pub version: ModuleVersion,
    /// Whether the requirement carries the `// indirect` marker.
    ///
    /// The marker is informational only; it is frequently wrong and must not
    /// be used to prune requirements.
    pub indirect: bool,
}

/// One side of a `replace` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceTarget {
    /// Module path, or a filesystem path for local replacements.
    pub path: String,
    /// Version; absent for wildcard replacements and local directories.
    pub version: Option<ModuleVersion>,
}

impl ReplaceTarget {
    /// The fetchable coordinate this target names, if it has a version.
    pub fn coordinate(&self) -> Option<ModuleCoordinate> {
        self.version
            .as_ref()
            .map(|v| ModuleCoordinate::new(self.path.clone(), v.clone()))
    }
}

impl fmt::Display for ReplaceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.path))?;
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        Ok(())
    }
}

/// A `replace old => new` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replace {
    /// Module being replaced.
    pub old: ReplaceTarget,
    /// Replacement module or local directory.
    pub new: ReplaceTarget,
}

/// A parsed module manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModFile {
    /// The module's own path, from the `module` directive.
    pub module: Option<String>,
    /// Language version from the `go` directive.
    pub go: Option<String>,
    /// Toolchain from the `toolchain` directive.
    pub toolchain: Option<String>,
    /// Direct requirements in declaration order.
    pub requires: Vec<Require>,
    /// Excluded module versions.
    pub excludes: Vec<ModuleCoordinate>,
    /// Replacement directives.
    pub replaces: Vec<Replace>,
    /// Retracted versions or ranges, kept verbatim.
    pub retracts: Vec<String>,
    /// Other directives (`godebug`, `tool`, `ignore`), kept verbatim as single lines.
    pub other: Vec<String>,
}

struct Line {
    tokens: Vec<String>,
    comment: Option<String>,
}

impl Line {
    fn is_indirect(&self) -> bool {
        self.comment
            .as_deref()
            .is_some_and(|c| c == "indirect" || c.starts_with("indirect;"))
    }
}

fn tokenize(line: &str) -> Result<Line, String> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if line[i..].starts_with("//") {
            return Ok(Line {
                tokens,
                comment: Some(line[i + 2..].trim().to_string()),
            });
        }

        match c {
            '(' | ')' => {
                chars.next();
                tokens.push(c.to_string());
            }
            '"' | '`' => {
                chars.next();
                let mut token = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == c {
                        closed = true;
                        break;
                    }
                    if ch == '\\' && c == '"' {
                        if let Some((_, escaped)) = chars.next() {
                            token.push(escaped);
                        }
                        continue;
                    }
                    token.push(ch);
                }
                if !closed {
                    return Err("unterminated quoted string".to_string());
                }
                tokens.push(token);
            }
            _ => {
                let start = i;
                let mut end = line.len();
                while let Some(&(j, ch)) = chars.peek() {
                    if ch.is_whitespace() || ch == '(' || ch == ')' || line[j..].starts_with("//")
                    {
                        end = j;
                        break;
                    }
                    chars.next();
                }
                tokens.push(line[start..end].to_string());
            }
        }
    }

    Ok(Line {
        tokens,
        comment: None,
    })
}

fn quote(token: &str) -> String {
    let needs_quotes = token.is_empty()
        || token.contains("//")
        || token
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '`' | '(' | ')'));
    if needs_quotes {
        format!("\"{}\"", token.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        token.to_string()
    }
}

fn parse_version(token: &str) -> Result<ModuleVersion, String> {
    if version::is_valid(token) {
        Ok(ModuleVersion::new(token))
    } else {
        Err(format!("invalid version: {token}"))
    }
}

fn parse_replace(args: &[String]) -> Result<Replace, String> {
    let arrow = args
        .iter()
        .position(|t| t == "=>")
        .ok_or_else(|| "replace directive is missing '=>'".to_string())?;
    let (lhs, rhs) = (&args[..arrow], &args[arrow + 1..]);

    let old = match lhs {
        [path] => ReplaceTarget {
            path: path.clone(),
            version: None,
        },
        [path, version] => ReplaceTarget {
            path: path.clone(),
            version: Some(parse_version(version)?),
        },
        _ => return Err("usage: replace module/path [v1.2.3] => other/module v1.4".to_string()),
    };
    let new = match rhs {
        [path] => ReplaceTarget {
            path: path.clone(),
            version: None,
        },
        [path, version] => ReplaceTarget {
            path: path.clone(),
            version: Some(parse_version(version)?),
        },
        _ => return Err("usage: replace module/path [v1.2.3] => other/module v1.4".to_string()),
    };

    Ok(Replace { old, new })
}

impl ModFile {
    /// Creates a manifest declaring only the given module path.
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            ..Self::default()
        }
    }

    /// Reads and parses the manifest at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ModFileError::Io`] if the file cannot be read, or
    /// [`ModFileError::Syntax`] if it is malformed.
    pub fn parse_file(path: &Path) -> Result<Self, ModFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ModFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&path.display().to_string(), &contents)
    }

    /// Parses manifest text. `file` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ModFileError::Syntax`] on unknown directives, wrong argument
    /// counts, invalid versions, or unterminated blocks and strings.
    pub fn parse(file: &str, contents: &str) -> Result<Self, ModFileError> {
        let syntax = |line: usize, message: String| ModFileError::Syntax {
            file: file.to_string(),
            line,
            message,
        };

        let mut mod_file = ModFile::default();
        let mut block: Option<(String, usize)> = None;

        for (idx, raw) in contents.lines().enumerate() {
            let line_num = idx + 1;
            let line = tokenize(raw).map_err(|m| syntax(line_num, m))?;
            if line.tokens.is_empty() {
                continue;
            }

            if let Some((verb, _)) = &block {
                if line.tokens.len() == 1 && line.tokens[0] == ")" {
                    block = None;
                    continue;
                }
                let verb = verb.clone();
                mod_file
                    .apply(&verb, &line.tokens, &line)
                    .map_err(|m| syntax(line_num, m))?;
                continue;
            }

            let verb = &line.tokens[0];
            let args = &line.tokens[1..];
            match args {
                [open] if open == "(" => {
                    block = Some((verb.clone(), line_num));
                    continue;
                }
                [open, close] if open == "(" && close == ")" => continue,
                _ => {}
            }

            mod_file
                .apply(verb, args, &line)
                .map_err(|m| syntax(line_num, m))?;
        }

        if let Some((verb, line_num)) = block {
            return Err(syntax(line_num, format!("unterminated {verb} block")));
        }

        Ok(mod_file)
    }

    fn apply(&mut self, verb: &str, args: &[String], line: &Line) -> Result<(), String> {
        match verb {
            "module" => {
                let [path] = args else {
                    return Err("usage: module module/path".to_string());
                };
                if self.module.is_some() {
                    return Err("repeated module statement".to_string());
                }
                self.module = Some(path.clone());
            }
            "go" => {
                let [v] = args else {
                    return Err("usage: go 1.23".to_string());
                };
                self.go = Some(v.clone());
            }
            "toolchain" => {
                let [t] = args else {
                    return Err("usage: toolchain go1.23.0".to_string());
                };
                self.toolchain = Some(t.clone());
            }
            "require" => {
                let [path, v] = args else {
                    return Err("usage: require module/path v1.2.3".to_string());
                };
                self.requires.push(Require {
                    path: path.clone(),
                    version: parse_version(v)?,
                    indirect: line.is_indirect(),
                });
            }
            "exclude" => {
                let [path, v] = args else {
                    return Err("usage: exclude module/path v1.2.3".to_string());
                };
                self.excludes
                    .push(ModuleCoordinate::new(path.clone(), parse_version(v)?));
            }
            "replace" => self.replaces.push(parse_replace(args)?),
            "retract" => {
                if args.is_empty() {
                    return Err("usage: retract version".to_string());
                }
                self.retracts.push(args.join(" "));
            }
            "godebug" | "tool" | "ignore" => {
                if args.is_empty() {
                    return Err(format!("usage: {verb} argument"));
                }
                let args: Vec<String> = args.iter().map(|a| quote(a.as_str())).collect();
                self.other.push(format!("{verb} {}", args.join(" ")));
            }
            _ => return Err(format!("unknown directive: {verb}")),
        }
        Ok(())
    }

    /// The module's own path, if declared.
    pub fn module_path(&self) -> Option<&str> {
        self.module.as_deref()
    }

    /// Paths of every requirement, in declaration order.
    pub fn require_paths(&self) -> Vec<String> {
        self.requires.iter().map(|r| r.path.clone()).collect()
    }

    /// Returns the replacement that applies to `require`, if any.
    ///
    /// A version-specific replacement takes precedence over a wildcard one.
    pub fn replacement_for(&self, require: &Require) -> Option<&ReplaceTarget> {
        let mut wildcard = None;
        for replace in &self.replaces {
            if replace.old.path != require.path {
                continue;
            }
            match &replace.old.version {
                Some(v) if *v == require.version => return Some(&replace.new),
                Some(_) => {}
                None => wildcard = wildcard.or(Some(&replace.new)),
            }
        }
        wildcard
    }

    /// Adds a requirement, or updates the version of an existing one.
    pub fn add_require(&mut self, path: impl Into<String>, version: impl Into<ModuleVersion>) {
        let path = path.into();
        let version = version.into();
        if let Some(existing) = self.requires.iter_mut().find(|r| r.path == path) {
            existing.version = version;
            return;
        }
        self.requires.push(Require {
            path,
            version,
            indirect: false,
        });
    }

    /// Overwrites every requirement version that has an entry in `versions`.
    ///
    /// Requirements without an entry keep their declared version. Returns the
    /// number of requirements whose version changed.
    pub fn set_require_versions(&mut self, versions: &VersionMap) -> usize {
        let mut changed = 0;
        for require in &mut self.requires {
            if let Some(unified) = versions.get(&require.path) {
                if *unified != require.version {
                    require.version = unified.clone();
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Renders the manifest in canonical form.
    pub fn format(&self) -> String {
        self.to_string()
    }
}

fn write_section(f: &mut fmt::Formatter<'_>, verb: &str, lines: &[String]) -> fmt::Result {
    match lines {
        [] => Ok(()),
        [single] => writeln!(f, "\n{verb} {single}"),
        _ => {
            writeln!(f, "\n{verb} (")?;
            for line in lines {
                writeln!(f, "\t{line}")?;
            }
            writeln!(f, ")")
        }
    }
}

impl fmt::Display for ModFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(module) = &self.module {
            writeln!(f, "module {}", quote(module))?;
        }

        if self.go.is_some() || self.toolchain.is_some() {
            writeln!(f)?;
            if let Some(go) = &self.go {
                writeln!(f, "go {go}")?;
            }
            if let Some(toolchain) = &self.toolchain {
                writeln!(f, "toolchain {toolchain}")?;
            }
        }

        if !self.other.is_empty() {
            writeln!(f)?;
            for line in &self.other {
                writeln!(f, "{line}")?;
            }
        }

        let requires: Vec<String> = self
            .requires
            .iter()
            .map(|r| {
                let mut line = format!("{} {}", quote(&r.path), r.version);
                if r.indirect {
                    line.push_str(" // indirect");
                }
                line
            })
            .collect();
        write_section(f, "require", &requires)?;

        let excludes: Vec<String> = self
            .excludes
            .iter()
            .map(|e| format!("{} {}", quote(&e.path), e.version))
            .collect();
        write_section(f, "exclude", &excludes)?;

        let replaces: Vec<String> = self
            .replaces
            .iter()
            .map(|r| format!("{} => {}", r.old, r.new))
            .collect();
        write_section(f, "replace", &replaces)?;

        write_section(f, "retract", &self.retracts)
    }
}
