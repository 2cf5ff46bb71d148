//! Module-proxy directory conventions.
//!
//! A proxy cache stores module `M` at version `V` under
//! `cache/download/<escape(M)>/@v/V.{info,mod,zip}`, where upper-case letters
//! in `M` are written as `!` followed by the lower-case letter so the layout
//! survives case-insensitive filesystems.

use crate::coordinate::ModuleCoordinate;
use std::path::{Component, Path};

/// Directory, relative to a module cache root, holding the proxy layout.
pub const DOWNLOAD_DIR: &str = "cache/download";

/// Directory component that separates the escaped module path from version files.
pub const VERSION_DIR: &str = "@v";

/// Escapes a module path for use in a proxy directory name.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverses [`escape_path`].
///
/// Returns `None` for text that could not have been produced by escaping: a
/// trailing `!`, `!` followed by anything but a lower-case letter, or a bare
/// upper-case letter.
pub fn unescape_path(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            '!' => match chars.next() {
                Some(next) if next.is_ascii_lowercase() => out.push(next.to_ascii_uppercase()),
                _ => return None,
            },
            c if c.is_ascii_uppercase() => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

/// Returns true if `root` looks like a module-proxy directory.
pub fn is_proxy_dir(root: &Path) -> bool {
    root.join(DOWNLOAD_DIR).is_dir()
}

/// Recognises `<escaped module path>/@v/<version>.mod` relative to a
/// `cache/download` directory and returns the module coordinate it encodes.
pub fn coordinate_from_mod_path(relative: &Path) -> Option<ModuleCoordinate> {
    let file_name = relative.file_name()?.to_str()?;
    let version = file_name.strip_suffix(".mod")?;
    if version.is_empty() {
        return None;
    }

    let version_dir = relative.parent()?;
    if version_dir.file_name()?.to_str()? != VERSION_DIR {
        return None;
    }
    let module_dir = version_dir.parent()?;
    let escaped = join_components(module_dir)?;
    if escaped.is_empty() {
        return None;
    }

    Some(ModuleCoordinate::new(unescape_path(&escaped)?, version))
}

/// Like [`coordinate_from_mod_path`], but for a path relative to a module
/// cache root, i.e. one that still starts with `cache/download/`.
pub fn coordinate_from_cache_path(relative: &Path) -> Option<ModuleCoordinate> {
    let rest = relative.strip_prefix(DOWNLOAD_DIR).ok()?;
    coordinate_from_mod_path(rest)
}

/// Recovers the module path from the directory that contains an `@v` list.
pub fn module_path_from_dir(relative: &Path) -> Option<String> {
    unescape_path(&join_components(relative)?)
}

fn join_components(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
