//! Strict flat merge of overlapping directory trees.
//!
//! Unlike [`super::link::link_recursive`], nothing is resolved silently: a
//! name that is a directory in one source and something else in another is
//! an error listing every candidate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::MergeError;

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    is_dir: bool,
}

/// Links the union of `sources` into `target`.
///
/// Names found in a single source, or only as non-directories, become one
/// symlink to the first source providing them. Names that are directories in
/// every source providing them are recreated and merged recursively.
pub fn link_recursive_flat(target: &Path, sources: &[PathBuf]) -> Result<(), MergeError> {
    let mut work = vec![(target.to_path_buf(), sources.to_vec())];

    while let Some((target, inputs)) = work.pop() {
        std::fs::create_dir_all(&target).map_err(|e| MergeError::io(&target, e))?;

        let mut found: BTreeMap<std::ffi::OsString, Vec<Candidate>> = BTreeMap::new();
        for input in &inputs {
            let entries = std::fs::read_dir(input).map_err(|e| MergeError::io(input, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| MergeError::io(input, e))?;
                let path = entry.path();
                let is_dir = entry
                    .file_type()
                    .map_err(|e| MergeError::io(&path, e))?
                    .is_dir();
                found
                    .entry(entry.file_name())
                    .or_default()
                    .push(Candidate { path, is_dir });
            }
        }

        for (name, candidates) in found {
            let to = target.join(&name);

            if candidates.len() > 1 {
                let dirs = candidates.iter().filter(|c| c.is_dir).count();
                if dirs == candidates.len() {
                    work.push((to, candidates.into_iter().map(|c| c.path).collect()));
                    continue;
                }
                if dirs > 0 {
                    let mut listing = String::new();
                    for candidate in &candidates {
                        listing.push_str(&format!("- {} ({})\n", candidate.path.display(), candidate.is_dir));
                    }
                    return Err(MergeError::Conflict { target: to, listing });
                }
            }

            let from = &candidates[0].path;
            std::os::unix::fs::symlink(from, &to).map_err(|e| MergeError::io(&to, e))?;
        }
    }

    Ok(())
}
