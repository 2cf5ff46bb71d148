//! Manifest formatting

use anyhow::{Context, Result};
use gobuild_schema::ModFile;
use std::io::Read;
use std::path::Path;

/// Print `file` (or stdin) in canonical go.mod form.
pub fn fmt_mod(file: Option<&Path>) -> Result<()> {
    let (name, contents) = match file {
        Some(path) => (
            path.display().to_string(),
            std::fs::read_to_string(path)
                .with_context(|| format!("error reading {}", path.display()))?,
        ),
        None => {
            let mut contents = String::new();
            std::io::stdin()
                .read_to_string(&mut contents)
                .context("error reading stdin")?;
            ("<stdin>".to_string(), contents)
        }
    };

    let manifest = ModFile::parse(&name, &contents)?;
    print!("{manifest}");
    Ok(())
}
