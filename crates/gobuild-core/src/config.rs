//! Explicit configuration records.
//!
//! Nothing here reads the process environment except the `from_env`
//! constructors, which the binary calls once at startup.

use anyhow::{Context, Result, bail};
use gobuild_schema::proxy::{DOWNLOAD_DIR, is_proxy_dir};
use std::path::PathBuf;

use crate::{DEFAULT_BUILD_WORKERS, DEFAULT_RESOLVE_WORKERS};

/// Lock generation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Concurrent fetches.
    pub workers: usize,
    /// Nix expression for the package set used to prefetch modules.
    pub nixpkgs: String,
    /// Attribute of the Go toolchain inside that package set.
    pub go_attr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_RESOLVE_WORKERS,
            nixpkgs: "<nixpkgs>".to_string(),
            go_attr: "go".to_string(),
        }
    }
}

/// The build-time environment a derivation hands to the build phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnv {
    /// `src`: either a local source tree or a module proxy.
    pub src: Option<PathBuf>,
    /// `srcs`: module proxies built by this derivation.
    pub srcs: Vec<PathBuf>,
    /// `out`: the output path.
    pub out: Option<PathBuf>,
    /// `NIX_GOBUILD_MODCACHE`: caches from dependency derivations.
    pub modcaches: Vec<PathBuf>,
    /// `goBuildPackages`: explicit packages to build.
    pub build_packages: Option<Vec<String>>,
    pub build_flags: Vec<String>,
    /// `goInstallPackages`: explicit packages to install.
    pub install_packages: Option<Vec<String>>,
    pub install_flags: Vec<String>,
    pub workers: usize,
}

fn fields(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

impl BuildEnv {
    /// Reads the build environment of the current process.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the record from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workers = lookup("NIX_BUILD_CORES")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map_or(DEFAULT_BUILD_WORKERS, |cores| {
                // Nix uses 0 for "all available cores".
                if cores == 0 {
                    std::thread::available_parallelism().map_or(DEFAULT_BUILD_WORKERS, usize::from)
                } else {
                    cores
                }
            });

        Self {
            src: lookup("src").map(PathBuf::from),
            srcs: lookup("srcs")
                .map(|v| v.split_whitespace().map(PathBuf::from).collect())
                .unwrap_or_default(),
            out: lookup("out").map(PathBuf::from),
            modcaches: lookup("NIX_GOBUILD_MODCACHE")
                .map(|v| {
                    v.split(':')
                        .filter(|dir| !dir.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
            build_packages: lookup("goBuildPackages").map(|v| fields(&v)),
            build_flags: lookup("goBuildFlags").map(|v| fields(&v)).unwrap_or_default(),
            install_packages: lookup("goInstallPackages").map(|v| fields(&v)),
            install_flags: lookup("goInstallFlags")
                .map(|v| fields(&v))
                .unwrap_or_default(),
            workers,
        }
    }

    /// Module proxies produced by this derivation's own sources.
    ///
    /// `src` counts when it is a proxy. Every `srcs` entry must be one, and
    /// the two may not both supply proxies.
    pub fn proxy_srcs(&self) -> Result<Vec<PathBuf>> {
        let mut proxies = Vec::new();
        if let Some(src) = self.src.as_ref().filter(|src| is_proxy_dir(src)) {
            proxies.push(src.clone());
        }

        if !self.srcs.is_empty() {
            if !proxies.is_empty() {
                bail!("environment variables 'src' & 'srcs' are mutually exclusive");
            }
            for dir in &self.srcs {
                if !is_proxy_dir(dir) {
                    bail!(
                        "srcs directory '{}' is not a Go module cache directory, bailing out",
                        dir.display()
                    );
                }
                proxies.push(dir.clone());
            }
        }

        Ok(proxies)
    }

    /// Own proxies followed by dependency caches.
    pub fn modcache_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = self.proxy_srcs()?;
        dirs.extend(self.modcaches.iter().cloned());
        Ok(dirs)
    }

    /// `cache/download` directories of the own proxies.
    pub fn src_download_dirs(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .proxy_srcs()?
            .into_iter()
            .map(|dir| dir.join(DOWNLOAD_DIR))
            .collect())
    }

    /// The local source tree, when `src` is one rather than a proxy.
    pub fn local_src(&self) -> Option<&PathBuf> {
        self.src
            .as_ref()
            .filter(|src| src.join("go.mod").is_file() || src.join("go.work").is_file())
    }

    pub fn out(&self) -> Result<&PathBuf> {
        match &self.out {
            Some(out) => Ok(out),
            None => bail!("No 'out' environment variable set"),
        }
    }
}

/// Settings of the `GOCACHEPROG` build-cache helper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// `NIX_GOBUILD_CACHE`: read-only caches from dependency derivations.
    pub inputs: Vec<PathBuf>,
    /// `NIX_GOBUILD_CACHE_OUT`: where new entries are written.
    pub out: Option<PathBuf>,
    /// `SOURCE_DATE_EPOCH` in nanoseconds, stamped on every new entry.
    pub time_nanos: Option<i64>,
    /// `NIX_GOBUILD_CACHE_VERBOSE`: log every request.
    pub verbose: bool,
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let inputs = lookup("NIX_GOBUILD_CACHE")
            .map(|v| {
                v.split(':')
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let time_nanos = match lookup("SOURCE_DATE_EPOCH").filter(|v| !v.is_empty()) {
            Some(epoch) => {
                let seconds: i64 = epoch
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid SOURCE_DATE_EPOCH '{epoch}'"))?;
                match seconds.checked_mul(1_000_000_000) {
                    Some(nanos) => Some(nanos),
                    None => bail!("SOURCE_DATE_EPOCH '{epoch}' is out of range"),
                }
            }
            None => None,
        };

        let verbose = match lookup("NIX_GOBUILD_CACHE_VERBOSE").filter(|v| !v.is_empty()) {
            Some(level) => {
                level
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("invalid NIX_GOBUILD_CACHE_VERBOSE '{level}'"))?
                    > 0
            }
            None => false,
        };

        Ok(Self {
            inputs,
            out: lookup("NIX_GOBUILD_CACHE_OUT")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            time_nanos,
            verbose,
        })
    }

    /// Directories searched on lookup: the inputs, then the output.
    pub fn lookup_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.inputs.clone();
        if let Some(out) = self.out.as_ref().filter(|out| !dirs.contains(out)) {
            dirs.push(out.clone());
        }
        dirs
    }
}
