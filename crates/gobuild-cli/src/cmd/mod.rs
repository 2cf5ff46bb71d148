//! Command implementations

pub mod build;
pub mod cache;
pub mod fmt_mod;
pub mod generate;
pub mod gocacheprog;

use gobuild_core::BuildEnv;

/// The derivation environment, with `--jobs` taking precedence over `NIX_BUILD_CORES`.
pub fn build_env(jobs: Option<usize>) -> BuildEnv {
    let mut env = BuildEnv::from_env();
    if let Some(jobs) = jobs {
        env.workers = jobs.max(1);
    }
    env
}
