//! gobuild-nix CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gobuild_cli::cmd;
use gobuild_cli::{Cli, Commands};
use gobuild_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout is reserved for command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let resolve_workers = cli.resolve_workers();

    match cli.command {
        Commands::Generate {
            dir,
            nixpkgs,
            go_attr,
            lock_file,
        } => {
            let config = Config {
                workers: resolve_workers,
                nixpkgs,
                go_attr,
            };
            cmd::generate::generate(&dir, &config, lock_file).await
        }
        Commands::Unpack { root } => cmd::build::unpack(&root, &cmd::build_env(cli.jobs)).await,
        Commands::Build { dir } => cmd::build::build(&dir, &cmd::build_env(cli.jobs)).await,
        Commands::Install { dir } => cmd::build::install(&dir, &cmd::build_env(cli.jobs)).await,
        Commands::SetupHook => cmd::build::setup_hook(&cmd::build_env(cli.jobs)).await,
        Commands::MergeCache {
            target,
            manifest,
            sources,
        } => {
            let workers = cmd::build_env(cli.jobs).workers;
            cmd::cache::merge_cache(&target, &sources, manifest.as_deref(), workers).await
        }
        Commands::ProxyOutput {
            out,
            proxy,
            sources,
        } => {
            let workers = cmd::build_env(cli.jobs).workers;
            cmd::cache::proxy_output(&out, &sources, &proxy, workers).await
        }
        Commands::Gocacheprog => cmd::gocacheprog::gocacheprog().await,
        Commands::FmtMod { file } => cmd::fmt_mod::fmt_mod(file.as_deref()),
    }
}
