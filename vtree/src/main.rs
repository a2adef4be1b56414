//! vtree - sparse file tree mirroring
//!
//! Entry point for the CLI application.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vtree::config::{CliArgs, MirrorConfig, Source};
use vtree::mirror::Mirror;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose);

    let config = MirrorConfig::from_args(args).context("Invalid configuration")?;

    info!(
        "Mirroring into `{}` with {} workers",
        config.target.display(),
        config.workers
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    let count = runtime.block_on(async {
        let mirror = Mirror::new(&config.target).with_workers(config.workers);

        match config.source {
            Source::Manifest(ref manifest) => mirror
                .mirror_manifest(manifest)
                .await
                .with_context(|| format!("Failed to mirror manifest `{}`", manifest.display())),
            Source::Tree(ref source) => mirror
                .mirror_tree(source)
                .await
                .with_context(|| format!("Failed to mirror tree `{}`", source.display())),
        }
    })?;

    info!("Mirrored {count} files into `{}`", config.target.display());

    Ok(())
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("vtree=debug,warn")
    } else {
        EnvFilter::new("vtree=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
