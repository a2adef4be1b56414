//! Command line configuration.

use std::num::NonZeroU8;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::task::DEFAULT_POOL_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("manifest `{}` is not a file", .0.display())]
    ManifestNotFile(PathBuf),
    #[error("source `{}` is not a directory", .0.display())]
    SourceNotDir(PathBuf),
}

/// Mirror a file tree as sparse placeholder files
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vtree",
    version,
    about = "Mirror a file tree as sparse placeholder files",
    long_about = "Recreates the layout and file sizes of a tree under a new root, every file being a sparse file of the same \
                  logical size that uses (almost) no disk space.",
    after_help = "EXAMPLES:\n    \
        rclone ls remote:photos > photos.txt\n    \
        vtree manifest photos.txt ./photos-mirror\n    \
        vtree tree /mnt/archive ./archive-mirror -w 32"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Number of concurrent workers creating files
    #[arg(short = 'w', long, global = true, default_value_t = DEFAULT_POOL_SIZE, value_name = "NUM")]
    pub workers: NonZeroU8,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Mirror the files listed in a manifest of `<size> <path>` lines
    Manifest {
        /// Manifest file, eg. the output of `rclone ls`
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,

        /// Directory to create the files under
        #[arg(value_name = "TARGET")]
        target: PathBuf,
    },
    /// Mirror every file of a local directory tree
    Tree {
        /// Directory to mirror
        #[arg(value_name = "SOURCE")]
        source: PathBuf,

        /// Directory to create, must not exist
        #[arg(value_name = "TARGET")]
        target: PathBuf,
    },
}

/// Where mirrored file paths and sizes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Manifest(PathBuf),
    Tree(PathBuf),
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub source: Source,
    pub target: PathBuf,
    pub workers: NonZeroU8,
    pub verbose: bool,
}

impl MirrorConfig {
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let (source, target) = match args.command {
            Command::Manifest { manifest, target } => {
                if !manifest.is_file() {
                    return Err(ConfigError::ManifestNotFile(manifest));
                }
                (Source::Manifest(manifest), target)
            }
            Command::Tree { source, target } => {
                if !source.is_dir() {
                    return Err(ConfigError::SourceNotDir(source));
                }
                (Source::Tree(source), target)
            }
        };

        Ok(Self {
            source,
            target,
            workers: args.workers,
            verbose: args.verbose,
        })
    }
}
