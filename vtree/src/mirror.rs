//! This module provides sparse mirroring features.
//!
//! A mirror reproduces the layout and file sizes of a source tree (or of a manifest describing one) under a target root, every file
//! being a sparse placeholder of the same logical size.

use std::collections::HashSet;
use std::num::NonZeroU8;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::{fs, io};

use crate::manifest::{self, Entry};
use crate::sparse;
use crate::task::{self, BatchError, DEFAULT_POOL_SIZE};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] manifest::Error),
    #[error("source root `{}` is not a directory", .0.display())]
    SourceNotDir(PathBuf),
    #[error("target root `{}` already exists", .0.display())]
    TargetExists(PathBuf),
    #[error("failed to walk `{}`", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create directory `{}`", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Batch(#[from] BatchError<sparse::Error>),
}

/// A sparse mirror of files rooted at a target directory.
#[derive(Debug, Clone)]
pub struct Mirror {
    target_root: PathBuf,
    workers: NonZeroU8,
}

impl Mirror {
    pub fn new(target_root: impl Into<PathBuf>) -> Self {
        Self {
            target_root: target_root.into(),
            workers: DEFAULT_POOL_SIZE,
        }
    }

    /// Use `workers` concurrent workers to create files.
    #[inline]
    pub fn with_workers(self, workers: NonZeroU8) -> Self {
        Self { workers, ..self }
    }

    #[inline]
    pub fn target_root(&self) -> &Path {
        self.target_root.as_path()
    }

    /// Create a sparse file under the target root for every entry.
    ///
    /// Parent directories are created upfront, one at a time, before any file is. Files are then created concurrently; on the first
    /// failure, remaining files are not created. Every file whose creation failed is removed, even when several fail at once, while
    /// files created successfully are kept and existing files are never overwritten.
    ///
    /// Returns the number of created files.
    pub async fn mirror_entries(&self, entries: impl IntoIterator<Item = Entry>) -> Result<usize, Error> {
        let mut dirs = HashSet::new();
        let mut files = vec![];

        for entry in entries {
            let path = self.target_root.join(&entry.path);

            if let Some(dir) = path.parent() {
                if dirs.insert(dir.to_path_buf()) {
                    fs::create_dir_all(dir).await.map_err(|source| Error::CreateDir {
                        path: dir.to_path_buf(),
                        source,
                    })?;
                }
            }

            files.push((path, entry.size));
        }

        let count = files.len();

        tracing::debug!(
            "Creating {count} sparse files in {} directories under `{}`...",
            dirs.len(),
            self.target_root.display()
        );

        let tasks = files.into_iter().map(|(path, size)| async move {
            discard_failed(sparse::materialize(&path, size).await).await?;
            tracing::debug!("Created sparse file: `{}` ({size} bytes)", path.display());
            Ok::<_, sparse::Error>(())
        });

        task::run_batch(self.workers, tasks).await?;

        tracing::info!("Created {count} sparse files under `{}`.", self.target_root.display());

        Ok(count)
    }

    /// Mirror every file listed in the manifest at `manifest_path`.
    pub async fn mirror_manifest(&self, manifest_path: impl AsRef<Path>) -> Result<usize, Error> {
        let entries = manifest::read(manifest_path).await?;

        self.mirror_entries(entries).await
    }

    /// Mirror every regular file found under `source_root`.
    ///
    /// The target root must not exist yet.
    pub async fn mirror_tree(&self, source_root: impl AsRef<Path>) -> Result<usize, Error> {
        let source_root = source_root.as_ref();

        if !fs::metadata(source_root).await.is_ok_and(|metadata| metadata.is_dir()) {
            return Err(Error::SourceNotDir(source_root.to_path_buf()));
        }

        if fs::try_exists(&self.target_root).await.unwrap_or(true) {
            return Err(Error::TargetExists(self.target_root.clone()));
        }

        let entries = walk_tree(source_root).await?;

        self.mirror_entries(entries).await
    }
}

/// Collect every regular file under `root` with its size, relative to `root`.
///
/// Symbolic links are not followed.
async fn walk_tree(root: &Path) -> Result<Vec<Entry>, Error> {
    let walk_error = |path: &Path, source| Error::Walk {
        path: path.to_path_buf(),
        source,
    };

    let mut entries = vec![];
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut read_dir = fs::read_dir(&dir).await.map_err(|err| walk_error(&dir, err))?;

        while let Some(entry) = read_dir.next_entry().await.map_err(|err| walk_error(&dir, err))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|err| walk_error(&path, err))?;

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let size = entry.metadata().await.map_err(|err| walk_error(&path, err))?.len();

                // `path` has been built by joining names onto `root`
                let Ok(relative) = path.strip_prefix(root) else {
                    unreachable!("`{}` is not under `{}`", path.display(), root.display());
                };

                entries.push(Entry {
                    path: relative.to_path_buf(),
                    size,
                });
            } else {
                tracing::trace!("Skipping non regular file: `{}`", path.display());
            }
        }
    }

    entries.sort_unstable_by(|a, b| a.path.cmp(&b.path));

    tracing::debug!("Found {} files under `{}`.", entries.len(), root.display());

    Ok(entries)
}

/// Remove the partial file left behind by a failed materialization.
///
/// A colliding file was not created by this mirror and is left untouched.
async fn discard_failed(result: Result<(), sparse::Error>) -> Result<(), sparse::Error> {
    if let Err(ref err) = result {
        if err.io_kind() != io::ErrorKind::AlreadyExists {
            try_unlink(err.path()).await;
        }
    }

    result
}

/// Remove the file at `path`, if any.
async fn try_unlink(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed partially created file: `{}`", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("Failed to remove partially created file `{}`: {err}", path.display()),
    }
}
