//! This module provides manifest parsing features.
//!
//! A manifest lists one file per line as `<size> <path>`, where `size` is a byte count and `path` a `/`-separated path relative to the
//! mirrored root, eg. as produced by `rclone ls`:
//!
//! ```text
//!      1048576 photos/2024/a.jpg
//!            3 notes.txt
//! ```

use std::num::ParseIntError;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::{fs, io};

/// A file to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the mirrored root, using the platform separator.
    pub path: PathBuf,
    /// Logical size in bytes.
    pub size: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing path after size")]
    MissingPath,
    #[error("invalid size")]
    InvalidSize(#[source] ParseIntError),
    #[error("path `{0}` is absolute")]
    AbsolutePath(String),
    #[error("path `{0}` escapes the target root")]
    ParentComponent(String),
    #[error("path is empty")]
    EmptyPath,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read manifest `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid manifest `{}` at line {line}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: ParseError,
    },
}

/// Parse a single manifest line.
///
/// Surrounding whitespace is ignored and blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Entry>, ParseError> {
    let line = line.trim();

    if line.is_empty() {
        return Ok(None);
    }

    let (size, raw) = line.split_once(' ').ok_or(ParseError::MissingPath)?;
    let size = size.parse().map_err(ParseError::InvalidSize)?;

    if raw.starts_with('/') {
        return Err(ParseError::AbsolutePath(raw.to_owned()));
    }

    let mut path = PathBuf::new();

    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(ParseError::ParentComponent(raw.to_owned())),
            segment => path.push(segment),
        }
    }

    if path.as_os_str().is_empty() {
        return Err(ParseError::EmptyPath);
    }

    // eg. a drive prefix on Windows
    if path.has_root() || path.is_absolute() {
        return Err(ParseError::AbsolutePath(raw.to_owned()));
    }

    Ok(Some(Entry { path, size }))
}

/// Read every entry of the manifest at `path`.
pub async fn read(path: impl AsRef<Path>) -> Result<Vec<Entry>, Error> {
    use io::AsyncBufReadExt;

    let path = path.as_ref();
    let io_error = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };

    tracing::debug!("Reading manifest: `{}`", path.display());

    let file = fs::File::open(path).await.map_err(io_error)?;
    let mut lines = io::BufReader::new(file).lines();

    let mut entries = vec![];
    let mut line = 0;

    while let Some(content) = lines.next_line().await.map_err(io_error)? {
        line += 1;

        match parse_line(&content) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => tracing::trace!("Skipping blank manifest line {line}."),
            Err(source) => {
                return Err(Error::Parse {
                    path: path.to_path_buf(),
                    line,
                    source,
                })
            }
        }
    }

    tracing::debug!("Read {} manifest entries from `{}`.", entries.len(), path.display());

    Ok(entries)
}
