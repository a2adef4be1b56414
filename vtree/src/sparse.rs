//! This module provides sparse file materialization features.
//!
//! A sparse file is first extended to its logical size by writing zero chunks, then the whole range is declared as a hole so that the
//! filesystem releases the blocks those writes nominally occupied.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use thiserror::Error;

/// Number of chunks in the table, from `2^(CHUNK_POWERS - 1)` down to `2^0` bytes.
const CHUNK_POWERS: u32 = 24;

static SPARSE_CHUNKS: LazyLock<ChunkTable> = LazyLock::new(ChunkTable::new);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to materialize `{}` ({size} bytes)", path.display())]
    Io {
        path: PathBuf,
        size: u64,
        #[source]
        source: io::Error,
    },
    #[error("sparse holes are not supported for `{}` ({size} bytes)", path.display())]
    SparseUnsupported {
        path: PathBuf,
        size: u64,
        #[source]
        source: io::Error,
    },
}

impl Error {
    fn io(path: &Path, size: u64, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            size,
            source,
        }
    }

    fn hole(path: &Path, size: u64, source: io::Error) -> Self {
        if is_unsupported(&source) {
            Self::SparseUnsupported {
                path: path.to_path_buf(),
                size,
                source,
            }
        } else {
            Self::io(path, size, source)
        }
    }

    /// The path of the file that could not be materialized.
    #[inline]
    pub fn path(&self) -> &Path {
        match self {
            Self::Io { path, .. } | Self::SparseUnsupported { path, .. } => path,
        }
    }

    /// The logical size that was requested for the file.
    #[inline]
    pub fn size(&self) -> u64 {
        match self {
            Self::Io { size, .. } | Self::SparseUnsupported { size, .. } => *size,
        }
    }

    /// The kind of the underlying I/O error.
    #[inline]
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Io { source, .. } | Self::SparseUnsupported { source, .. } => source.kind(),
        }
    }

    /// Whether only the hole declaration failed because the platform or filesystem lacks support for it.
    ///
    /// The file then has its correct logical size but occupies real storage.
    #[inline]
    pub fn is_sparse_unsupported(&self) -> bool {
        matches!(self, Self::SparseUnsupported { .. })
    }
}

/// An immutable table of zero-filled chunks of strictly decreasing power-of-two sizes.
///
/// Every chunk is only ever read, so a single table is shared by all workers without locking.
#[derive(Debug)]
pub struct ChunkTable {
    chunks: Vec<Box<[u8]>>,
}

impl ChunkTable {
    fn new() -> Self {
        Self {
            chunks: (0..CHUNK_POWERS).rev().map(|power| vec![0; 1 << power].into_boxed_slice()).collect(),
        }
    }

    /// The process-wide table, built on first use.
    #[inline]
    pub fn global() -> &'static ChunkTable {
        &SPARSE_CHUNKS
    }

    /// Chunk lengths, from the largest to the smallest.
    pub fn lengths(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks.iter().map(|chunk| chunk.len())
    }

    /// Greedily decompose `size` into chunks, largest first.
    ///
    /// Each chunk but the largest one is yielded at most once, so any `size` below twice the largest chunk needs at most one write per
    /// chunk of the table.
    pub fn decompose(&self, size: u64) -> impl Iterator<Item = &[u8]> + '_ {
        let mut remaining = size;

        self.chunks.iter().flat_map(move |chunk| {
            let len = chunk.len() as u64;
            let count = remaining / len;
            remaining %= len;

            std::iter::repeat(&chunk[..]).take(count as usize)
        })
    }

    /// Create a new file at `path` with a logical length of `size` zero bytes and (almost) no allocated storage.
    ///
    /// The parent directory must already exist, and `path` must not: an existing file is reported as a failure rather than overwritten.
    /// A failed attempt may leave a partially written file behind, removing it is up to the caller.
    ///
    /// This performs blocking I/O, see [`materialize()`] for asynchronous contexts.
    pub fn create(&self, path: &Path, size: u64) -> Result<(), Error> {
        use std::io::Write;

        tracing::trace!("Materializing sparse file: `{}` ({size} bytes)", path.display());

        let mut file = std::fs::File::options()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| Error::io(path, size, err))?;

        for chunk in self.decompose(size) {
            file.write_all(chunk).map_err(|err| Error::io(path, size, err))?;
        }

        punch_hole(&file, size).map_err(|err| Error::hole(path, size, err))
    }
}

/// Create a sparse file at `path` using the process-wide [`ChunkTable`], on the blocking thread pool.
///
/// See [`ChunkTable::create()`].
pub async fn materialize(path: impl AsRef<Path>, size: u64) -> Result<(), Error> {
    let path = path.as_ref();
    let owned = path.to_path_buf();

    tokio::task::spawn_blocking(move || ChunkTable::global().create(&owned, size))
        .await
        .map_err(|err| Error::io(path, size, io::Error::other(err)))?
}

/// Whether `err` reports hole punching as unavailable on the file's filesystem.
fn is_unsupported(err: &io::Error) -> bool {
    #[cfg(target_os = "linux")]
    if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
        return true;
    }

    err.kind() == io::ErrorKind::Unsupported
}

/// Declare `[0, size)` as a hole, keeping the logical file size untouched.
#[cfg(target_os = "linux")]
fn punch_hole(file: &std::fs::File, size: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    if size == 0 {
        return Ok(());
    }

    let len = libc::off_t::try_from(size).map_err(|_| io::ErrorKind::InvalidInput)?;

    // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE, 0, len) };

    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &std::fs::File, size: u64) -> io::Result<()> {
    if size == 0 {
        Ok(())
    } else {
        Err(io::ErrorKind::Unsupported.into())
    }
}
