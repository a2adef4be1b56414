//! A crate mirroring file trees as sparse placeholder files.
//!
//! A mirror reproduces the layout and logical file sizes of a tree under another root without consuming the matching disk space, eg. to
//! let tools browse, index or plan the transfer of a remote or archived tree. It provides features dedicated to:
//! - materializing sparse files of any logical size,
//! - running batches of fallible tasks across a fixed number of workers, stopping at the first failure,
//! - reading manifests of `<size> <path>` lines,
//! - mirroring manifests and local directory trees.
//!
//! Sparse files are materialized by extending each file to its logical size with a few writes of shared zero chunks (one per power of
//! two at most, largest first), then declaring its whole range as a hole. Only the hole declaration releases the nominally written
//! blocks, so a filesystem without hole support still ends up with a file of the right logical size, reported as a distinct failure.
//!
//! Batches are fail-fast: once a task fails, queued tasks are discarded without being executed, in-flight tasks are left to complete,
//! and the first failure is reported only when every worker has stopped. Nothing created before the failure is rolled back, cleaning up
//! is up to the caller:
//!
//! ```text
//!     submit ──> [ queue ] ──> worker 0 ──> materialize ──> ok
//!                          ──> worker 1 ──> materialize ──> failure ──> cancel, discard queued tasks
//!                          ──> ...
//!     stop   ──> close queue, join workers ──> first failure or success
//! ```

pub mod config;
pub mod manifest;
pub mod mirror;
pub mod sparse;
pub mod task;
