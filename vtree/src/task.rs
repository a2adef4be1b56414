//! This module provides fail-fast task pooling features.

use std::num::NonZeroU8;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};

use futures::future::{self, BoxFuture, Future, FutureExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Default number of workers, suited to I/O-bound filesystem tasks.
pub const DEFAULT_POOL_SIZE: NonZeroU8 = match NonZeroU8::new(12) {
    Some(size) => size,
    None => unreachable!(),
};

type Task<E> = BoxFuture<'static, Result<(), E>>;

/// The failure reported for a whole batch.
///
/// Exactly one failure is reported even when several tasks fail concurrently, and only once every other task of the batch has either
/// completed or been discarded.
#[derive(Debug, Error)]
pub enum BatchError<E> {
    #[error(transparent)]
    Task(E),
    #[error("worker {worker} panicked while executing a task")]
    Panicked { worker: usize },
    #[error(transparent)]
    Worker(#[from] tokio::task::JoinError),
}

/// Task counters of a batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    /// Tasks executed successfully.
    pub completed: usize,
    /// Tasks executed unsuccessfully (or that panicked).
    pub failed: usize,
    /// Tasks dequeued without being executed because the batch had been cancelled.
    pub discarded: usize,
}

/// State shared between a pool and its workers for the current batch.
#[derive(Debug)]
struct Batch<E> {
    /// Enqueued tasks not yet acknowledged by any worker.
    outstanding: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    discarded: AtomicUsize,
    /// Raised by the first failure, never lowered for the rest of the batch.
    cancelled: AtomicBool,
    failure: std::sync::Mutex<Option<BatchError<E>>>,
}

impl<E> Default for Batch<E> {
    fn default() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            failure: std::sync::Mutex::new(None),
        }
    }
}

impl<E: std::fmt::Display> Batch<E> {
    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Lock the failure slot, which is only ever replaced as a whole and so stays consistent even after a panic.
    #[inline]
    fn failure(&self) -> MutexGuard<'_, Option<BatchError<E>>> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn acknowledge(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record `error` as the batch failure unless one has already been recorded, then cancel the batch.
    ///
    /// Returns whether `error` is the one reported.
    fn fail(&self, worker: usize, error: BatchError<E>) -> bool {
        let mut failure = self.failure();

        let first = failure.is_none();

        if first {
            tracing::debug!("Task failed on worker {worker}, cancelling batch: {error}");
            *failure = Some(error);
        } else {
            tracing::warn!("Task failed on worker {worker} after batch cancellation: {error}");
        }

        self.cancelled.store(true, Ordering::Release);

        drop(failure);
        self.acknowledge(&self.failed);

        first
    }

    fn stats(&self) -> BatchStats {
        BatchStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// A fail-fast pool of workers running one batch of fallible tasks in the background.
///
/// Tasks are pulled from a shared unbounded queue by the next available worker, in no guaranteed order across workers. As soon as one
/// task fails, the batch is cancelled: tasks still queued are discarded without being executed, tasks in flight on other workers run to
/// completion, and further submissions are refused. [`Pool::stop()`] then reports that first failure.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use vtree::task::{BatchError, Pool};
/// let mut pool = Pool::default();
/// pool.start(3.try_into().unwrap());
///
/// for i in 0..=5 {
///     pool.submit(async move {
///         if i == 3 {
///             return Err(std::io::Error::other(format!("task #{i} failed")));
///         }
///         Ok(())
///     });
/// }
///
/// match pool.close().await {
///     Err(BatchError::Task(err)) => assert_eq!(err.to_string(), "task #3 failed"),
///     _ => unreachable!(),
/// }
/// # })
/// ```
#[derive(Debug)]
pub struct Pool<E> {
    /// The pool of workers.
    workers: Vec<Worker>,
    /// The sending part of a channel to push tasks to the workers.
    ///
    /// The next available worker will wait for a task to be received through the channel.
    sender: Option<mpsc::UnboundedSender<Task<E>>>,
    /// The current (or last) batch.
    batch: Arc<Batch<E>>,
}

impl<E> Default for Pool<E> {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            sender: None,
            batch: Arc::default(),
        }
    }
}

impl<E: std::fmt::Display + Send + 'static> Pool<E> {
    /// Start a pool with `size` workers for a new batch.
    ///
    /// Once started, tasks can be submitted and will be processed in the background.
    ///
    /// # Panics
    /// This method panics if the pool is already running, ie. when called more than once without stopping the pool in between.
    pub fn start(&mut self, size: NonZeroU8) {
        assert!(self.sender.is_none() && self.workers.is_empty());

        let (sender, receiver) = mpsc::unbounded_channel();

        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get().into();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        self.batch = Arc::default();
        self.workers = (0..size)
            .map(|i| Worker::new(id.wrapping_add(i), Arc::clone(&receiver), Arc::clone(&self.batch)))
            .collect();
        self.sender = Some(sender);
    }

    /// Submit a task to the current batch.
    ///
    /// Returns `false` when the task has not been enqueued, either because the pool is not running or because the batch has already
    /// been cancelled. The task is then dropped without executing anything.
    pub fn submit(&self, future: impl Future<Output = Result<(), E>> + Send + 'static) -> bool {
        let Some(ref sender) = self.sender else {
            return false;
        };

        if self.batch.is_cancelled() {
            return false;
        }

        self.batch.outstanding.fetch_add(1, Ordering::AcqRel);

        if sender.send(future.boxed()).is_err() {
            // every worker is gone, nothing can be acknowledged anymore
            self.batch.outstanding.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        true
    }

    /// Whether a task of the current batch has failed.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.batch.is_cancelled()
    }

    /// Number of tasks enqueued in the current batch and not yet acknowledged by a worker.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.batch.outstanding.load(Ordering::Acquire)
    }

    /// Task counters of the current (or last) batch.
    #[inline]
    pub fn stats(&self) -> BatchStats {
        self.batch.stats()
    }

    /// Stop current pool of workers, waiting for every submitted task to be either executed or discarded.
    ///
    /// Once stopped, the pool can be started again with any number of workers for a new batch.
    pub async fn stop(&mut self) -> Result<(), BatchError<E>> {
        drop(self.sender.take());
        let workers = std::mem::take(&mut self.workers);

        let results = future::join_all(workers.into_iter().inspect(|worker| {
            tracing::debug!("Stopping worker {}...", worker.id);
        }))
        .await;

        for result in results {
            if let Err(err) = result {
                let mut failure = self.batch.failure();
                if failure.is_none() {
                    *failure = Some(BatchError::Worker(err));
                }
            }
        }

        let stats = self.batch.stats();

        tracing::debug!(
            "Batch drained: {} completed, {} failed, {} discarded, {} outstanding.",
            stats.completed,
            stats.failed,
            stats.discarded,
            self.outstanding()
        );

        match self.batch.failure().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close current pool of workers, waiting for every submitted task to be either executed or discarded.
    ///
    /// Once closed, the pool cannot be used since it is consumed.
    pub async fn close(mut self) -> Result<(), BatchError<E>> {
        self.stop().await
    }
}

/// Run `tasks` as a single batch across `size` workers.
///
/// Returns once every task has either been executed or discarded. Submission stops at the first failure, remaining tasks are dropped
/// without being executed.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use vtree::task::run_batch;
/// let tasks = (0..10).map(|i| async move { Ok::<_, std::io::Error>(println!("Hello from task #{i}!")) });
///
/// run_batch(4.try_into().unwrap(), tasks).await.unwrap();
/// # })
/// ```
pub async fn run_batch<E, I, F>(size: NonZeroU8, tasks: I) -> Result<(), BatchError<E>>
where
    E: std::fmt::Display + Send + 'static,
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<(), E>> + Send + 'static,
{
    let mut pool = Pool::default();
    pool.start(size);

    for task in tasks {
        if !pool.submit(task) {
            tracing::debug!("Batch cancelled, remaining tasks are not submitted.");
            break;
        }
    }

    pool.close().await
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new<E>(id: usize, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Task<E>>>>, batch: Arc<Batch<E>>) -> Worker
    where
        E: std::fmt::Display + Send + 'static,
    {
        tracing::debug!("Starting worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                loop {
                    // read the flag while holding the queue: a task dequeued before a failure is never discarded
                    let message = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await.map(|task| (task, batch.is_cancelled()))
                    };

                    match message {
                        Some((task, true)) => {
                            tracing::trace!("Discarding task on worker {id}.");

                            drop(task);
                            batch.acknowledge(&batch.discarded);
                        }
                        Some((task, false)) => {
                            tracing::trace!("Executing task on worker {id}...");

                            let error = match AssertUnwindSafe(task).catch_unwind().await {
                                Ok(Ok(())) => {
                                    batch.acknowledge(&batch.completed);
                                    continue;
                                }
                                Ok(Err(err)) => BatchError::Task(err),
                                Err(_) => BatchError::Panicked { worker: id },
                            };

                            if batch.fail(id, error) {
                                let mut receiver = receiver.lock().await;
                                let mut count = 0;

                                while let Ok(task) = receiver.try_recv() {
                                    drop(task);
                                    batch.acknowledge(&batch.discarded);
                                    count += 1;
                                }

                                tracing::debug!("Discarded {count} queued tasks on worker {id}.");
                            }
                        }
                        None => {
                            tracing::debug!("All tasks exhausted, shutting down worker {id}.");
                            break;
                        }
                    }
                }
            }),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::*;
    use crate::sparse;

    fn failing(msg: &'static str) -> impl Future<Output = io::Result<()>> {
        async move { Err(io::Error::other(msg)) }
    }

    async fn panicking() -> io::Result<()> {
        panic!("task panicked")
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_all_tasks_complete() {
        let counter = Arc::new(AtomicUsize::new(0));

        let mut pool = Pool::default();
        pool.start(4.try_into().unwrap());

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok::<_, io::Error>(())
            }));
        }

        pool.stop().await.unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 50);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(
            pool.stats(),
            BatchStats {
                completed: 50,
                failed: 0,
                discarded: 0
            }
        );
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_failure_discards_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));

        let mut pool = Pool::default();
        pool.start(1.try_into().unwrap());

        // nothing runs before the pool is stopped on a current thread runtime
        assert!(pool.submit(failing("first")));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }));
        }
        assert_eq!(pool.outstanding(), 11);

        let err = pool.stop().await.unwrap_err();

        assert!(matches!(err, BatchError::Task(ref err) if err.to_string() == "first"), "{err:?}");
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(
            pool.stats(),
            BatchStats {
                completed: 0,
                failed: 1,
                discarded: 10
            }
        );
        assert!(logs_contain("Discarded 10 queued tasks"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_submit_after_cancellation() {
        let mut pool = Pool::default();
        pool.start(2.try_into().unwrap());

        assert!(pool.submit(failing("boom")));

        for _ in 0..1_000 {
            if pool.is_cancelled() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(pool.is_cancelled());
        assert!(!pool.submit(async { Ok(()) }));
        assert_eq!(pool.outstanding(), 0);

        assert!(pool.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_submit_without_start() {
        let pool = Pool::<io::Error>::default();

        assert!(!pool.submit(async { Ok(()) }));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_failure() {
        let mut pool = Pool::default();

        pool.start(2.try_into().unwrap());
        pool.submit(failing("boom"));
        assert!(pool.stop().await.is_err());

        pool.start(2.try_into().unwrap());
        assert!(!pool.is_cancelled());
        assert!(pool.submit(async { Ok(()) }));
        pool.stop().await.unwrap();

        assert_eq!(pool.stats().completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[tracing_test::traced_test]
    async fn test_concurrent_failures_report_one() {
        let mut pool = Pool::default();
        pool.start(8.try_into().unwrap());

        let submitted = (0..32).filter(|_| pool.submit(failing("concurrent"))).count();

        let err = pool.stop().await.unwrap_err();
        let stats = pool.stats();

        assert!(matches!(err, BatchError::Task(_)));
        assert!(stats.failed >= 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed + stats.discarded, submitted);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..20).map(|_| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            }
        });

        run_batch(2.try_into().unwrap(), tasks).await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_in_flight_tasks_finish_before_failure_is_reported() {
        let finished = Arc::new(AtomicBool::new(false));

        let mut pool = Pool::default();
        pool.start(2.try_into().unwrap());

        let flag = Arc::clone(&finished);
        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        pool.submit(failing("fast"));

        assert!(pool.stop().await.is_err());
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task() {
        let mut pool = Pool::default();
        pool.start(1.try_into().unwrap());

        pool.submit(panicking());
        pool.submit(async { Ok(()) });

        let err = pool.stop().await.unwrap_err();

        assert!(matches!(err, BatchError::Panicked { .. }), "{err:?}");
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stop_with_poisoned_failure_slot() {
        let mut pool = Pool::default();
        pool.start(1.try_into().unwrap());

        assert!(pool.submit(failing("first")));

        let batch = Arc::clone(&pool.batch);
        std::thread::spawn(move || {
            let _failure = batch.failure.lock().unwrap();
            panic!("failure slot poisoned");
        })
        .join()
        .unwrap_err();
        assert!(pool.batch.failure.is_poisoned());

        let err = pool.stop().await.unwrap_err();

        assert!(matches!(err, BatchError::Task(ref err) if err.to_string() == "first"), "{err:?}");
        assert_eq!(pool.stats().failed, 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_default_pool_size() {
        assert_eq!(DEFAULT_POOL_SIZE.get(), 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[tracing_test::traced_test]
    async fn test_sparse_batch() {
        let dir = tempfile::tempdir().unwrap();
        let files = [("a.bin", 0), ("b.bin", 1_048_576), ("c.bin", 3)];

        let tasks = files.map(|(name, size)| {
            let path = dir.path().join(name);
            async move {
                match sparse::materialize(path, size).await {
                    Err(err) if err.is_sparse_unsupported() => Ok(()),
                    result => result,
                }
            }
        });

        run_batch(2.try_into().unwrap(), tasks).await.unwrap();

        for (name, size) in files {
            assert_eq!(std::fs::metadata(dir.path().join(name)).unwrap().len(), size, "{name}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[tracing_test::traced_test]
    async fn test_sparse_batch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("missing").join("file50.bin");

        let tasks = (0..100).map(|i| {
            let path = if i == 50 {
                bad.clone()
            } else {
                dir.path().join(format!("file{i}.bin"))
            };
            async move {
                match sparse::materialize(path, 4096).await {
                    Err(err) if err.is_sparse_unsupported() => Ok(()),
                    result => result,
                }
            }
        });

        let err = tokio::time::timeout(Duration::from_secs(30), run_batch(DEFAULT_POOL_SIZE, tasks))
            .await
            .expect("batch hung")
            .unwrap_err();

        match err {
            BatchError::Task(err) => assert_eq!(err.path(), bad),
            err => panic!("{err:?}"),
        }

        let created = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(created <= 99);
    }
}
