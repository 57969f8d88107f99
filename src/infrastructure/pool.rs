//! Fixed pool of serial worker queues.
//!
//! Each queue is one OS thread draining a FIFO channel, so jobs sent to the
//! same queue run strictly in order. The pool hands jobs to queues
//! round-robin. Disk I/O and decoding run here, never on caller threads.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound for the default worker count.
pub const MAX_DEFAULT_WORKERS: usize = 8;

/// Handle to one serial execution context.
#[derive(Clone)]
pub struct SerialQueue {
    name: Arc<str>,
    tx: mpsc::Sender<Job>,
}

impl SerialQueue {
    /// Starts a dedicated worker thread.
    ///
    /// # Errors
    /// Returns error if the OS refuses to spawn the thread.
    pub fn start(name: impl Into<String>) -> std::io::Result<Self> {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::channel::<Job>();
        let worker_name = name.clone();

        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(ToString::to_string)
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown".to_string());
                        error!(queue = %worker_name, reason = %reason, "Worker job panicked");
                    }
                }
                debug!(queue = %worker_name, "Worker queue closed");
            })?;

        Ok(Self { name, tx })
    }

    /// Queue name, also used as the thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a job. Returns false if the worker has exited.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sent = self.tx.send(Box::new(job)).is_ok();
        if !sent {
            trace!(queue = %self.name, "Dropped job for closed queue");
        }
        sent
    }

    /// Enqueues a job and waits for its result. `None` if the worker is gone
    /// or the job panicked.
    pub async fn run<F, T>(&self, job: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.dispatch(move || {
            let _ = tx.send(job());
        });
        if !queued {
            return None;
        }
        rx.await.ok()
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Round-robin set of serial queues.
#[derive(Clone)]
pub struct WorkerPool {
    queues: Arc<[SerialQueue]>,
    next: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Starts `workers` queues (at least one).
    ///
    /// # Errors
    /// Returns error if a worker thread cannot be spawned.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let queues = (0..workers)
            .map(|i| SerialQueue::start(format!("oximage-worker-{i}")))
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(workers = workers, "Started worker pool");

        Ok(Self {
            queues: queues.into(),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Worker count derived from available parallelism.
    #[must_use]
    pub fn default_worker_count() -> usize {
        thread::available_parallelism()
            .map_or(2, std::num::NonZeroUsize::get)
            .clamp(2, MAX_DEFAULT_WORKERS)
    }

    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Always false; a pool has at least one queue.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Returns the next queue in round-robin order.
    #[must_use]
    pub fn next_queue(&self) -> SerialQueue {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[index].clone()
    }

    /// Enqueues a job on the next queue.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.next_queue().dispatch(job)
    }

    /// Runs a job on the next queue and waits for its result.
    pub async fn run<F, T>(&self, job: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.next_queue().run(job).await
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.queues.len())
            .finish_non_exhaustive()
    }
}
