//! Worker pool and connection admission.
//!
//! ```text
//!                    ┌──────────────┐  round-robin  ┌─ weft-worker-0 (current-thread runtime)
//!  acceptor ──ticket─▶  Scheduler   ├──────────────▶├─ weft-worker-1
//!     ▲              └──────────────┘               └─ …
//!     └──── waits for a free ticket at max_connections
//! ```
//!
//! Each worker is an OS thread driving its own single-threaded tokio
//! runtime, so the tasks of one worker never run at the same time and a
//! task keeps its thread from one suspension point to the next. Connections
//! are handed to a worker once and stay there.
//!
//! With `worker_threads = 0` connections run on the runtime that started the
//! server instead.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::error::HandlerError;
use crate::handler::BoxFuture;

// ── Admission ─────────────────────────────────────────────────────────────────

/// Caps the number of connections alive at once.
pub(crate) struct Admission {
    permits: Arc<Semaphore>,
    released: Arc<Notify>,
    ceiling: u32,
}

/// One admitted connection. Dropping it frees the slot.
pub(crate) struct Ticket {
    _permit: OwnedSemaphorePermit,
    released: Arc<Notify>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.released.notify_one();
    }
}

impl Admission {
    pub(crate) fn new(max_connections: usize) -> Self {
        let ceiling = u32::try_from(max_connections).unwrap_or(u32::MAX);
        Self {
            permits: Arc::new(Semaphore::new(ceiling as usize)),
            released: Arc::new(Notify::new()),
            ceiling,
        }
    }

    /// Waits for a free slot.
    pub(crate) async fn admit(&self) -> Option<Ticket> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        Some(Ticket { _permit: permit, released: Arc::clone(&self.released) })
    }

    /// Resolves when some ticket has been dropped since the last call.
    pub(crate) async fn released(&self) {
        self.released.notified().await;
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.ceiling as usize - self.permits.available_permits()
    }

    /// Waits up to `deadline` for every ticket to be dropped.
    pub(crate) async fn drained(&self, deadline: Duration) -> bool {
        let all = self.permits.acquire_many(self.ceiling);
        matches!(tokio::time::timeout(deadline, all).await, Ok(Ok(_)))
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Places connection tasks on workers.
pub(crate) struct Scheduler {
    workers: Vec<Worker>,
    next: AtomicUsize,
    pub(crate) admission: Admission,
}

struct Worker {
    jobs: mpsc::UnboundedSender<BoxFuture<()>>,
    thread: thread::JoinHandle<()>,
}

impl Scheduler {
    pub(crate) fn new(worker_threads: usize, max_connections: usize) -> std::io::Result<Self> {
        let workers = (0..worker_threads)
            .map(Worker::start)
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self { workers, next: AtomicUsize::new(0), admission: Admission::new(max_connections) })
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Runs `task` on the next worker in turn.
    ///
    /// The future is first polled on the worker, so resources bound to a
    /// runtime (such as a `TcpStream`) must be created inside it.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.workers.is_empty() {
            tokio::spawn(task);
            return;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[i].jobs.send(Box::pin(task)).is_err() {
            error!(worker = i, "worker is gone, dropping connection");
        }
    }

    /// Stops every worker. Tasks still running on them are dropped.
    pub(crate) async fn shutdown(self) {
        let threads: Vec<_> = self
            .workers
            .into_iter()
            .map(|w| {
                drop(w.jobs);
                w.thread
            })
            .collect();

        let joined = tokio::task::spawn_blocking(move || {
            threads.into_iter().map(thread::JoinHandle::join).filter(Result::is_err).count()
        })
        .await;
        match joined {
            Ok(0) => debug!("workers stopped"),
            Ok(n) => error!(panicked = n, "worker threads panicked"),
            Err(e) => error!("failed to join workers: {e}"),
        }
    }
}

impl Worker {
    fn start(index: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let (jobs, mut rx) = mpsc::unbounded_channel::<BoxFuture<()>>();

        let thread = thread::Builder::new()
            .name(format!("weft-worker-{index}"))
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        tokio::spawn(job);
                    }
                });
                debug!(worker = index, "worker exiting");
            })?;
        Ok(Self { jobs, thread })
    }
}

// ── blocking ──────────────────────────────────────────────────────────────────

/// Runs blocking or CPU-heavy work off the worker thread.
///
/// Handlers that call into synchronous libraries should wrap them here;
/// blocking a worker stalls every connection it owns. A panic in `f`
/// becomes a 500 [`HandlerError`].
///
/// ```rust
/// use weft::{HandlerError, Params, Request};
///
/// async fn digest(req: Request, _params: Params) -> Result<String, HandlerError> {
///     let body = req.body().to_vec();
///     let sum = weft::blocking(move || body.iter().map(|b| u64::from(*b)).sum::<u64>()).await?;
///     Ok(sum.to_string())
/// }
/// ```
pub async fn blocking<F, T>(f: F) -> Result<T, HandlerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(HandlerError::from_join)
}
