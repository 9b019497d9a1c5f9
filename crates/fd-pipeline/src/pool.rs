//! WorkPool - bounded worker pool with a configurable backpressure policy
//!
//! - Fixed number of worker tasks draining one FIFO queue
//! - Queue slots are semaphore permits; a job holds its slot until a worker
//!   has dequeued it and decremented the queue size, so the observed
//!   occupancy never exceeds the configured capacity
//! - A full queue is handled by the pool's [`BackpressurePolicy`]
//! - A panicking task fails its own handle and leaves the worker running

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fd_common::{BackpressurePolicy, PoolConfig, PoolStats};

use crate::error::PipelineError;
use crate::Result;

/// How a queued job finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Completed,
    Failed,
    Panicked,
}

type Job = BoxFuture<'static, JobStatus>;

/// A job waiting in the queue, holding its slot
struct QueuedJob {
    job: Job,
    slot: OwnedSemaphorePermit,
}

/// Pool counters, shared between the submitting side and the workers
#[derive(Debug, Default)]
pub struct PoolCounters {
    submitted: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    caller_runs: AtomicU64,
    queue_size: AtomicU32,
    active_workers: AtomicU32,
}

impl PoolCounters {
    /// Submissions to an open pool, including rejected ones
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Tasks that ran to an end, successfully or not
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn caller_runs(&self) -> u64 {
        self.caller_runs.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }
}

struct PoolShared {
    name: Arc<str>,
    counters: PoolCounters,
}

impl PoolShared {
    /// Run one job. Inline (caller-runs) jobs do not count as active workers.
    async fn execute(&self, job: Job, inline: bool) {
        let status = if inline {
            job.await
        } else {
            self.counters.active_workers.fetch_add(1, Ordering::SeqCst);
            let status = job.await;
            self.counters.active_workers.fetch_sub(1, Ordering::SeqCst);
            status
        };

        match status {
            JobStatus::Completed => {}
            JobStatus::Failed => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            JobStatus::Panicked => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(pool = %self.name, "Task panicked; worker continues");
            }
        }
        self.counters.consumed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Completion handle for a submitted task.
///
/// Resolves to the task's own result, or to [`PipelineError::WorkerLost`] when
/// the task panicked or was discarded by an immediate shutdown.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    pool: Arc<str>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PipelineError::WorkerLost(self.pool.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded worker pool
pub struct WorkPool {
    config: PoolConfig,
    shared: Arc<PoolShared>,

    /// `None` once the pool stops accepting work
    sender: parking_lot::RwLock<Option<mpsc::UnboundedSender<QueuedJob>>>,

    /// One permit per free queue slot
    slots: Arc<Semaphore>,

    /// Stops workers without draining the queue
    abort: CancellationToken,

    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    /// Start a pool and its workers. Must be called from within a Tokio runtime.
    pub fn start(config: PoolConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(PipelineError::InvalidPool(format!(
                "pool {} needs at least one worker",
                config.name
            )));
        }
        if config.queue_capacity == 0 {
            return Err(PipelineError::InvalidPool(format!(
                "pool {} needs a queue capacity of at least 1",
                config.name
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel::<QueuedJob>();
        let receiver = Arc::new(Mutex::new(rx));
        let shared = Arc::new(PoolShared {
            name: Arc::from(config.name.as_str()),
            counters: PoolCounters::default(),
        });
        let slots = Arc::new(Semaphore::new(config.queue_capacity));
        let abort = CancellationToken::new();

        let workers = (0..config.workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&shared),
                    Arc::clone(&receiver),
                    abort.clone(),
                ))
            })
            .collect();

        info!(
            pool = %config.name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            policy = %config.policy,
            "Starting work pool"
        );

        Ok(Self {
            config,
            shared,
            sender: parking_lot::RwLock::new(Some(tx)),
            slots,
            abort,
            workers: parking_lot::Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn counters(&self) -> &PoolCounters {
        &self.shared.counters
    }

    /// Submit an async task.
    ///
    /// Returns once the task is queued (or, under `BlockCaller` with a full
    /// queue, once it has run inline). Fails with `Backpressure` when the
    /// policy rejects the task and `PoolClosed` after shutdown.
    pub async fn submit<F, Fut, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            match AssertUnwindSafe(async move { task().await }).catch_unwind().await {
                Ok(result) => {
                    let status = if result.is_ok() {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    let _ = tx.send(result);
                    status
                }
                Err(_) => JobStatus::Panicked,
            }
        });

        self.dispatch(job).await?;

        Ok(TaskHandle {
            rx,
            pool: Arc::clone(&self.shared.name),
        })
    }

    /// Submit blocking (CPU-bound) work. It runs on the blocking thread pool
    /// while occupying one of this pool's workers.
    pub async fn submit_blocking<F, T>(&self, work: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = Arc::clone(&self.shared.name);
        self.submit(move || async move {
            tokio::task::spawn_blocking(work)
                .await
                .unwrap_or_else(|_| Err(PipelineError::WorkerLost(pool.to_string())))
        })
        .await
    }

    async fn dispatch(&self, job: Job) -> Result<()> {
        if self.is_shutdown() {
            return Err(PipelineError::PoolClosed(self.config.name.clone()));
        }

        let counters = &self.shared.counters;
        counters.submitted.fetch_add(1, Ordering::SeqCst);

        let slots = Arc::clone(&self.slots);
        match self.config.policy {
            BackpressurePolicy::BlockCaller => match slots.try_acquire_owned() {
                Ok(slot) => self.enqueue(job, slot),
                Err(TryAcquireError::NoPermits) => {
                    counters.caller_runs.fetch_add(1, Ordering::SeqCst);
                    debug!(pool = %self.config.name, "Queue full, running task in caller");
                    self.shared.execute(job, true).await;
                    Ok(())
                }
                Err(TryAcquireError::Closed) => Err(PipelineError::PoolClosed(self.config.name.clone())),
            },
            BackpressurePolicy::BlockProducer { timeout } => {
                match tokio::time::timeout(timeout, slots.acquire_owned()).await {
                    Ok(Ok(slot)) => self.enqueue(job, slot),
                    Ok(Err(_)) => Err(PipelineError::PoolClosed(self.config.name.clone())),
                    Err(_) => {
                        counters.rejected.fetch_add(1, Ordering::SeqCst);
                        debug!(
                            pool = %self.config.name,
                            timeout_ms = timeout.as_millis() as u64,
                            "No queue slot within timeout, rejecting"
                        );
                        Err(PipelineError::Backpressure(self.config.name.clone()))
                    }
                }
            }
            BackpressurePolicy::RejectAndCount => match slots.try_acquire_owned() {
                Ok(slot) => self.enqueue(job, slot),
                Err(TryAcquireError::NoPermits) => {
                    counters.rejected.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::Backpressure(self.config.name.clone()))
                }
                Err(TryAcquireError::Closed) => Err(PipelineError::PoolClosed(self.config.name.clone())),
            },
        }
    }

    fn enqueue(&self, job: Job, slot: OwnedSemaphorePermit) -> Result<()> {
        let counters = &self.shared.counters;
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            return Err(PipelineError::PoolClosed(self.config.name.clone()));
        };

        counters.queue_size.fetch_add(1, Ordering::SeqCst);
        if sender.send(QueuedJob { job, slot }).is_err() {
            counters.queue_size.fetch_sub(1, Ordering::SeqCst);
            return Err(PipelineError::PoolClosed(self.config.name.clone()));
        }
        Ok(())
    }

    /// Stop accepting work. Queued tasks still run.
    pub fn shutdown(&self) {
        self.slots.close();
        if self.sender.write().take().is_some() {
            info!(pool = %self.config.name, queue_size = self.counters().queue_size(), "Shutting down work pool");
        }
    }

    /// Stop accepting work and discard queued tasks. Running tasks finish.
    pub fn shutdown_now(&self) {
        self.shutdown();
        self.abort.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Wait for every worker to exit. Call after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
        debug!(pool = %self.config.name, "All workers exited");
    }

    /// True when nothing is queued or running
    pub fn is_fully_drained(&self) -> bool {
        self.counters().queue_size() == 0 && self.counters().active_workers() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let c = self.counters();
        PoolStats {
            name: self.config.name.clone(),
            policy: self.config.policy.to_string(),
            workers: self.config.workers as u32,
            queue_capacity: self.config.queue_capacity as u32,
            queue_size: c.queue_size(),
            active_workers: c.active_workers(),
            submitted: c.submitted(),
            completed: c.consumed().saturating_sub(c.failed()),
            failed: c.failed(),
            rejected: c.rejected(),
            caller_runs: c.caller_runs(),
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<PoolShared>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    abort: CancellationToken,
) {
    debug!(pool = %shared.name, worker_id, "Worker started");

    loop {
        let job = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        match job {
            Some(QueuedJob { job, slot }) => {
                shared.counters.queue_size.fetch_sub(1, Ordering::SeqCst);
                drop(slot);
                shared.execute(job, false).await;
            }
            None => break,
        }
    }

    if abort.is_cancelled() {
        let mut rx = receiver.lock().await;
        rx.close();
        let mut discarded = 0u32;
        while rx.try_recv().is_ok() {
            shared.counters.queue_size.fetch_sub(1, Ordering::SeqCst);
            discarded += 1;
        }
        if discarded > 0 {
            info!(pool = %shared.name, discarded, "Discarded queued tasks on immediate shutdown");
        }
    }

    debug!(pool = %shared.name, worker_id, "Worker exited");
}
