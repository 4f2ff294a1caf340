//! Worker pool for task execution
//!
//! Accepts tasks into a bounded queue, runs them on a fixed budget of
//! workers, and shuts down either by draining or by cancelling.

mod inner;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub(crate) use inner::PoolInner;
use inner::CrashCallback;

use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::events::{EventSink, PoolEvent, PoolEventKind};
use crate::queue::EnqueueError;
use crate::stats::{PoolCounters, PoolStats};
use crate::task::{
    BlockingWork, CancelReason, FnWork, SubmitOptions, TaskContext, TaskHandle, TaskId,
    TaskRecord, TaskRef, Work,
};
use crate::worker::{supervise, SupervisorCommand, WorkerCrash, WorkerInfo};

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Created but not started
    Starting,
    /// Running and accepting tasks
    Running,
    /// Shutting down (finishing or cancelling tasks, not accepting new ones)
    Draining,
    /// All workers have stopped
    Stopped,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of [`WorkerPool::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still queued and was resolved as cancelled
    Dequeued,
    /// The task is running or awaiting a retry; it was asked to stop
    Signalled,
    /// No unresolved task with that id
    NotFound,
}

/// Builder for a [`WorkerPool`] with an event sink or crash callback
#[derive(Default)]
pub struct WorkerPoolBuilder {
    config: PoolConfig,
    sink: Option<Arc<dyn EventSink>>,
    on_worker_crash: Option<CrashCallback>,
}

impl WorkerPoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive every lifecycle event
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Called from the supervisor whenever a worker dies unexpectedly
    pub fn on_worker_crash<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WorkerCrash) + Send + Sync + 'static,
    {
        self.on_worker_crash = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<WorkerPool, PoolError> {
        self.config.validate()?;
        Ok(WorkerPool::assemble(self.config, self.sink, self.on_worker_crash))
    }
}

/// Bounded pool of workers executing submitted tasks
///
/// # Example
///
/// ```ignore
/// use taskpool::prelude::*;
///
/// let pool = WorkerPool::new(PoolConfig::new(4, 64))?;
/// pool.start().await?;
///
/// let handle = pool
///     .submit_fn(|_ctx| async move { Ok::<_, TaskError>(21 * 2) })
///     .await?;
/// assert_eq!(handle.wait().await?, 42);
///
/// // ... later, graceful shutdown
/// pool.shutdown(true).await?;
/// ```
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<SupervisorCommand>>>,
    supervisor: Mutex<Option<Supervisor>>,
}

/// Completion of the supervisor task, awaitable by every shutdown caller
#[derive(Clone)]
struct Supervisor {
    done: Shared<BoxFuture<'static, ()>>,
    abort: AbortHandle,
}

impl WorkerPool {
    /// Create a pool with no event sink or crash callback
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::default()
    }

    fn assemble(
        config: PoolConfig,
        sink: Option<Arc<dyn EventSink>>,
        on_worker_crash: Option<CrashCallback>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PoolInner::new(config, sink, on_worker_crash, commands_tx)),
            commands_rx: Mutex::new(Some(commands_rx)),
            supervisor: Mutex::new(None),
        }
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut status = self.inner.status.write();
            match *status {
                PoolStatus::Starting => *status = PoolStatus::Running,
                PoolStatus::Running | PoolStatus::Draining => return Err(PoolError::AlreadyRunning),
                PoolStatus::Stopped => return Err(PoolError::NotRunning),
            }
        }

        let Some(commands) = self.commands_rx.lock().take() else {
            return Err(PoolError::AlreadyRunning);
        };

        info!(
            max_workers = self.inner.config.max_workers,
            queue_capacity = self.inner.config.queue_capacity,
            spawn_policy = ?self.inner.config.spawn_policy,
            panic_policy = ?self.inner.config.panic_policy,
            "Starting worker pool"
        );

        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(supervise(Arc::clone(&self.inner), commands, shutdown_rx));
        *self.supervisor.lock() = Some(Supervisor {
            abort: handle.abort_handle(),
            done: handle.map(|_| ()).boxed().shared(),
        });

        Ok(())
    }

    /// Submit work, waiting for queue space
    ///
    /// Waits at most the configured submit timeout (forever if unset) and
    /// fails with [`PoolError::QueueFull`] when it elapses.
    pub async fn submit<W: Work>(&self, work: W) -> Result<TaskHandle<W::Output>, PoolError> {
        self.submit_with(work, SubmitOptions::default()).await
    }

    /// Submit an async closure
    pub async fn submit_fn<F, Fut, T>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.submit(FnWork::new(f)).await
    }

    /// Submit a synchronous closure to run on the blocking thread pool
    pub async fn submit_blocking<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Fn(&TaskContext) -> Result<T, TaskError> + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.submit(BlockingWork::new(f)).await
    }

    /// Submit work with per-task retry, timeout and submit-timeout overrides
    #[instrument(skip(self, work, options), fields(pool = %self.inner.config.name))]
    pub async fn submit_with<W: Work>(
        &self,
        work: W,
        options: SubmitOptions,
    ) -> Result<TaskHandle<W::Output>, PoolError> {
        self.ensure_accepting()?;
        let wait = options.submit_timeout.or(self.inner.config.submit_timeout);
        let (task, handle) = self.prepare(work, options)?;

        let result = self.inner.queue.enqueue(task, wait).await;
        self.admit(result, handle)
    }

    /// Submit work only if the queue has space right now
    pub fn try_submit<W: Work>(
        &self,
        work: W,
        options: SubmitOptions,
    ) -> Result<TaskHandle<W::Output>, PoolError> {
        self.ensure_accepting()?;
        let (task, handle) = self.prepare(work, options)?;

        let result = self.inner.queue.try_enqueue(task);
        self.admit(result, handle)
    }

    fn ensure_accepting(&self) -> Result<(), PoolError> {
        match self.inner.status() {
            PoolStatus::Running => Ok(()),
            PoolStatus::Starting => Err(PoolError::NotRunning),
            PoolStatus::Draining | PoolStatus::Stopped => Err(PoolError::QueueClosed),
        }
    }

    fn prepare<W: Work>(
        &self,
        work: W,
        options: SubmitOptions,
    ) -> Result<(TaskRef, TaskHandle<W::Output>), PoolError> {
        if let Some(policy) = &options.retry {
            policy.validate()?;
        }
        let retry = options.retry.or_else(|| self.inner.config.retry_policy.clone());
        let timeout = options.timeout.or(self.inner.config.task_timeout);

        let (record, handle) = TaskRecord::new(work, retry, timeout);
        let task: TaskRef = record;
        self.inner.pending.insert(handle.id(), Arc::clone(&task));
        Ok((task, handle))
    }

    fn admit<T: Clone>(
        &self,
        result: Result<(), EnqueueError<TaskRef>>,
        handle: TaskHandle<T>,
    ) -> Result<TaskHandle<T>, PoolError> {
        match result {
            Ok(()) => {
                PoolCounters::incr(&self.inner.counters.submitted);
                debug!(task_id = %handle.id(), "Task queued");
                self.inner
                    .emit(PoolEvent::new(PoolEventKind::TaskQueued).with_task(handle.id(), 0));
                self.inner.request_worker();
                Ok(handle)
            }
            Err(err) => {
                self.inner.forget(handle.id());
                if err.is_closed() {
                    Err(PoolError::QueueClosed)
                } else {
                    debug!(task_id = %handle.id(), "Queue full, rejecting task");
                    Err(PoolError::QueueFull {
                        capacity: self.inner.queue.capacity(),
                    })
                }
            }
        }
    }

    /// Cancel a task
    ///
    /// A queued task is removed and resolved as cancelled right away. A
    /// running task is only signalled; it resolves as cancelled once its
    /// work acknowledges, or normally if it finishes first.
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub fn cancel(&self, task_id: TaskId) -> CancelOutcome {
        if let Some(task) = self.inner.queue.remove_first(|t| t.control().id == task_id) {
            task.control().request_cancel(CancelReason::Requested);
            self.inner.fail(&task, TaskError::Cancelled, None);
            debug!(%task_id, "Cancelled queued task");
            return CancelOutcome::Dequeued;
        }

        let pending = self
            .inner
            .pending
            .get(&task_id)
            .map(|entry| Arc::clone(entry.value()));

        match pending {
            Some(task) => {
                task.control().request_cancel(CancelReason::Requested);
                debug!(%task_id, state = %task.control().state(), "Signalled task cancellation");
                CancelOutcome::Signalled
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Shut the pool down
    ///
    /// With `graceful`, stop accepting tasks and wait for every queued and
    /// running task (retries included) to finish. Otherwise, or when the
    /// shutdown timeout elapses first, resolve queued tasks as cancelled and
    /// signal running ones. Workers that still have not stopped when the
    /// timeout runs out are aborted and [`PoolError::ShutdownTimeout`] is
    /// returned.
    ///
    /// Calling it again after the pool stopped is a no-op. A call that
    /// overlaps one already in progress waits for the same workers to stop.
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub async fn shutdown(&self, graceful: bool) -> Result<(), PoolError> {
        {
            let mut status = self.inner.status.write();
            match *status {
                PoolStatus::Stopped => return Ok(()),
                PoolStatus::Starting => {
                    *status = PoolStatus::Stopped;
                    drop(status);
                    self.inner.queue.close();
                    return Ok(());
                }
                PoolStatus::Running | PoolStatus::Draining => *status = PoolStatus::Draining,
            }
        }

        let timeout = self.inner.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;

        info!(graceful, pending = self.inner.pending.len(), "Initiating shutdown");

        if graceful && !self.wait_drained(deadline).await {
            warn!(
                remaining_tasks = self.inner.pending.len(),
                "Shutdown timeout reached, cancelling remaining tasks"
            );
            timed_out = true;
        }
        if !graceful || timed_out {
            self.cancel_all();
        }

        self.inner.queue.close();
        // Anything a retry timer slipped in before the close.
        self.cancel_queued();
        let _ = self.inner.shutdown_tx.send(true);

        // Overlapping shutdown calls all wait on the same supervisor.
        let supervisor = self.supervisor.lock().clone();
        if let Some(supervisor) = supervisor {
            if tokio::time::timeout_at(deadline, supervisor.done.clone()).await.is_err() {
                warn!("Workers did not stop in time, aborting");
                supervisor.abort.abort();
                supervisor.done.await;
                self.inner.workers.lock().clear();
                timed_out = true;
            }
        }

        let leftovers: Vec<TaskRef> = self
            .inner
            .pending
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for task in leftovers {
            self.inner.fail(&task, TaskError::Cancelled, None);
        }

        *self.inner.status.write() = PoolStatus::Stopped;
        info!(counters = ?self.inner.counters.snapshot(), "Worker pool stopped");

        if timed_out {
            Err(PoolError::ShutdownTimeout(timeout))
        } else {
            Ok(())
        }
    }

    /// Wait until no task is pending; `false` if the deadline came first
    async fn wait_drained(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.pending.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.pending.is_empty();
            }
        }
    }

    /// Signal every unresolved task and resolve the queued ones
    fn cancel_all(&self) {
        let pending: Vec<TaskRef> = self
            .inner
            .pending
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for task in &pending {
            task.control().request_cancel(CancelReason::Shutdown);
        }
        self.cancel_queued();
    }

    fn cancel_queued(&self) {
        let queued = self.inner.queue.drain();
        if !queued.is_empty() {
            debug!(count = queued.len(), "Cancelling queued tasks");
        }
        for task in queued {
            self.inner.fail(&task, TaskError::Cancelled, None);
        }
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> PoolStats {
        let (idle_workers, busy_workers, live_workers) = {
            let workers = self.inner.workers.lock();
            (workers.idle(), workers.busy(), workers.live())
        };

        PoolStats {
            status: self.inner.status(),
            queued: self.inner.queue.len(),
            running: busy_workers,
            pending: self.inner.pending.len(),
            idle_workers,
            busy_workers,
            live_workers,
            max_workers: self.inner.config.max_workers,
            queue_capacity: self.inner.queue.capacity(),
            counters: self.inner.counters.snapshot(),
        }
    }

    /// Snapshot of every live worker
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.inner.workers.lock().snapshot()
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check if accepting tasks
    pub fn is_accepting(&self) -> bool {
        self.inner.status() == PoolStatus::Running
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Without a shutdown call, workers exit once the queue is empty.
        self.inner.queue.close();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.config.name)
            .field("status", &self.inner.status())
            .finish()
    }
}
