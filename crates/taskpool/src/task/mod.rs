//! Task abstractions
//!
//! A task is one submission: the caller's [`Work`], an identity, a state,
//! and a result slot that is written exactly once. The pool keeps the task
//! record; the caller keeps a [`TaskHandle`] to observe the result.

mod context;
mod handle;
mod work;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use context::TaskContext;
pub use handle::TaskHandle;
pub use work::{BlockingWork, FnWork, Work};

use crate::error::TaskError;
use crate::retry::RetryPolicy;
use crate::worker::WorkerId;

/// Unique task identifier (UUID v7, ordered by submission time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a task
///
/// ```text
/// Queued ──► Running ──► Succeeded | Failed | Cancelled
///   │  ▲         │
///   │  └─────────┘ (retry)
///   └──► Cancelled
/// ```
///
/// Timeouts resolve as `Failed` with a `TaskError::TimedOut` cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    fn from_result<T>(result: &Result<T, TaskError>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(TaskError::Cancelled) => Self::Cancelled,
            Err(_) => Self::Failed,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a task was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit `WorkerPool::cancel`
    Requested,
    /// The execution timeout elapsed
    TimedOut,
    /// Forced pool shutdown
    Shutdown,
}

/// Per-submission options
///
/// Unset fields fall back to the pool's [`PoolConfig`](crate::PoolConfig).
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Retry policy for this task (retries are off unless set here or in
    /// the pool config)
    pub retry: Option<RetryPolicy>,

    /// Execution timeout for each attempt
    pub timeout: Option<Duration>,

    /// How long to wait for queue space
    pub submit_timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = Some(timeout);
        self
    }
}

/// Type-independent part of a task, shared by the record and its handles
#[derive(Debug)]
pub(crate) struct TaskControl {
    pub(crate) id: TaskId,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) submitted_at: Instant,
    state: Mutex<TaskState>,
    attempts: AtomicU32,
    cancel: CancellationToken,
    cancel_reason: Arc<OnceLock<CancelReason>>,
}

impl TaskControl {
    fn new(retry: Option<RetryPolicy>, timeout: Option<Duration>) -> Self {
        Self {
            id: TaskId::new(),
            retry,
            timeout,
            submitted_at: Instant::now(),
            state: Mutex::new(TaskState::Queued),
            attempts: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            cancel_reason: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |p| p.max_attempts)
    }

    /// Move to `Running` for a new attempt; `None` if already resolved
    pub(crate) fn begin_attempt(&self) -> Option<u32> {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return None;
        }
        *state = TaskState::Running;
        Some(self.attempts.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Back to `Queued` while a retry is pending
    pub(crate) fn requeue(&self) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = TaskState::Queued;
        }
    }

    /// Signal cancellation; the first reason recorded wins
    pub(crate) fn request_cancel(&self, reason: CancelReason) {
        let _ = self.cancel_reason.set(reason);
        self.cancel.cancel();
    }

    pub(crate) fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason.get().copied()
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn context(&self, worker_id: WorkerId, attempt: u32) -> TaskContext {
        TaskContext::new(
            self.id,
            worker_id,
            attempt,
            self.max_attempts(),
            self.cancel.clone(),
            Arc::clone(&self.cancel_reason),
        )
    }
}

/// Type-erased task as seen by the queue and workers
pub(crate) trait Runnable: Send + Sync + 'static {
    fn control(&self) -> &TaskControl;

    /// Run one attempt; a successful output is staged, not yet published
    fn execute(self: Arc<Self>, ctx: TaskContext) -> BoxFuture<'static, Result<(), TaskError>>;

    /// Publish the staged output; `false` if the task was already resolved
    fn commit(&self) -> bool;

    /// Resolve with an error; `false` if the task was already resolved
    fn fail(&self, error: TaskError) -> bool;
}

pub(crate) type TaskRef = Arc<dyn Runnable>;

type Slot<T> = Option<Result<T, TaskError>>;

/// Task record owning the work and the write side of the result slot
pub(crate) struct TaskRecord<W: Work> {
    control: Arc<TaskControl>,
    work: W,
    staged: Mutex<Option<W::Output>>,
    slot: watch::Sender<Slot<W::Output>>,
}

impl<W: Work> TaskRecord<W> {
    pub(crate) fn new(
        work: W,
        retry: Option<RetryPolicy>,
        timeout: Option<Duration>,
    ) -> (Arc<Self>, TaskHandle<W::Output>) {
        let control = Arc::new(TaskControl::new(retry, timeout));
        let (slot, rx) = watch::channel(None);
        let handle = TaskHandle::new(Arc::clone(&control), rx);

        let record = Arc::new(Self {
            control,
            work,
            staged: Mutex::new(None),
            slot,
        });
        (record, handle)
    }

    /// First resolution wins; the state lock is the gate
    fn resolve(&self, result: Result<W::Output, TaskError>) -> bool {
        let mut state = self.control.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = TaskState::from_result(&result);
        self.slot.send_replace(Some(result));
        true
    }
}

impl<W: Work> Runnable for TaskRecord<W> {
    fn control(&self) -> &TaskControl {
        &self.control
    }

    fn execute(self: Arc<Self>, ctx: TaskContext) -> BoxFuture<'static, Result<(), TaskError>> {
        Box::pin(async move {
            let output = self.work.run(&ctx).await?;
            *self.staged.lock() = Some(output);
            Ok(())
        })
    }

    fn commit(&self) -> bool {
        let staged = self.staged.lock().take();
        match staged {
            Some(output) => self.resolve(Ok(output)),
            None => self.resolve(Err(TaskError::non_retryable(
                "task completed without an output",
            ))),
        }
    }

    fn fail(&self, error: TaskError) -> bool {
        self.resolve(Err(error))
    }
}
