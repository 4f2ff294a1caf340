//! State shared by the pool facade, workers and the supervisor

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use super::PoolStatus;
use crate::config::{PoolConfig, SpawnPolicy};
use crate::error::TaskError;
use crate::events::{EventSink, PoolEvent, PoolEventKind};
use crate::queue::TaskQueue;
use crate::stats::PoolCounters;
use crate::task::{TaskId, TaskRef};
use crate::worker::{SupervisorCommand, WorkerCrash, WorkerId, WorkerRegistry};

pub(crate) type CrashCallback = Arc<dyn Fn(&WorkerCrash) + Send + Sync>;

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) queue: TaskQueue<TaskRef>,
    /// Every submitted task that has not resolved yet
    pub(crate) pending: DashMap<TaskId, TaskRef>,
    pub(crate) workers: Mutex<WorkerRegistry>,
    pub(crate) counters: PoolCounters,
    pub(crate) status: RwLock<PoolStatus>,
    pub(crate) drained: Notify,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) on_worker_crash: Option<CrashCallback>,
    sink: Option<Arc<dyn EventSink>>,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
}

impl PoolInner {
    pub(crate) fn new(
        config: PoolConfig,
        sink: Option<Arc<dyn EventSink>>,
        on_worker_crash: Option<CrashCallback>,
        commands: mpsc::UnboundedSender<SupervisorCommand>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue: TaskQueue::new(config.queue_capacity),
            pending: DashMap::new(),
            workers: Mutex::new(WorkerRegistry::default()),
            counters: PoolCounters::default(),
            status: RwLock::new(PoolStatus::Starting),
            drained: Notify::new(),
            shutdown_tx,
            on_worker_crash,
            sink,
            commands,
            config,
        }
    }

    pub(crate) fn status(&self) -> PoolStatus {
        *self.status.read()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(&event);
        }
    }

    /// Ask the supervisor for another worker when none is free
    pub(crate) fn request_worker(&self) {
        if self.config.spawn_policy != SpawnPolicy::Lazy {
            return;
        }
        let needs_worker = {
            let workers = self.workers.lock();
            workers.idle() == 0 && workers.live() < self.config.max_workers
        };
        if needs_worker {
            let _ = self.commands.send(SupervisorCommand::SpawnWorker);
        }
    }

    /// Publish a staged success
    pub(crate) fn complete(&self, task: &TaskRef, worker_id: Option<WorkerId>) {
        let control = task.control();
        if task.commit() {
            PoolCounters::incr(&self.counters.succeeded);
            debug!(
                task_id = %control.id,
                attempts = control.attempts(),
                elapsed_ms = control.submitted_at.elapsed().as_millis() as u64,
                "Task succeeded"
            );
            self.emit(
                PoolEvent::new(PoolEventKind::TaskSucceeded)
                    .with_task(control.id, control.attempts())
                    .with_worker(worker_id),
            );
        }
        self.forget(control.id);
    }

    /// Resolve a task with a final error
    pub(crate) fn fail(&self, task: &TaskRef, error: TaskError, worker_id: Option<WorkerId>) {
        let control = task.control();
        let kind = match &error {
            TaskError::Cancelled => PoolEventKind::TaskCancelled,
            TaskError::TimedOut { .. } => PoolEventKind::TaskTimedOut,
            _ => PoolEventKind::TaskFailed,
        };
        let detail = error.to_string();

        if task.fail(error) {
            let counter = match kind {
                PoolEventKind::TaskCancelled => &self.counters.cancelled,
                PoolEventKind::TaskTimedOut => &self.counters.timed_out,
                _ => &self.counters.failed,
            };
            PoolCounters::incr(counter);
            debug!(task_id = %control.id, attempts = control.attempts(), error = %detail, "Task resolved with error");
            self.emit(
                PoolEvent::new(kind)
                    .with_task(control.id, control.attempts())
                    .with_worker(worker_id)
                    .with_detail(detail),
            );
        }
        self.forget(control.id);
    }

    /// Retry the task if its policy allows, otherwise resolve it with `error`
    pub(crate) fn handle_failure(
        self: &Arc<Self>,
        task: TaskRef,
        error: TaskError,
        worker_id: Option<WorkerId>,
    ) {
        let control = task.control();
        let attempt = control.attempts();

        let delay = match &control.retry {
            Some(policy)
                if policy.should_retry(&error)
                    && policy.has_attempts_remaining(attempt)
                    && !control.is_cancel_requested()
                    && !self.queue.is_closed() =>
            {
                Some(policy.delay_for_attempt(attempt + 1))
            }
            _ => None,
        };

        match delay {
            Some(delay) => self.schedule_retry(task, error, delay, worker_id),
            None => self.fail(&task, error, worker_id),
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        task: TaskRef,
        error: TaskError,
        delay: Duration,
        worker_id: Option<WorkerId>,
    ) {
        let control = task.control();
        control.requeue();
        PoolCounters::incr(&self.counters.retries);

        warn!(
            task_id = %control.id,
            attempt = control.attempts(),
            max_attempts = control.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Task failed, scheduling retry"
        );
        self.emit(
            PoolEvent::new(PoolEventKind::TaskRetrying)
                .with_task(control.id, control.attempts())
                .with_worker(worker_id)
                .with_detail(error.to_string()),
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = task.control().cancel_token();

            let requeued = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => {
                    tokio::select! {
                        result = inner.queue.enqueue(Arc::clone(&task), None) => result.is_ok(),
                        _ = cancel.cancelled() => false,
                    }
                }
            };

            if requeued {
                inner.request_worker();
            } else {
                inner.fail(&task, TaskError::Cancelled, None);
            }
        });
    }

    pub(crate) fn forget(&self, task_id: TaskId) {
        self.pending.remove(&task_id);
        if self.pending.is_empty() {
            self.drained.notify_waiters();
        }
    }
}
