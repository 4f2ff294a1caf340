//! Worker loop: dequeue, execute, settle

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use super::WorkerId;
use crate::config::PanicPolicy;
use crate::error::TaskError;
use crate::events::{PoolEvent, PoolEventKind};
use crate::pool::PoolInner;
use crate::task::{CancelReason, TaskRef};

enum Attempt {
    Finished(Result<(), TaskError>),
    TimedOut(Duration),
}

/// Run one worker until the queue is closed and empty
pub(crate) async fn run_worker(inner: Arc<PoolInner>, worker_id: WorkerId) {
    debug!(%worker_id, "Worker started");

    while let Ok(task) = inner.queue.dequeue().await {
        let control = task.control();

        if control.is_cancel_requested() {
            inner.fail(&task, TaskError::Cancelled, Some(worker_id));
            continue;
        }
        // Resolved while it sat in the queue.
        let Some(attempt) = control.begin_attempt() else {
            continue;
        };

        inner.workers.lock().set_busy(worker_id, control.id);
        debug!(%worker_id, task_id = %control.id, attempt, "Executing task");
        inner.emit(
            PoolEvent::new(PoolEventKind::TaskStarted)
                .with_task(control.id, attempt)
                .with_worker(Some(worker_id)),
        );

        let outcome = execute(&inner, &task, worker_id, attempt).await;
        settle(&inner, task, worker_id, outcome);

        inner.workers.lock().set_idle(worker_id);
    }

    inner.workers.lock().set_terminating(worker_id);
    debug!(%worker_id, "Worker stopping: queue closed");
}

async fn execute(inner: &PoolInner, task: &TaskRef, worker_id: WorkerId, attempt: u32) -> Attempt {
    let control = task.control();
    let ctx = control.context(worker_id, attempt);
    let run = Arc::clone(task).execute(ctx);

    let mut run: BoxFuture<'static, Result<(), TaskError>> = match inner.config.panic_policy {
        PanicPolicy::Isolate => Box::pin(async move {
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(TaskError::panicked(panic_message(payload.as_ref()))),
            }
        }),
        // A panic unwinds through the worker and the supervisor sees it.
        PanicPolicy::CrashWorker => run,
    };

    let Some(limit) = control.timeout else {
        return Attempt::Finished(run.await);
    };

    tokio::select! {
        result = &mut run => Attempt::Finished(result),
        _ = tokio::time::sleep(limit) => {
            warn!(
                %worker_id,
                task_id = %control.id,
                limit_ms = limit.as_millis() as u64,
                "Task exceeded its timeout, requesting cancellation"
            );
            control.request_cancel(CancelReason::TimedOut);
            // The worker stays with the task until it yields.
            let _ = run.await;
            Attempt::TimedOut(limit)
        }
    }
}

fn settle(inner: &Arc<PoolInner>, task: TaskRef, worker_id: WorkerId, outcome: Attempt) {
    let control = task.control();

    match outcome {
        Attempt::Finished(Ok(())) => inner.complete(&task, Some(worker_id)),
        Attempt::Finished(Err(error)) => {
            let error = match control.cancel_reason() {
                Some(CancelReason::Requested | CancelReason::Shutdown) => TaskError::Cancelled,
                Some(CancelReason::TimedOut) | None => error,
            };
            inner.handle_failure(task, error, Some(worker_id));
        }
        Attempt::TimedOut(limit) => {
            inner.fail(&task, TaskError::timed_out(limit), Some(worker_id));
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
