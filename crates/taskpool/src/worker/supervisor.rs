//! Worker supervision: spawning, crash detection, replacement

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

use super::runner::{panic_message, run_worker};
use super::{WorkerCrash, WorkerId};
use crate::config::SpawnPolicy;
use crate::error::TaskError;
use crate::events::{PoolEvent, PoolEventKind};
use crate::pool::PoolInner;
use crate::stats::PoolCounters;

/// Requests sent to the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorCommand {
    /// Lazy spawning: a task is waiting and no worker is idle
    SpawnWorker,
}

struct Workers {
    set: JoinSet<()>,
    ids: HashMap<tokio::task::Id, WorkerId>,
}

impl Workers {
    fn spawn(&mut self, inner: &Arc<PoolInner>) -> WorkerId {
        let worker_id = inner.workers.lock().register();
        let handle = self.set.spawn(run_worker(Arc::clone(inner), worker_id));
        self.ids.insert(handle.id(), worker_id);

        PoolCounters::incr(&inner.counters.workers_spawned);
        debug!(%worker_id, "Spawned worker");
        inner.emit(PoolEvent::new(PoolEventKind::WorkerSpawned).with_worker(Some(worker_id)));
        worker_id
    }
}

/// Own the workers until the queue closes and every worker has exited
pub(crate) async fn supervise(
    inner: Arc<PoolInner>,
    mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut workers = Workers {
        set: JoinSet::new(),
        ids: HashMap::new(),
    };

    if inner.config.spawn_policy == SpawnPolicy::Eager {
        for _ in 0..inner.config.max_workers {
            workers.spawn(&inner);
        }
    }
    info!(
        pool = %inner.config.name,
        workers = workers.set.len(),
        spawn_policy = ?inner.config.spawn_policy,
        "Supervisor started"
    );

    loop {
        if inner.queue.is_closed() && workers.set.is_empty() {
            break;
        }

        tokio::select! {
            Some(joined) = workers.set.join_next_with_id() => match joined {
                Ok((id, ())) => {
                    if let Some(worker_id) = workers.ids.remove(&id) {
                        inner.workers.lock().remove(worker_id);
                        debug!(%worker_id, "Worker exited");
                        inner.emit(PoolEvent::new(PoolEventKind::WorkerExited).with_worker(Some(worker_id)));
                    }
                }
                Err(err) => {
                    let Some(worker_id) = workers.ids.remove(&err.id()) else {
                        continue;
                    };
                    handle_crash(&inner, worker_id, err);
                    if should_replace(&inner) {
                        workers.spawn(&inner);
                    }
                }
            },
            Some(command) = commands.recv() => match command {
                SupervisorCommand::SpawnWorker => {
                    let live = inner.workers.lock().live();
                    if !inner.queue.is_closed() && live < inner.config.max_workers {
                        workers.spawn(&inner);
                    }
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // Workers exit on their own once the closed queue is empty.
                debug!(remaining = workers.set.len(), "Supervisor observed shutdown");
            }
        }
    }

    info!(pool = %inner.config.name, "Supervisor stopped");
}

fn should_replace(inner: &PoolInner) -> bool {
    if inner.queue.is_closed() {
        return false;
    }
    match inner.config.spawn_policy {
        SpawnPolicy::Eager => true,
        SpawnPolicy::Lazy => !inner.queue.is_empty(),
    }
}

fn handle_crash(inner: &Arc<PoolInner>, worker_id: WorkerId, err: JoinError) {
    let reason = if err.is_panic() {
        panic_message(err.into_panic().as_ref())
    } else {
        "worker task was aborted".to_string()
    };

    let task_id = inner.workers.lock().set_crashed(worker_id);
    PoolCounters::incr(&inner.counters.worker_crashes);
    error!(%worker_id, task_id = ?task_id, %reason, "Worker crashed");

    let mut event = PoolEvent::new(PoolEventKind::WorkerCrashed)
        .with_worker(Some(worker_id))
        .with_detail(reason.clone());
    let task = task_id.and_then(|id| inner.pending.get(&id).map(|entry| Arc::clone(entry.value())));
    if let Some(task) = &task {
        event = event.with_task(task.control().id, task.control().attempts());
    }
    inner.emit(event);

    if let Some(callback) = &inner.on_worker_crash {
        let crash = WorkerCrash {
            worker_id,
            task_id,
            reason: reason.clone(),
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&crash))).is_err() {
            error!(%worker_id, "Worker crash callback panicked");
        }
    }

    if let Some(task) = task {
        inner.handle_failure(task, TaskError::WorkerCrashed { worker_id, reason }, Some(worker_id));
    }

    inner.workers.lock().remove(worker_id);
}
