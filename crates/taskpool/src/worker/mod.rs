//! Workers and their supervision
//!
//! Workers are long-lived tokio tasks that pull from the shared queue. A
//! supervisor owns them in a `JoinSet`, notices when one dies, and spawns
//! a replacement so the pool keeps its size.

mod runner;
mod supervisor;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub(crate) use supervisor::{supervise, SupervisorCommand};

use crate::task::TaskId;

/// Identifier of a worker, unique within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting on the queue
    Idle,
    /// Executing a task
    Busy,
    /// Died while running; about to be replaced
    Crashed,
    /// Queue closed; finishing up
    Terminating,
}

/// Snapshot of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
}

/// Details passed to the worker crash callback
#[derive(Debug, Clone)]
pub struct WorkerCrash {
    /// Worker that died
    pub worker_id: WorkerId,
    /// Task it was running, if any
    pub task_id: Option<TaskId>,
    /// Panic message or other description
    pub reason: String,
}

#[derive(Debug)]
struct WorkerSlot {
    state: WorkerState,
    current_task: Option<TaskId>,
    tasks_completed: u64,
}

/// Live workers and what they are doing
#[derive(Debug, Default)]
pub(crate) struct WorkerRegistry {
    slots: HashMap<WorkerId, WorkerSlot>,
    next_id: u64,
}

impl WorkerRegistry {
    pub(crate) fn register(&mut self) -> WorkerId {
        self.next_id += 1;
        let id = WorkerId::new(self.next_id);
        self.slots.insert(
            id,
            WorkerSlot {
                state: WorkerState::Idle,
                current_task: None,
                tasks_completed: 0,
            },
        );
        id
    }

    pub(crate) fn set_busy(&mut self, id: WorkerId, task_id: TaskId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = WorkerState::Busy;
            slot.current_task = Some(task_id);
        }
    }

    pub(crate) fn set_idle(&mut self, id: WorkerId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            if slot.current_task.take().is_some() {
                slot.tasks_completed += 1;
            }
            slot.state = WorkerState::Idle;
        }
    }

    pub(crate) fn set_terminating(&mut self, id: WorkerId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = WorkerState::Terminating;
            slot.current_task = None;
        }
    }

    /// Mark a worker crashed and return the task it held
    pub(crate) fn set_crashed(&mut self, id: WorkerId) -> Option<TaskId> {
        let slot = self.slots.get_mut(&id)?;
        slot.state = WorkerState::Crashed;
        slot.current_task.take()
    }

    pub(crate) fn remove(&mut self, id: WorkerId) {
        self.slots.remove(&id);
    }

    /// Forget every worker after they were aborted
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    /// Workers that have not exited or crashed
    pub(crate) fn live(&self) -> usize {
        self.count(|state| matches!(state, WorkerState::Idle | WorkerState::Busy | WorkerState::Terminating))
    }

    pub(crate) fn idle(&self) -> usize {
        self.count(|state| state == WorkerState::Idle)
    }

    pub(crate) fn busy(&self) -> usize {
        self.count(|state| state == WorkerState::Busy)
    }

    pub(crate) fn snapshot(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .slots
            .iter()
            .map(|(id, slot)| WorkerInfo {
                id: *id,
                state: slot.state,
                current_task: slot.current_task,
                tasks_completed: slot.tasks_completed,
            })
            .collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    fn count(&self, pred: impl Fn(WorkerState) -> bool) -> usize {
        self.slots.values().filter(|slot| pred(slot.state)).count()
    }
}
