//! Pool lifecycle events
//!
//! Every state change the pool makes (a task starting, retrying or
//! finishing, a worker spawning or crashing) is reported to an optional
//! [`EventSink`]. Sinks are called synchronously from submitters, workers
//! and the supervisor, so they must be quick and must not panic.
//!
//! Events for one task arrive in lifecycle order, except that
//! `TaskQueued` may trail `TaskStarted` when a worker picks the task up
//! before the submitter reports it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::task::TaskId;
use crate::worker::WorkerId;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolEventKind {
    // Task lifecycle
    TaskQueued,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    TaskRetrying,
    TaskCancelled,
    TaskTimedOut,

    // Worker lifecycle
    WorkerSpawned,
    WorkerCrashed,
    WorkerExited,
}

/// A single lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub kind: PoolEventKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    /// Attempt number for task events (1-based, 0 for worker events)
    pub attempt: u32,

    /// Error text for failures, panic message for crashes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl PoolEvent {
    pub fn new(kind: PoolEventKind) -> Self {
        Self {
            kind,
            task_id: None,
            worker_id: None,
            attempt: 0,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: TaskId, attempt: u32) -> Self {
        self.task_id = Some(task_id);
        self.attempt = attempt;
        self
    }

    pub fn with_worker(mut self, worker_id: Option<WorkerId>) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receiver of pool events
///
/// Implementations can:
/// - Forward events to a channel for streaming
/// - Collect events in memory for testing
/// - Log events through `tracing`
///
/// Any `Fn(&PoolEvent)` closure is also a sink.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PoolEvent);
}

impl<F> EventSink for F
where
    F: Fn(&PoolEvent) + Send + Sync,
{
    fn emit(&self, event: &PoolEvent) {
        self(event)
    }
}

/// Sink that forwards events to an unbounded channel
///
/// Events are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &PoolEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// In-memory event log
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<PoolEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All events recorded so far, oldest first
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: PoolEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    /// Events concerning one task, oldest first
    pub fn for_task(&self, task_id: TaskId) -> Vec<PoolEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Sink that logs each event at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PoolEvent) {
        debug!(
            kind = ?event.kind,
            task_id = ?event.task_id,
            worker_id = ?event.worker_id,
            attempt = event.attempt,
            detail = event.detail.as_deref().unwrap_or(""),
            "Pool event"
        );
    }
}
