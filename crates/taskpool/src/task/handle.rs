//! Caller-side view of a submitted task

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{TaskControl, TaskId, TaskState};
use crate::error::TaskError;

/// Handle to a submitted task's eventual result
///
/// The result is written exactly once. Any number of clones may wait on
/// it concurrently and all of them observe the same value.
pub struct TaskHandle<T> {
    control: Arc<TaskControl>,
    rx: watch::Receiver<Option<Result<T, TaskError>>>,
}

impl<T: Clone> TaskHandle<T> {
    pub(crate) fn new(
        control: Arc<TaskControl>,
        rx: watch::Receiver<Option<Result<T, TaskError>>>,
    ) -> Self {
        Self { control, rx }
    }

    pub fn id(&self) -> TaskId {
        self.control.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u32 {
        self.control.attempts()
    }

    /// Whether the result is available
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Result if already available, without waiting
    pub fn try_result(&self) -> Option<Result<T, TaskError>> {
        self.rx.borrow().clone()
    }

    /// Wait for the result
    ///
    /// If the pool drops the task without resolving it (which only happens
    /// when the pool itself is torn down), the task reads as cancelled.
    pub async fn wait(&self) -> Result<T, TaskError> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(TaskError::Cancelled))
    }

    /// Wait for the result for at most `timeout`
    ///
    /// Returns `None` when the timeout elapses first; the task keeps running.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            rx: self.rx.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.control.id)
            .field("state", &self.control.state())
            .field("attempts", &self.control.attempts())
            .finish()
    }
}
