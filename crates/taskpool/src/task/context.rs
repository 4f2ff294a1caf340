//! Task execution context

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use super::{CancelReason, TaskId};
use crate::error::TaskError;
use crate::worker::WorkerId;

/// Context handed to work for one execution attempt
///
/// The context provides:
/// - Information about the current attempt
/// - Cooperative cancellation (explicit cancel, timeout, forced shutdown)
///
/// Cancellation never preempts running work. Long-running work should
/// check in at safe points and return [`TaskError::Cancelled`] when asked.
///
/// # Example
///
/// ```ignore
/// async fn run(&self, ctx: &TaskContext) -> Result<Report, TaskError> {
///     let mut report = Report::default();
///     for chunk in self.chunks.iter() {
///         ctx.checkpoint()?;
///         report.add(process(chunk).await?);
///     }
///     Ok(report)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task being executed
    pub task_id: TaskId,

    /// Worker running this attempt
    pub worker_id: WorkerId,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    cancel: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
        max_attempts: u32,
        cancel: CancellationToken,
        reason: Arc<OnceLock<CancelReason>>,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            attempt,
            max_attempts,
            cancel,
            reason,
        }
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why cancellation was requested, if it was
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Get a future that resolves when cancellation is requested
    ///
    /// This is useful for select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = fetch(&url) => result,
    ///     _ = ctx.cancelled() => Err(TaskError::Cancelled),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Return `Err(TaskError::Cancelled)` if cancellation was requested
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn context(attempt: u32, max_attempts: u32) -> (TaskContext, CancellationToken, Arc<OnceLock<CancelReason>>) {
        let token = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());
        let ctx = TaskContext::new(
            TaskId::new(),
            WorkerId::new(1),
            attempt,
            max_attempts,
            token.clone(),
            Arc::clone(&reason),
        );
        (ctx, token, reason)
    }

    #[test]
    fn test_is_last_attempt() {
        let (ctx, _, _) = context(3, 3);
        assert!(ctx.is_last_attempt());

        let (ctx, _, _) = context(2, 3);
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_checkpoint_after_cancel() {
        let (ctx, token, reason) = context(1, 1);
        assert_eq!(ctx.checkpoint(), Ok(()));
        assert_eq!(ctx.cancel_reason(), None);

        reason.set(CancelReason::Requested).unwrap();
        token.cancel();

        assert!(ctx.is_cancelled());
        assert_eq!(ctx.checkpoint(), Err(TaskError::Cancelled));
        assert_eq!(ctx.cancel_reason(), Some(CancelReason::Requested));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let (ctx, token, _) = context(1, 1);

        let waiter = tokio::spawn(async move {
            ctx.cancelled().await;
            ctx.is_cancelled()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(waiter.await.unwrap());
    }
}
