//! Error types for the pool and for task outcomes

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::worker::WorkerId;

/// Why a task did not produce a value
///
/// Task errors never escape the pool as panics or `Err` returns from pool
/// methods; they are always delivered through the task's handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The submitted work returned an error or panicked
    #[error("task execution failed: {message}")]
    Execution {
        /// Error message
        message: String,

        /// Error type/code for programmatic handling
        error_type: Option<String>,

        /// Whether a retry policy may run the task again
        retryable: bool,
    },

    /// The worker running the task died before the task resolved
    #[error("worker {worker_id} crashed while running the task: {reason}")]
    WorkerCrashed {
        /// Worker that crashed
        worker_id: WorkerId,
        /// Crash description (usually the panic message)
        reason: String,
    },

    /// The task exceeded its execution budget
    #[error("task exceeded its execution timeout of {limit_ms}ms")]
    TimedOut {
        /// Configured limit in milliseconds
        limit_ms: u64,
    },

    /// The task was cancelled before or during execution
    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    /// Create a retryable execution error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            error_type: None,
            retryable: true,
        }
    }

    /// Create a non-retryable execution error
    ///
    /// Non-retryable errors resolve the task immediately even when a retry
    /// policy is configured.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            error_type: None,
            retryable: false,
        }
    }

    /// Set the error type of an execution error
    pub fn with_type(self, error_type: impl Into<String>) -> Self {
        match self {
            Self::Execution {
                message, retryable, ..
            } => Self::Execution {
                message,
                error_type: Some(error_type.into()),
                retryable,
            },
            other => other,
        }
    }

    pub(crate) fn timed_out(limit: Duration) -> Self {
        Self::TimedOut {
            limit_ms: limit.as_millis() as u64,
        }
    }

    /// Error used when work panicked inside an isolating worker
    pub(crate) fn panicked(message: String) -> Self {
        Self::non_retryable(format!("task panicked: {message}")).with_type("PANIC")
    }

    /// Whether a retry policy is allowed to run the task again
    ///
    /// Timeouts and cancellations are final. Worker crashes are retried only
    /// when the task carries a retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Execution { retryable, .. } => *retryable,
            Self::WorkerCrashed { .. } => true,
            Self::TimedOut { .. } | Self::Cancelled => false,
        }
    }

    /// Error type used to match against a policy's non-retryable list
    pub fn error_type(&self) -> Option<&str> {
        match self {
            Self::Execution { error_type, .. } => error_type.as_deref(),
            Self::WorkerCrashed { .. } => Some("WORKER_CRASHED"),
            Self::TimedOut { .. } => Some("TIMED_OUT"),
            Self::Cancelled => Some("CANCELLED"),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// Errors returned by pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The queue stayed full for the whole submission timeout
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Submission attempted after shutdown began
    #[error("task queue is closed; the pool is shutting down")]
    QueueClosed,

    /// Pool was not started yet
    #[error("worker pool is not running")]
    NotRunning,

    /// `start` called twice
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown did not finish within the configured timeout
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_error() {
        let error = TaskError::retryable("connection reset");
        assert!(error.is_retryable());
        assert_eq!(error.to_string(), "task execution failed: connection reset");
    }

    #[test]
    fn test_non_retryable_error_with_type() {
        let error = TaskError::non_retryable("bad input").with_type("INVALID_INPUT");
        assert!(!error.is_retryable());
        assert_eq!(error.error_type(), Some("INVALID_INPUT"));
    }

    #[test]
    fn test_terminal_variants_are_not_retryable() {
        assert!(!TaskError::Cancelled.is_retryable());
        assert!(!TaskError::timed_out(Duration::from_millis(50)).is_retryable());
        assert!(TaskError::WorkerCrashed {
            worker_id: WorkerId::new(3),
            reason: "boom".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_panic_error_is_final() {
        let error = TaskError::panicked("index out of bounds".into());
        assert!(!error.is_retryable());
        assert_eq!(error.error_type(), Some("PANIC"));
    }

    #[test]
    fn test_from_anyhow() {
        let err = anyhow::anyhow!("disk full").context("writing report");
        let task_err: TaskError = err.into();
        assert!(task_err.is_retryable());
        assert!(task_err.to_string().contains("writing report: disk full"));
    }

    #[test]
    fn test_task_error_serialization() {
        let error = TaskError::timed_out(Duration::from_millis(250));
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["kind"], "timed_out");
        assert_eq!(json["limit_ms"], 250);

        let parsed: TaskError = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, error);
    }
}
