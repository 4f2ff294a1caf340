//! # Taskpool
//!
//! A bounded, in-process task execution engine built on tokio.
//!
//! ## Features
//!
//! - **Bounded FIFO queue**: submitters wait (or time out) when the queue is full
//! - **Fixed worker budget**: at most `max_workers` tasks run at once
//! - **Write-once results**: every submission returns a [`TaskHandle`] that any number of callers can await
//! - **Crash isolation**: a panicking task fails alone, or takes its worker down and the supervisor replaces it
//! - **Automatic retries**: opt-in retry policies with exponential backoff and jitter
//! - **Timeouts and cancellation**: cooperative, through [`TaskContext`]
//! - **Graceful and forced shutdown**
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (submit, cancel, stats, shutdown; owns pending task map)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskQueue                             │
//! │  (bounded FIFO, blocking enqueue with timeout)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Supervisor + Workers                        │
//! │  (JoinSet of worker tasks, crash detection, replacement)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskpool::prelude::*;
//!
//! struct Square(u64);
//!
//! #[async_trait]
//! impl Work for Square {
//!     type Output = u64;
//!
//!     async fn run(&self, ctx: &TaskContext) -> Result<u64, TaskError> {
//!         ctx.checkpoint()?;
//!         Ok(self.0 * self.0)
//!     }
//! }
//!
//! let pool = WorkerPool::new(PoolConfig::new(4, 64))?;
//! pool.start().await?;
//!
//! let handle = pool.submit(Square(7)).await?;
//! assert_eq!(handle.wait().await?, 49);
//!
//! pool.shutdown(true).await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use async_trait::async_trait;

    pub use crate::config::{PanicPolicy, PoolConfig, SpawnPolicy};
    pub use crate::error::{PoolError, TaskError};
    pub use crate::events::{ChannelSink, EventLog, EventSink, PoolEvent, PoolEventKind, TracingSink};
    pub use crate::pool::{CancelOutcome, PoolStatus, WorkerPool, WorkerPoolBuilder};
    pub use crate::retry::RetryPolicy;
    pub use crate::stats::PoolStats;
    pub use crate::task::{SubmitOptions, TaskContext, TaskHandle, TaskId, TaskState, Work};
}

// Re-export key types at crate root
pub use config::{ConfigError, PanicPolicy, PoolConfig, SpawnPolicy};
pub use error::{PoolError, TaskError};
pub use events::{ChannelSink, EventLog, EventSink, PoolEvent, PoolEventKind, TracingSink};
pub use pool::{CancelOutcome, PoolStatus, WorkerPool, WorkerPoolBuilder};
pub use queue::{EnqueueError, QueueClosed, TaskQueue};
pub use retry::RetryPolicy;
pub use stats::{CounterSnapshot, PoolStats};
pub use task::{
    BlockingWork, CancelReason, FnWork, SubmitOptions, TaskContext, TaskHandle, TaskId, TaskState,
    Work,
};
pub use worker::{WorkerCrash, WorkerId, WorkerInfo, WorkerState};
