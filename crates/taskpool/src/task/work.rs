//! Work trait definition

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::TaskContext;
use crate::error::TaskError;

/// A unit of work the pool can execute
///
/// Work may be executed more than once when a retry policy applies, so
/// `run` takes `&self`.
///
/// # Example
///
/// ```ignore
/// use taskpool::prelude::*;
///
/// struct Resize {
///     path: PathBuf,
/// }
///
/// #[async_trait]
/// impl Work for Resize {
///     type Output = u64;
///
///     async fn run(&self, ctx: &TaskContext) -> Result<u64, TaskError> {
///         ctx.checkpoint()?;
///         let bytes = resize_image(&self.path).await?;
///         Ok(bytes)
///     }
/// }
/// ```
#[async_trait]
pub trait Work: Send + Sync + 'static {
    /// Value produced on success
    type Output: Clone + Send + Sync + 'static;

    /// Execute one attempt
    ///
    /// # Errors
    ///
    /// Return `TaskError::retryable()` for transient failures that may be retried.
    /// Return `TaskError::non_retryable()` for permanent failures.
    /// Return `TaskError::Cancelled` to acknowledge a cancellation request.
    async fn run(&self, ctx: &TaskContext) -> Result<Self::Output, TaskError>;
}

/// Work built from an async closure
pub struct FnWork<F> {
    f: F,
}

impl<F> FnWork<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, T> Work for FnWork<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    async fn run(&self, ctx: &TaskContext) -> Result<T, TaskError> {
        (self.f)(ctx.clone()).await
    }
}

/// Synchronous work run on the blocking thread pool
///
/// Use this for CPU-bound or blocking code that would stall an async
/// worker. Cancellation is still cooperative: the closure should poll
/// `ctx.is_cancelled()`.
pub struct BlockingWork<F> {
    f: Arc<F>,
}

impl<F> BlockingWork<F> {
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F, T> Work for BlockingWork<F>
where
    F: Fn(&TaskContext) -> Result<T, TaskError> + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    async fn run(&self, ctx: &TaskContext) -> Result<T, TaskError> {
        let f = Arc::clone(&self.f);
        let ctx = ctx.clone();

        match tokio::task::spawn_blocking(move || f(&ctx)).await {
            Ok(result) => result,
            // Surface the panic in the worker so the panic policy applies.
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(TaskError::Cancelled),
        }
    }
}
