//! The "run this unit of work somewhere" capability that asynchronous dispatch depends on.
//!
//! [`crate::Dispatcher::async_post`] doesn't care where a request is processed, only that it's
//! eventually processed exactly once.  Anything implementing [`Executor`] can provide that: the
//! crate's own [`crate::WorkerPool`], the calling thread ([`Inline`]), or a tokio runtime via its
//! [`tokio::runtime::Handle`].
use crate::error::PoolError;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::*;

/// A single unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    /// Submit a task for execution.
    ///
    /// Fails only if the executor can no longer accept work, in which case the task is dropped
    /// without running.
    fn execute(&self, task: Task) -> Result<(), PoolError>;
}

/// Executor that runs each task immediately on the thread that submits it.
///
/// With this executor `async_post` behaves exactly like `post`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        task();
        Ok(())
    }
}

impl<X: Executor + ?Sized> Executor for Arc<X> {
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        (**self).execute(task)
    }
}

/// Hand tasks to a tokio runtime.
///
/// Dispatch is blocking code (handlers are plain functions), so tasks go to the runtime's
/// blocking thread pool rather than onto its async workers.
///
/// A runtime that has already shut down cancels the task on the spot; that's reported as
/// [`PoolError::ShutDown`].  Unlike [`crate::WorkerPool`], tokio does not drain its blocking
/// queue when it shuts down, so a task accepted just before shutdown can still be cancelled
/// before it starts.  Keep the runtime alive until outstanding work has been answered.
impl Executor for tokio::runtime::Handle {
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        let started = Arc::new(AtomicBool::new(false));
        let join_handle = {
            let started = started.clone();
            self.spawn_blocking(move || {
                started.store(true, Ordering::Release);
                task()
            })
        };

        // Cancellation by a shut-down runtime completes the join handle before `spawn_blocking`
        // returns; a task that really ran has set `started` first
        if join_handle.is_finished() && !started.load(Ordering::Acquire) {
            debug!("Tokio runtime is shut down; task cancelled without running");
            return Err(PoolError::ShutDown);
        }

        Ok(())
    }
}

/// Best-effort extraction of the message from a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
