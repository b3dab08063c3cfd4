//! Handler execution abstraction.
//!
//! An `Executor` runs application connection handlers. Handlers may be
//! slow; they must never run on a dispatch-loop thread.
//!
//! # Implementors
//!
//! - `TaskPool` (default): N OS threads polling handler futures. A waker
//!   re-queues its task on the pool, so completing an operation only ever
//!   enqueues work.
//!
//! - `RecordingExecutor` (engine tests): keeps spawned futures for the
//!   test to drive.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// A boxed handler future.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs handler futures off the caller's thread.
///
/// **Contract:**
/// - `spawn()` must NEVER run the future inline and must never block.
/// - Wake-ups of a spawned future re-schedule it on the executor.
pub trait Executor: Send + Sync {
    /// Queue a future for execution.
    fn spawn(&self, task: BoxFuture) -> Result<()>;

    /// Number of threads currently polling a task.
    fn active_workers(&self) -> usize;

    /// Total number of executor threads.
    fn total_workers(&self) -> usize;

    /// Stop accepting work and let the threads exit.
    fn shutdown(&self);
}
