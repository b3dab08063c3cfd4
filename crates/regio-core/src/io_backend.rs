//! Completion-queue backend abstraction.
//!
//! An `IoBackend` is one worker's kernel completion queue: operations are
//! queued, kicked to the kernel, and harvested as completions.
//!
//! # Implementors
//!
//! - `UringBackend` (default): one io_uring per worker. Receives and sends
//!   use `IORING_OP_READ_FIXED` / `IORING_OP_WRITE_FIXED` against the
//!   worker's registered region. Notification is armed by keeping one read
//!   outstanding on the worker's wake eventfd.
//!
//! - `ScriptedBackend` (engine tests): records queued operations and hands
//!   back completions injected by the test.

use crate::buffer::BufferRegistry;
use crate::entry::{IoOp, RequestContext};
use crate::error::Result;

/// A completed operation harvested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    /// The request context that was submitted.
    pub ctx: RequestContext,
    /// Bytes transferred, or negative errno.
    pub result: i32,
    /// Backend-specific flags.
    pub flags: u32,
}

impl IoCompletion {
    pub const EMPTY: Self = Self {
        ctx: RequestContext(0),
        result: 0,
        flags: 0,
    };

    #[inline]
    pub fn is_error(&self) -> bool {
        self.result < 0
    }
}

/// Asynchronous submission and completion for one worker.
///
/// The dispatch loop is the only caller. Per iteration it calls `arm()`,
/// then `submit_and_wait(1)`, then `poll_completions()` until empty, then
/// `push()` for every operation requested since the last iteration.
///
/// **Contract:** `push()` and `poll_completions()` must NEVER block.
/// `submit_and_wait()` is the loop's only suspension point.
pub trait IoBackend: BufferRegistry + Send {
    /// Queue one operation. Not yet visible to the kernel.
    ///
    /// Returns `Err(RingFull)` if the submission queue has no room.
    fn push(&mut self, op: &IoOp) -> Result<()>;

    /// Make sure a wake-up read is outstanding so that `notify()` on the
    /// worker's notifier ends a blocking wait. A no-op when already armed.
    fn arm(&mut self) -> Result<()>;

    /// Whether a wake-up read is currently outstanding.
    fn is_armed(&self) -> bool;

    /// Kick all queued operations and block until at least `min_complete`
    /// completions are available. `min_complete == 0` never blocks.
    ///
    /// Returns the number of entries submitted.
    fn submit_and_wait(&mut self, min_complete: usize) -> Result<usize>;

    /// Drain up to `max` completions into `buf` (non-blocking).
    ///
    /// Completions of the wake-up read are consumed here and disarm the
    /// backend; they are never returned.
    fn poll_completions(&mut self, buf: &mut [IoCompletion], max: usize) -> usize;

    /// Operations queued or submitted but not yet completed.
    fn inflight(&self) -> usize;

    /// Submission queue capacity.
    fn capacity(&self) -> usize;

    /// Drain what is left and release kernel resources.
    fn shutdown(&mut self);
}
