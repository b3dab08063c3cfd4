//! Dispatch-loop wake-up abstraction.
//!
//! A `Notifier` wakes a worker's dispatch loop out of its blocking wait
//! when another thread has queued work for it (a new connection from the
//! acceptor, a receive or send from an application handler, a shutdown).
//!
//! # Implementors
//!
//! - `EventFdNotifier` (default): writes 1 to an eventfd that the worker's
//!   ring keeps a read outstanding on.
//!
//! - `CountingNotifier` (engine tests): counts calls.

use crate::error::Result;

/// Wakes the dispatch loop.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the loop wakes are coalesced
///   (eventfd semantics: counter increments, one read drains).
pub trait Notifier: Send + Sync {
    /// Signal that the worker has new work queued.
    fn notify(&self) -> Result<()>;
}
