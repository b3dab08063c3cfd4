//! Single-use asynchronous completion primitive.
//!
//! A `CompletionCell` carries the result of one receive or send from the
//! dispatch thread to the handler task awaiting it. The cell is reset by
//! the handler side before each operation and completed at most once per
//! use.
//!
//! ```text
//!             poll (handler)                     complete (dispatcher)
//!   EMPTY ──CAS──▶ REGISTERING ──CAS──▶ WAITING ──swap──▶ NOTIFYING
//!     │                 │                                     │
//!     │                 └── CAS fails: completion raced in    ▼
//!     └──────────────────────── swap ──────────────────▶ COMPLETED
//! ```
//!
//! Whichever side holds a transient state (`REGISTERING`, `NOTIFYING`)
//! owns the waker slot. `complete()` only calls `Waker::wake`; with the
//! task pool's waker that re-queues the handler, so no continuation ever
//! runs on the dispatch thread.

use regio_core::error::{RegioError, Result};

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Waker};

const EMPTY: u8 = 0;
const REGISTERING: u8 = 1;
const WAITING: u8 = 2;
const NOTIFYING: u8 = 3;
const COMPLETED: u8 = 4;

pub struct CompletionCell {
    state: AtomicU8,
    waker: UnsafeCell<Option<Waker>>,
    /// Written by the completer before it publishes COMPLETED.
    result: UnsafeCell<Option<Result<usize>>>,
}

// Safety: `waker` is only touched by the party holding REGISTERING or
// NOTIFYING (or by `reset`, which runs with no completion outstanding);
// `result` is written before the Release store of COMPLETED and read only
// after an Acquire load observes it.
unsafe impl Send for CompletionCell {}
unsafe impl Sync for CompletionCell {}

impl Default for CompletionCell {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionCell {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            waker: UnsafeCell::new(None),
            result: UnsafeCell::new(None),
        }
    }

    #[inline]
    fn settle(&self) -> u8 {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s != NOTIFYING {
                return s;
            }
            std::hint::spin_loop();
        }
    }

    /// Prepare for the next operation.
    ///
    /// Must not race `complete()`: the slot state machine only resets a
    /// cell when no operation using it is outstanding.
    pub fn reset(&self) {
        self.settle();
        unsafe {
            *self.waker.get() = None;
            *self.result.get() = None;
        }
        self.state.store(EMPTY, Ordering::Release);
    }

    /// Publish the result and wake the registered waiter, if any.
    ///
    /// Returns false if the cell was already completed for this use.
    pub fn complete(&self, result: Result<usize>) -> bool {
        let prev = self.settle();
        if prev == COMPLETED {
            debug_assert!(false, "completion cell completed twice");
            return false;
        }
        unsafe {
            *self.result.get() = Some(result);
        }

        let prev = self.state.swap(NOTIFYING, Ordering::AcqRel);
        let waker = if prev == WAITING {
            unsafe { (*self.waker.get()).take() }
        } else {
            None
        };
        self.state.store(COMPLETED, Ordering::Release);

        if let Some(w) = waker {
            w.wake();
        }
        true
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.settle() == COMPLETED
    }

    /// The published result, once completed.
    pub fn result(&self) -> Option<Result<usize>> {
        if self.settle() != COMPLETED {
            return None;
        }
        unsafe { (*self.result.get()).clone() }
    }

    /// Register interest or collect the result.
    pub fn poll_result(&self, cx: &mut Context<'_>) -> Poll<Result<usize>> {
        loop {
            match self.settle() {
                COMPLETED => {
                    let r = unsafe { (*self.result.get()).clone() };
                    return Poll::Ready(r.unwrap_or(Err(RegioError::ConnectionClosed)));
                }
                cur @ (EMPTY | WAITING) => {
                    if self
                        .state
                        .compare_exchange(cur, REGISTERING, Ordering::Acquire, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    unsafe {
                        let slot = &mut *self.waker.get();
                        match slot {
                            Some(w) if w.will_wake(cx.waker()) => {}
                            _ => *slot = Some(cx.waker().clone()),
                        }
                    }
                    match self.state.compare_exchange(
                        REGISTERING,
                        WAITING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Poll::Pending,
                        Err(_) => {
                            // A completion arrived mid-registration; it left
                            // the waker to us.
                            unsafe {
                                (*self.waker.get()).take();
                            }
                            continue;
                        }
                    }
                }
                _ => std::hint::spin_loop(),
            }
        }
    }
}

/// Future resolving to the byte count of one receive or send.
#[must_use = "futures do nothing unless awaited"]
pub struct CompletionFuture<'a> {
    inner: Inner<'a>,
}

enum Inner<'a> {
    Pending(&'a CompletionCell),
    Failed(Option<RegioError>),
}

impl<'a> CompletionFuture<'a> {
    pub fn new(cell: &'a CompletionCell) -> Self {
        Self { inner: Inner::Pending(cell) }
    }

    /// A future that resolves immediately with `err`.
    pub fn failed(err: RegioError) -> Self {
        Self { inner: Inner::Failed(Some(err)) }
    }
}

impl Future for CompletionFuture<'_> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Pending(cell) => cell.poll_result(cx),
            Inner::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(RegioError::ConnectionClosed))),
        }
    }
}
