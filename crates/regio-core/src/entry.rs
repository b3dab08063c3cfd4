//! Request context and operation types.
//!
//! These are the *lingua franca* between the dispatcher, the backend and
//! the connection slots. A `RequestContext` is nothing more than the slot
//! index: the slot table is the arena, the index is the handle.

use std::os::unix::io::RawFd;

/// Request context: maps 1:1 to a connection slot index.
/// Stored in io_uring's `user_data` field for zero-lookup routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RequestContext(pub u64);

impl RequestContext {
    /// Carried by the completion of the worker's wake read.
    pub const WAKE: Self = Self(u64::MAX);

    #[inline]
    pub fn from_slot(index: u32) -> Self {
        Self(index as u64)
    }

    #[inline]
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn is_wake(self) -> bool {
        self == Self::WAKE
    }
}

/// An asynchronous operation queued on a backend.
///
/// Buffers are raw pointers into a registered region; the slot that
/// issues the operation guarantees they stay valid until its completion.
#[derive(Debug, Clone, Copy)]
pub enum IoOp {
    /// Receive up to `len` bytes into registered buffer `buf_index`.
    Receive {
        ctx: RequestContext,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        buf_index: u16,
    },
    /// Send `len` bytes out of registered buffer `buf_index`.
    Send {
        ctx: RequestContext,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        buf_index: u16,
    },
    /// Close the connection socket.
    Close {
        ctx: RequestContext,
        fd: RawFd,
    },
}

// Safety: the pointers are plain addresses into the worker's registered
// region, which outlives every operation queued against it.
unsafe impl Send for IoOp {}

impl IoOp {
    #[inline]
    pub fn context(&self) -> RequestContext {
        match *self {
            IoOp::Receive { ctx, .. } | IoOp::Send { ctx, .. } | IoOp::Close { ctx, .. } => ctx,
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        match *self {
            IoOp::Receive { fd, .. } | IoOp::Send { fd, .. } | IoOp::Close { fd, .. } => fd,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IoOp::Receive { .. } => "receive",
            IoOp::Send { .. } => "send",
            IoOp::Close { .. } => "close",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_round_trips_slot_index() {
        let ctx = RequestContext::from_slot(4711);
        assert_eq!(ctx.slot(), 4711);
        assert!(!ctx.is_wake());
        assert!(RequestContext::WAKE.is_wake());
    }

    #[test]
    fn test_op_accessors() {
        let op = IoOp::Close { ctx: RequestContext::from_slot(3), fd: 9 };
        assert_eq!(op.context().slot(), 3);
        assert_eq!(op.fd(), 9);
        assert_eq!(op.name(), "close");
    }
}
