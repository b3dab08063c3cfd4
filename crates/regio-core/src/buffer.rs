//! Registered buffer abstraction.
//!
//! A worker's buffers live in one contiguous region registered with the
//! kernel once. The region is partitioned into fixed-length segments, one
//! per connection slot, described by `SegmentDescriptor`s.
//!
//! # Implementors of `BufferRegistry`
//!
//! - `UringBackend`: `IORING_REGISTER_BUFFERS` / `IORING_UNREGISTER_BUFFERS`
//!   on the worker's ring. Registration pins the pages.
//!
//! - `MemRegistry` (engine tests): bookkeeping only.

use crate::error::Result;

/// A fixed window into a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Index of the region in the registry's buffer table.
    pub buf_index: u16,
    /// Byte offset from the start of the region.
    pub offset: usize,
    /// Length in bytes.
    pub length: usize,
}

impl SegmentDescriptor {
    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Split into `[offset, offset + head)` and the remainder.
    ///
    /// Slots carve their receive and send buffers out of one segment this way.
    #[inline]
    pub fn split(&self, head: usize) -> (SegmentDescriptor, SegmentDescriptor) {
        debug_assert!(head <= self.length);
        (
            SegmentDescriptor {
                buf_index: self.buf_index,
                offset: self.offset,
                length: head,
            },
            SegmentDescriptor {
                buf_index: self.buf_index,
                offset: self.offset + head,
                length: self.length - head,
            },
        )
    }

    #[inline]
    pub fn overlaps(&self, other: &SegmentDescriptor) -> bool {
        self.buf_index == other.buf_index && self.offset < other.end() && other.offset < self.end()
    }
}

/// Registers memory regions with the kernel I/O subsystem.
///
/// **Contract:**
/// - A region is registered once and unregistered once.
/// - The region must stay mapped from `register()` until `unregister()`
///   has returned (or the registry itself is gone).
pub trait BufferRegistry {
    /// Register `len` bytes at `base`. Returns the buffer index to use
    /// in fixed-buffer operations.
    ///
    /// # Safety
    /// `base..base+len` must be a valid, writable mapping that outlives
    /// the registration.
    unsafe fn register(&self, base: *mut u8, len: usize) -> Result<u16>;

    /// Drop every registration made through this registry.
    fn unregister(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_covers_segment() {
        let seg = SegmentDescriptor { buf_index: 0, offset: 128, length: 64 };
        let (head, tail) = seg.split(24);
        assert_eq!(head.offset, 128);
        assert_eq!(head.length, 24);
        assert_eq!(tail.offset, 152);
        assert_eq!(tail.length, 40);
        assert_eq!(tail.end(), seg.end());
        assert!(!head.overlaps(&tail));
    }

    #[test]
    fn test_overlap_requires_same_region() {
        let a = SegmentDescriptor { buf_index: 0, offset: 0, length: 16 };
        let b = SegmentDescriptor { buf_index: 0, offset: 8, length: 16 };
        let c = SegmentDescriptor { buf_index: 1, offset: 8, length: 16 };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
