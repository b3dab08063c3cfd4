//! `RegisteredPool`: one kernel-registered region per worker.
//!
//! The region is an anonymous private mapping of
//! `segment_length * segment_count` bytes, registered once through a
//! `BufferRegistry`. Segment `i` belongs to connection slot `i` for the
//! life of the pool:
//!
//! ```text
//!  base
//!   │
//!   ▼
//!   ┌──────────────┬──────────────┬─────┬──────────────┐
//!   │  segment 0   │  segment 1   │ ... │ segment N-1  │
//!   └──────────────┴──────────────┴─────┴──────────────┘
//!   0              L              2L    (N-1)L         NL
//! ```
//!
//! Registration is undone exactly once, through `deregister()`, by the
//! worker's dispatch thread when its loop exits. The mapping itself is
//! released in `Drop`, once the last owner (dispatch thread or a live
//! connection handle) lets go.

use regio_core::buffer::{BufferRegistry, SegmentDescriptor};
use regio_core::error::{RegioError, Result};
use regio_core::{kdebug, kwarn};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct RegisteredPool {
    base: NonNull<u8>,
    len: usize,
    segment_length: usize,
    segment_count: usize,
    buf_index: u16,
    registered: AtomicBool,
}

// Safety: the pool hands out raw segment pointers only; exclusive use of a
// segment is enforced by the owning slot's state machine.
unsafe impl Send for RegisteredPool {}
unsafe impl Sync for RegisteredPool {}

impl RegisteredPool {
    /// Map and register `segment_count` segments of `segment_length` bytes.
    pub fn create<R>(registry: &R, segment_length: usize, segment_count: usize) -> Result<Self>
    where
        R: BufferRegistry + ?Sized,
    {
        if segment_length == 0 {
            return Err(RegioError::InvalidConfig("segment length must be non-zero"));
        }
        if segment_count == 0 {
            return Err(RegioError::InvalidConfig("segment count must be non-zero"));
        }
        let len = segment_length
            .checked_mul(segment_count)
            .and_then(NonZeroUsize::new)
            .ok_or(RegioError::InvalidConfig("buffer region too large"))?;

        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| RegioError::BufferAlloc(e as i32))?
        .cast::<u8>();

        let buf_index = match unsafe { registry.register(base.as_ptr(), len.get()) } {
            Ok(idx) => idx,
            Err(e) => {
                unsafe {
                    let _ = munmap(base.cast::<c_void>(), len.get());
                }
                return Err(match e {
                    RegioError::BufferRegister(errno) => RegioError::BufferRegister(errno),
                    other => RegioError::BufferRegister(other.errno().unwrap_or(0)),
                });
            }
        };

        kdebug!(
            "registered pool: {} x {} bytes at {:p} (index {})",
            segment_count, segment_length, base.as_ptr(), buf_index
        );

        Ok(Self {
            base,
            len: len.get(),
            segment_length,
            segment_count,
            buf_index,
            registered: AtomicBool::new(true),
        })
    }

    /// Descriptor of segment `index`.
    #[inline]
    pub fn segment(&self, index: usize) -> SegmentDescriptor {
        debug_assert!(index < self.segment_count, "segment {} out of range", index);
        SegmentDescriptor {
            buf_index: self.buf_index,
            offset: index * self.segment_length,
            length: self.segment_length,
        }
    }

    /// Pointer to the first byte of `desc`.
    #[inline]
    pub fn ptr(&self, desc: &SegmentDescriptor) -> *mut u8 {
        debug_assert!(desc.end() <= self.len);
        unsafe { self.base.as_ptr().add(desc.offset) }
    }

    /// Bytes of `desc`.
    ///
    /// # Safety
    /// No kernel write may be in flight on these bytes, and no `&mut`
    /// view of them may be alive.
    #[inline]
    pub unsafe fn data(&self, desc: &SegmentDescriptor) -> &[u8] {
        std::slice::from_raw_parts(self.ptr(desc), desc.length)
    }

    /// Mutable bytes of `desc`.
    ///
    /// # Safety
    /// No kernel I/O may be in flight on these bytes, and the caller must
    /// be the only one viewing them.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self, desc: &SegmentDescriptor) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr(desc), desc.length)
    }

    /// Undo the kernel registration. Only the first call has an effect.
    pub fn deregister<R>(&self, registry: &R) -> Result<()>
    where
        R: BufferRegistry + ?Sized,
    {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        registry.unregister()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn buf_index(&self) -> u16 {
        self.buf_index
    }

    pub fn segment_length(&self) -> usize {
        self.segment_length
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn region_len(&self) -> usize {
        self.len
    }
}

impl Drop for RegisteredPool {
    fn drop(&mut self) {
        if self.registered.load(Ordering::Acquire) {
            kwarn!("registered pool dropped while still registered");
        }
        unsafe {
            if let Err(e) = munmap(self.base.cast::<c_void>(), self.len) {
                kwarn!("munmap of buffer region failed: {}", e);
            }
        }
    }
}
