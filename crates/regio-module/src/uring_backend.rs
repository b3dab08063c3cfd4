//! `UringBackend`: default `IoBackend` and `BufferRegistry`.
//!
//! One io_uring per worker. Receives and sends are fixed-buffer reads and
//! writes against the worker's single registered region (buffer index 0);
//! disconnects are `IORING_OP_CLOSE`. Notification is armed by keeping one
//! read outstanding on the worker's wake eventfd, tagged with
//! `RequestContext::WAKE`.
//!
//! The dispatch thread is the only user of the ring.

use regio_core::buffer::BufferRegistry;
use regio_core::entry::{IoOp, RequestContext};
use regio_core::error::{RegioError, Result};
use regio_core::io_backend::{IoBackend, IoCompletion};
use regio_core::{kdebug, ktrace};

use io_uring::{opcode, squeue, types, IoUring};

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::eventfd_notifier::EventFdNotifier;

/// Configuration for UringBackend.
pub struct UringConfig {
    /// Number of SQ entries. Must be a power of 2.
    pub sq_entries: u32,
    /// Number of CQ entries. Defaults to 2 * sq_entries.
    pub cq_entries: Option<u32>,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            cq_entries: None,
        }
    }
}

pub struct UringBackend {
    ring: IoUring,
    wake: Arc<EventFdNotifier>,
    /// Target of the armed eventfd read. Boxed so the address is stable.
    wake_buf: Box<[u8; 8]>,
    armed: bool,
    inflight: usize,
    registered: AtomicBool,
}

fn errno_of(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(-1)
}

impl UringBackend {
    pub fn new(config: UringConfig, wake: Arc<EventFdNotifier>) -> Result<Self> {
        let mut builder = IoUring::builder();
        builder.setup_cqsize(config.cq_entries.unwrap_or(config.sq_entries * 2));
        #[cfg(feature = "sqpoll")]
        builder.setup_sqpoll(2000);

        let ring = builder
            .build(config.sq_entries)
            .map_err(|e| RegioError::RingSetup(errno_of(&e)))?;

        kdebug!(
            "io_uring up: fd={} sq={} cq={}",
            ring.as_raw_fd(),
            ring.params().sq_entries(),
            ring.params().cq_entries()
        );

        Ok(Self {
            ring,
            wake,
            wake_buf: Box::new([0u8; 8]),
            armed: false,
            inflight: 0,
            registered: AtomicBool::new(false),
        })
    }

    /// The io_uring fd.
    pub fn fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    /// The notifier whose eventfd this ring watches.
    pub fn notifier(&self) -> &Arc<EventFdNotifier> {
        &self.wake
    }

    fn build_sqe(op: &IoOp) -> squeue::Entry {
        let sqe = match *op {
            IoOp::Receive { fd, buf, len, buf_index, .. } => {
                opcode::ReadFixed::new(types::Fd(fd), buf, len, buf_index).build()
            }
            IoOp::Send { fd, buf, len, buf_index, .. } => {
                opcode::WriteFixed::new(types::Fd(fd), buf, len, buf_index).build()
            }
            IoOp::Close { fd, .. } => opcode::Close::new(types::Fd(fd)).build(),
        };
        sqe.user_data(op.context().0)
    }

    /// Push one SQE, flushing the queue to the kernel once if it is full.
    fn push_sqe(&mut self, sqe: &squeue::Entry) -> Result<()> {
        // Safety: every buffer an SQE references lives in the registered
        // region or in `wake_buf`, both of which outlive the ring's use.
        unsafe {
            if self.ring.submission().push(sqe).is_ok() {
                return Ok(());
            }
        }
        self.ring
            .submit()
            .map_err(|e| RegioError::Submit(errno_of(&e)))?;
        unsafe {
            self.ring
                .submission()
                .push(sqe)
                .map_err(|_| RegioError::RingFull)
        }
    }
}

impl BufferRegistry for UringBackend {
    unsafe fn register(&self, base: *mut u8, len: usize) -> Result<u16> {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Err(RegioError::BufferRegister(libc::EBUSY));
        }
        let iov = libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: len,
        };
        if let Err(e) = self.ring.submitter().register_buffers(&[iov]) {
            self.registered.store(false, Ordering::Release);
            return Err(RegioError::BufferRegister(errno_of(&e)));
        }
        Ok(0)
    }

    fn unregister(&self) -> Result<()> {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.ring
            .submitter()
            .unregister_buffers()
            .map_err(|e| RegioError::BufferRegister(errno_of(&e)))
    }
}

impl IoBackend for UringBackend {
    fn push(&mut self, op: &IoOp) -> Result<()> {
        let sqe = Self::build_sqe(op);
        self.push_sqe(&sqe)?;
        self.inflight += 1;
        ktrace!("push {} slot={} fd={}", op.name(), op.context().slot(), op.fd());
        Ok(())
    }

    fn arm(&mut self) -> Result<()> {
        if self.armed {
            return Ok(());
        }
        let sqe = opcode::Read::new(
            types::Fd(self.wake.fd()),
            self.wake_buf.as_mut_ptr(),
            self.wake_buf.len() as u32,
        )
        .build()
        .user_data(RequestContext::WAKE.0);
        self.push_sqe(&sqe)?;
        self.armed = true;
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn submit_and_wait(&mut self, min_complete: usize) -> Result<usize> {
        self.ring
            .submit_and_wait(min_complete)
            .map_err(|e| RegioError::Submit(errno_of(&e)))
    }

    fn poll_completions(&mut self, buf: &mut [IoCompletion], max: usize) -> usize {
        let limit = max.min(buf.len());
        let mut count = 0;
        let mut cq = self.ring.completion();
        while count < limit {
            let Some(cqe) = cq.next() else { break };
            let ctx = RequestContext(cqe.user_data());
            if ctx.is_wake() {
                self.armed = false;
                continue;
            }
            buf[count] = IoCompletion {
                ctx,
                result: cqe.result(),
                flags: cqe.flags(),
            };
            count += 1;
            self.inflight = self.inflight.saturating_sub(1);
        }
        count
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn capacity(&self) -> usize {
        self.ring.params().sq_entries() as usize
    }

    fn shutdown(&mut self) {
        // Drain remaining CQEs; the ring's own Drop closes the fd and
        // unmaps the queues.
        let mut buf = [IoCompletion::EMPTY; 64];
        while self.poll_completions(&mut buf, 64) > 0 {}
        if let Err(e) = self.unregister() {
            kdebug!("unregister on shutdown: {}", e);
        }
        self.inflight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regio_core::notifier::Notifier;

    fn backend() -> Option<UringBackend> {
        let wake = Arc::new(EventFdNotifier::create().ok()?);
        match UringBackend::new(UringConfig { sq_entries: 8, cq_entries: None }, wake) {
            Ok(b) => Some(b),
            Err(e) => {
                eprintln!("io_uring unavailable, skipping: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_wake_read_is_consumed_and_disarms() {
        let Some(mut ring) = backend() else { return };
        ring.arm().unwrap();
        assert!(ring.is_armed());
        ring.submit_and_wait(0).unwrap();

        ring.notifier().notify().unwrap();
        ring.submit_and_wait(1).unwrap();

        let mut buf = [IoCompletion::EMPTY; 4];
        assert_eq!(ring.poll_completions(&mut buf, 4), 0);
        assert!(!ring.is_armed());
        assert_eq!(ring.inflight(), 0);
    }

    #[test]
    fn test_close_completion_routes_by_context() {
        let Some(mut ring) = backend() else { return };
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        assert!(fd >= 0);

        let ctx = RequestContext::from_slot(5);
        ring.push(&IoOp::Close { ctx, fd }).unwrap();
        assert_eq!(ring.inflight(), 1);
        ring.submit_and_wait(1).unwrap();

        let mut buf = [IoCompletion::EMPTY; 4];
        let n = ring.poll_completions(&mut buf, 4);
        assert_eq!(n, 1);
        assert_eq!(buf[0].ctx, ctx);
        assert_eq!(buf[0].result, 0);
        assert_eq!(ring.inflight(), 0);
    }

    #[test]
    fn test_second_registration_is_busy() {
        let Some(ring) = backend() else { return };
        let mut region = vec![0u8; 4096];
        let first = unsafe { ring.register(region.as_mut_ptr(), region.len()) };
        if let Err(e) = first {
            // RLIMIT_MEMLOCK can refuse pinning in constrained sandboxes.
            eprintln!("buffer registration refused, skipping: {}", e);
            return;
        }
        assert_eq!(first.unwrap(), 0);
        let second = unsafe { ring.register(region.as_mut_ptr(), region.len()) };
        assert_eq!(second, Err(RegioError::BufferRegister(libc::EBUSY)));
        ring.unregister().unwrap();
    }
}
