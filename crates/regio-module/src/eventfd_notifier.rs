//! `EventFdNotifier`: default `Notifier` implementation.
//!
//! Each worker owns one eventfd. Its ring keeps a read outstanding on it;
//! `notify()` writes 1, which completes that read and ends the worker's
//! blocking wait. Writes before the read is re-armed add up in the
//! eventfd counter and are drained by a single read.
//!
//! The eventfd is blocking: io_uring honours `O_NONBLOCK` and would
//! complete the armed read with `-EAGAIN` instead of waiting on it.

use regio_core::error::{RegioError, Result};
use regio_core::notifier::Notifier;

use std::os::unix::io::RawFd;

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Create a new eventfd. The notifier closes it on Drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(RegioError::last_os_error(RegioError::Notifier));
        }
        Ok(Self { fd })
    }

    /// The descriptor the worker's ring reads from.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // Counter saturated: a wake-up is already pending.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(RegioError::Notifier(errno));
        }
        Ok(())
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_coalesce() {
        let n = EventFdNotifier::create().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();

        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(n.fd(), &mut val as *mut u64 as *mut libc::c_void, 8)
        };
        assert_eq!(ret, 8);
        assert_eq!(val, 3);
    }
}
