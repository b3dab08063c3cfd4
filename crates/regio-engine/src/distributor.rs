//! The acceptor thread.
//!
//! A single `regio-acceptor` thread blocks in `accept(2)` on the listening
//! socket and hands each new connection to the next worker in round-robin
//! order. A worker with no free slot refuses the connection, which is
//! closed right away; it is not retried on another worker.

use regio_core::error::{RegioError, Result};
use regio_core::{kdebug, kerror, kinfo, ktrace, kwarn};

use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::worker::WorkerHandle;

/// Cycles 0, 1, ..., n-1, 0, ...
#[derive(Debug, Clone)]
pub struct RoundRobin {
    next: usize,
    n: usize,
}

impl RoundRobin {
    pub fn new(n: usize) -> Self {
        Self { next: 0, n: n.max(1) }
    }

    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> usize {
        let i = self.next;
        self.next = (i + 1) % self.n;
        i
    }
}

pub struct Distributor {
    listen_fd: RawFd,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Distributor {
    /// Start accepting on `listener` for `workers`.
    pub fn start(listener: TcpListener, workers: Vec<WorkerHandle>) -> Result<Distributor> {
        if workers.is_empty() {
            return Err(RegioError::InvalidConfig("no workers to distribute to"));
        }
        let listen_fd = listener.as_raw_fd();
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("regio-acceptor".into())
                .spawn(move || accept_loop(listener, workers, stop))
                .map_err(|_| RegioError::Spawn)?
        };
        Ok(Distributor {
            listen_fd,
            stop,
            thread: Some(thread),
        })
    }

    /// Stop accepting and wait for the acceptor thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(t) = self.thread.take() else { return };
        self.stop.store(true, Ordering::Release);
        // Wakes the blocked accept(2) with EINVAL.
        unsafe {
            libc::shutdown(self.listen_fd, libc::SHUT_RDWR);
        }
        if t.join().is_err() {
            kwarn!("acceptor thread panicked");
        }
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, workers: Vec<WorkerHandle>, stop: Arc<AtomicBool>) {
    let mut rr = RoundRobin::new(workers.len());
    kinfo!(
        "acceptor: listening on {:?} for {} workers",
        listener.local_addr().ok(),
        workers.len()
    );

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let worker = &workers[rr.next()];
                match worker.assign(stream, Some(peer)) {
                    Ok(slot) => ktrace!("acceptor: {} -> worker {} slot {}", peer, worker.id(), slot),
                    Err(RegioError::NoFreeSlot) => {
                        kdebug!("acceptor: worker {} full, refused {}", worker.id(), peer)
                    }
                    Err(e) => kwarn!("acceptor: worker {} refused {}: {}", worker.id(), peer, e),
                }
            }
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                if !retry_accept(&e) {
                    kerror!("acceptor: accept failed: {}", e);
                    break;
                }
            }
        }
    }
    kinfo!("acceptor: stopped");
}

/// Whether `accept(2)` should be retried after `e`, backing off first when
/// out of descriptors.
fn retry_accept(e: &io::Error) -> bool {
    match e.raw_os_error() {
        Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) => true,
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            kwarn!("acceptor: {}; backing off", e);
            thread::sleep(Duration::from_millis(10));
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_spreads_evenly() {
        let mut rr = RoundRobin::new(3);
        let mut counts = [0usize; 3];
        for _ in 0..10 {
            counts[rr.next()] += 1;
        }
        assert_eq!(counts, [4, 3, 3]);
    }

    #[test]
    fn test_round_robin_order() {
        let mut rr = RoundRobin::new(2);
        let seq: Vec<usize> = (0..5).map(|_| rr.next()).collect();
        assert_eq!(seq, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_transient_errors_are_retried() {
        assert!(retry_accept(&io::Error::from_raw_os_error(libc::ECONNABORTED)));
        assert!(retry_accept(&io::Error::from_raw_os_error(libc::EINTR)));
        assert!(!retry_accept(&io::Error::from_raw_os_error(libc::EBADF)));
    }
}
