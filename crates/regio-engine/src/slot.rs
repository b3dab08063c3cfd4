//! Connection slots.
//!
//! A slot is created once at worker start-up and recycled forever. Its
//! index is the request context carried through the kernel, and its
//! receive and send buffers are fixed halves of the pool segment with the
//! same index.
//!
//! Every state change is a compare-and-swap on `state`; a transition
//! requested from the wrong state fails with `RegioError::InvalidState`.
//!
//! Slot reuse is gated by a lease count. The engine holds one lease from
//! `start_accept` until its close completes; the application's
//! `Connection` holds a second one until it is dropped. The slot goes back
//! on the free queue when the last lease is released.

use regio_core::buffer::SegmentDescriptor;
use regio_core::error::{RegioError, Result};
use regio_core::state::ConnectionState;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::completion_cell::CompletionCell;

use ConnectionState::*;

pub struct Slot {
    index: u32,
    state: AtomicU8,
    fd: AtomicI32,
    recv: SegmentDescriptor,
    send: SegmentDescriptor,
    pub(crate) recv_cell: CompletionCell,
    pub(crate) send_cell: CompletionCell,
    /// Bytes delivered by the last receive.
    recv_len: AtomicUsize,
    /// Length of the outstanding or last send.
    send_len: AtomicUsize,
    /// A `Connection` handle for this slot is alive.
    attached: AtomicBool,
    leases: AtomicU8,
    peer: Mutex<Option<SocketAddr>>,
}

impl Slot {
    /// Carve `segment` into a receive half of `recv_len` bytes and a send
    /// half holding the rest.
    pub fn new(index: u32, segment: SegmentDescriptor, recv_len: usize) -> Self {
        let (recv, send) = segment.split(recv_len);
        Self {
            index,
            state: AtomicU8::new(Disconnected as u8),
            fd: AtomicI32::new(-1),
            recv,
            send,
            recv_cell: CompletionCell::new(),
            send_cell: CompletionCell::new(),
            recv_len: AtomicUsize::new(0),
            send_len: AtomicUsize::new(0),
            attached: AtomicBool::new(false),
            leases: AtomicU8::new(0),
            peer: Mutex::new(None),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    #[inline]
    pub fn recv_segment(&self) -> SegmentDescriptor {
        self.recv
    }

    #[inline]
    pub fn send_segment(&self) -> SegmentDescriptor {
        self.send
    }

    #[inline]
    pub fn received_len(&self) -> usize {
        self.recv_len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn send_len(&self) -> usize {
        self.send_len.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.peer.lock() {
            Ok(p) => *p,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// CAS from any of `from` into `to`. Returns the state left.
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> Result<ConnectionState> {
        let mut cur = self.state.load(Ordering::SeqCst);
        loop {
            let cur_state = ConnectionState::from(cur);
            if !from.contains(&cur_state) {
                return Err(RegioError::InvalidState { slot: self.index, state: cur_state });
            }
            match self
                .state
                .compare_exchange(cur, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(cur_state),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Disconnected → Accepting. Binds `fd` and takes the engine lease.
    pub fn start_accept(&self, fd: RawFd, peer: Option<SocketAddr>) -> Result<()> {
        self.transition(&[Disconnected], Accepting)?;
        self.fd.store(fd, Ordering::Release);
        self.recv_len.store(0, Ordering::Relaxed);
        self.send_len.store(0, Ordering::Relaxed);
        self.attached.store(false, Ordering::SeqCst);
        self.leases.store(1, Ordering::SeqCst);
        match self.peer.lock() {
            Ok(mut p) => *p = peer,
            Err(poisoned) => *poisoned.into_inner() = peer,
        }
        Ok(())
    }

    /// Accepting → Accepted.
    pub fn finish_accept(&self) -> Result<()> {
        self.transition(&[Accepting], Accepted).map(|_| ())
    }

    /// Accepting → Disconnecting, for a connection the handler never sees.
    pub fn abort_accept(&self) -> Result<()> {
        self.transition(&[Accepting], Disconnecting).map(|_| ())
    }

    fn require(&self, allowed: &[ConnectionState]) -> Result<()> {
        let cur = self.state();
        if allowed.contains(&cur) {
            Ok(())
        } else {
            Err(RegioError::InvalidState { slot: self.index, state: cur })
        }
    }

    /// Accepted | Sent → Receiving.
    ///
    /// The cell is reset before the state flips: once `Receiving` is
    /// visible, teardown may complete it.
    pub fn start_receive(&self) -> Result<()> {
        self.require(&[Accepted, Sent])?;
        self.recv_cell.reset();
        self.transition(&[Accepted, Sent], Receiving).map(|_| ())
    }

    /// Receiving → Received, recording `n` delivered bytes.
    pub fn finish_receive(&self, n: usize) -> Result<()> {
        self.recv_len.store(n, Ordering::Release);
        self.transition(&[Receiving], Received).map(|_| ())
    }

    /// Receiving → Disconnecting, for a receive that ended the connection.
    /// Never passes through `Received`, so the handle cannot start another
    /// operation on a closed peer in between.
    pub fn abort_receive(&self, n: usize) -> Result<()> {
        self.recv_len.store(n, Ordering::Release);
        self.transition(&[Receiving], Disconnecting).map(|_| ())
    }

    /// Accepted | Received | Sent → Sending `len` bytes of the send half.
    pub fn start_send(&self, len: usize) -> Result<()> {
        if len > self.send.length {
            return Err(RegioError::BufferTooSmall {
                requested: len,
                capacity: self.send.length,
            });
        }
        self.require(&[Accepted, Received, Sent])?;
        self.send_cell.reset();
        self.send_len.store(len, Ordering::Release);
        self.transition(&[Accepted, Received, Sent], Sending).map(|_| ())
    }

    /// Sending → Sent.
    pub fn finish_send(&self) -> Result<()> {
        self.transition(&[Sending], Sent).map(|_| ())
    }

    /// Sending → Disconnecting, for a failed send.
    pub fn abort_send(&self) -> Result<()> {
        self.transition(&[Sending], Disconnecting).map(|_| ())
    }

    /// Accepted | Received | Sent → Disconnecting.
    pub fn start_disconnect(&self) -> Result<()> {
        self.transition(&[Accepted, Received, Sent], Disconnecting).map(|_| ())
    }

    /// Disconnecting → Disconnected. Returns the fd that was bound.
    pub fn finish_disconnect(&self) -> Result<RawFd> {
        self.transition(&[Disconnecting], Disconnected)?;
        Ok(self.fd.swap(-1, Ordering::AcqRel))
    }

    /// Any state → Disconnected, for teardown after the ring is gone.
    /// Returns the state the slot was in, or `None` if already free.
    pub(crate) fn force_disconnected(&self) -> Option<(ConnectionState, RawFd)> {
        loop {
            let cur = self.state();
            if cur == Disconnected {
                return None;
            }
            if self.transition(&[cur], Disconnected).is_ok() {
                return Some((cur, self.fd.swap(-1, Ordering::AcqRel)));
            }
        }
    }

    /// Hand the slot to an application handle: second lease.
    pub(crate) fn attach(&self) {
        self.leases.fetch_add(1, Ordering::SeqCst);
        self.attached.store(true, Ordering::SeqCst);
    }

    /// The application handle is going away.
    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Drop one lease. True when it was the last one and the slot may be
    /// reused.
    pub(crate) fn release_lease(&self) -> bool {
        let prev = self.leases.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "slot {} lease underflow", self.index);
        prev == 1
    }

    #[inline]
    pub fn leases(&self) -> u8 {
        self.leases.load(Ordering::SeqCst)
    }
}
