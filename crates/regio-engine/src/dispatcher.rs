//! The per-worker dispatch loop.
//!
//! One thread per worker runs `Dispatcher::run`. Each turn:
//!
//! 1. arm the wake-up read,
//! 2. submit queued operations and wait for at least one completion,
//! 3. drain completions and route each by its slot's state,
//! 4. drain the inbox, turning handler requests into ring operations.
//!
//! The loop never runs application code. A completion only flips a slot
//! state and completes a `CompletionCell`, whose waker re-queues the
//! handler on the task pool.

use regio_core::entry::{IoOp, RequestContext};
use regio_core::error::{RegioError, Result};
use regio_core::executor::Executor;
use regio_core::io_backend::{IoBackend, IoCompletion};
use regio_core::state::ConnectionState;
use regio_core::{kdebug, kerror, kinfo, ktrace, kwarn};

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::connection::{Connection, Handler};
use crate::slot::Slot;
use crate::stats::bump;
use crate::worker::{Command, WorkerShared};

pub(crate) struct Dispatcher<B: IoBackend> {
    backend: B,
    shared: Arc<WorkerShared>,
    executor: Arc<dyn Executor>,
    handler: Handler,
    batch: Vec<IoCompletion>,
    grace: Duration,
    /// Set once shutdown was observed.
    drain_deadline: Option<Instant>,
}

impl<B: IoBackend> Dispatcher<B> {
    pub(crate) fn new(
        backend: B,
        shared: Arc<WorkerShared>,
        executor: Arc<dyn Executor>,
        handler: Handler,
        completion_batch: usize,
        grace: Duration,
    ) -> Self {
        Self {
            backend,
            shared,
            executor,
            handler,
            batch: vec![IoCompletion::EMPTY; completion_batch.max(1)],
            grace,
            drain_deadline: None,
        }
    }

    pub(crate) fn run(mut self) {
        kinfo!(
            "worker {}: dispatching {} slots (sq capacity {})",
            self.shared.id,
            self.shared.slots.len(),
            self.backend.capacity()
        );
        while self.turn(true) {}
        self.finish();
    }

    /// One pass of the loop. Returns false once the worker should stop.
    pub(crate) fn turn(&mut self, block: bool) -> bool {
        if self.drain_deadline.is_none() && self.shared.is_shutting_down() {
            self.begin_drain();
        }
        if let Some(deadline) = self.drain_deadline {
            if self.backend.inflight() == 0 && self.shared.inbox.is_empty() {
                return false;
            }
            if Instant::now() >= deadline {
                kwarn!(
                    "worker {}: grace period over with {} operations in flight",
                    self.shared.id,
                    self.backend.inflight()
                );
                return false;
            }
        }

        if let Err(e) = self.backend.arm() {
            kwarn!("worker {}: arm failed: {}", self.shared.id, e);
        }

        let wait = if block && self.drain_deadline.is_none() && self.backend.is_armed() {
            1
        } else {
            0
        };
        if let Err(e) = self.backend.submit_and_wait(wait) {
            // EINTR, or EBUSY with the completion queue full: harvest and retry.
            kdebug!("worker {}: submit_and_wait: {}", self.shared.id, e);
        }

        let cap = self.batch.len();
        let mut completed = 0;
        loop {
            let n = self.backend.poll_completions(&mut self.batch, cap);
            for i in 0..n {
                let c = self.batch[i];
                route(&mut self.backend, &self.shared, c);
            }
            completed += n;
            if n < cap {
                break;
            }
        }

        let commands = self.drain_inbox();

        if self.drain_deadline.is_some() && block && completed == 0 && commands == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn drain_inbox(&mut self) -> usize {
        let mut n = 0;
        while let Some(cmd) = self.shared.inbox.pop() {
            n += 1;
            match cmd {
                Command::Accept(i) => self.on_accept(i),
                Command::Receive(i) => issue_receive(&mut self.backend, &self.shared, i),
                Command::Send(i) => issue_send(&mut self.backend, &self.shared, i),
                Command::Disconnect(i) => {
                    if let Some(slot) = self.shared.slot(i) {
                        issue_close(&mut self.backend, &self.shared, slot);
                    }
                }
            }
        }
        n
    }

    /// Take over a freshly accepted socket and start its handler.
    fn on_accept(&mut self, index: u32) {
        let shared = &self.shared;
        let Some(slot) = shared.slot(index) else { return };

        if self.drain_deadline.is_some() {
            if slot.abort_accept().is_ok() {
                issue_close(&mut self.backend, shared, slot);
            }
            return;
        }

        if !shared.use_nagle {
            if let Err(e) = set_nodelay(slot.fd()) {
                kwarn!("worker {}: TCP_NODELAY on slot {}: {}", shared.id, index, e);
                bump(&shared.stats.errors, 1);
                if slot.abort_accept().is_ok() {
                    issue_close(&mut self.backend, shared, slot);
                }
                return;
            }
        }

        if let Err(e) = slot.finish_accept() {
            violation(shared, index, &e);
            return;
        }
        bump(&shared.stats.accepts, 1);
        ktrace!("worker {}: slot {} accepted from {:?}", shared.id, index, slot.peer_addr());

        let conn = Connection::new(Arc::clone(shared), index);
        let task = (self.handler)(conn);
        if let Err(e) = self.executor.spawn(task) {
            // Dropping the task dropped the connection, which queued its
            // disconnect.
            kwarn!("worker {}: handler spawn failed for slot {}: {}", shared.id, index, e);
            bump(&shared.stats.errors, 1);
        }
    }

    /// Stop taking new work: close idle connections and shut the sockets
    /// of pending ones so their operations complete promptly.
    fn begin_drain(&mut self) {
        self.drain_deadline = Some(Instant::now() + self.grace);
        kinfo!(
            "worker {}: draining, {} operations in flight",
            self.shared.id,
            self.backend.inflight()
        );
        for slot in self.shared.slots.iter() {
            match slot.state() {
                ConnectionState::Accepted | ConnectionState::Received | ConnectionState::Sent => {
                    disconnect(&mut self.backend, &self.shared, slot);
                }
                ConnectionState::Receiving | ConnectionState::Sending => unsafe {
                    libc::shutdown(slot.fd(), libc::SHUT_RDWR);
                },
                _ => {}
            }
        }
    }

    /// Tear the worker down after the loop has stopped.
    pub(crate) fn finish(self) {
        let Dispatcher { mut backend, shared, .. } = self;

        shared.mark_exited();
        shared.fail_orphans();

        if let Err(e) = shared.pool.deregister(&backend) {
            kwarn!("worker {}: buffer deregistration failed: {}", shared.id, e);
        }
        backend.shutdown();
        drop(backend);

        let mut forced = 0;
        for slot in shared.slots.iter() {
            let Some((prev, fd)) = slot.force_disconnected() else { continue };
            forced += 1;
            match prev {
                ConnectionState::Receiving => {
                    slot.recv_cell.complete(Err(RegioError::ConnectionClosed));
                }
                ConnectionState::Sending => {
                    slot.send_cell.complete(Err(RegioError::ConnectionClosed));
                }
                _ => {}
            }
            // A Disconnecting slot's close was already handed to the kernel.
            if prev != ConnectionState::Disconnecting && fd >= 0 {
                unsafe { libc::close(fd); }
            }
            bump(&shared.stats.disconnects, 1);
            shared.release(slot.index());
        }

        kinfo!(
            "worker {}: stopped ({} connections force-closed) {}",
            shared.id,
            forced,
            shared.stats.snapshot()
        );
    }
}

fn violation(shared: &WorkerShared, index: u32, err: &RegioError) {
    kerror!("worker {}: slot {}: {}", shared.id, index, err);
    bump(&shared.stats.protocol_violations, 1);
}

/// Route one completion by the state of the slot it names.
fn route<B: IoBackend>(backend: &mut B, shared: &WorkerShared, c: IoCompletion) {
    let index = c.ctx.slot();
    let Some(slot) = shared.slot(index) else {
        kerror!("worker {}: completion for unknown slot {}", shared.id, index);
        bump(&shared.stats.protocol_violations, 1);
        return;
    };
    match slot.state() {
        ConnectionState::Receiving => on_receive(backend, shared, slot, c.result),
        ConnectionState::Sending => on_send(backend, shared, slot, c.result),
        ConnectionState::Disconnecting => on_close(shared, slot, c.result),
        state => {
            kerror!(
                "worker {}: unexpected completion ({}) for slot {} in state {}",
                shared.id, c.result, index, state
            );
            bump(&shared.stats.protocol_violations, 1);
        }
    }
}

fn on_receive<B: IoBackend>(backend: &mut B, shared: &WorkerShared, slot: &Slot, res: i32) {
    let n = res.max(0) as usize;

    // Zero bytes is the peer's orderly shutdown. Go straight to
    // Disconnecting so the handler observes the new state when it wakes.
    if res <= 0 {
        if let Err(e) = slot.abort_receive(0) {
            violation(shared, slot.index(), &e);
            return;
        }
        let outcome = if res < 0 {
            kdebug!("worker {}: receive on slot {} failed: errno {}", shared.id, slot.index(), -res);
            bump(&shared.stats.errors, 1);
            Err(RegioError::Io(-res))
        } else {
            bump(&shared.stats.receives, 1);
            Ok(0)
        };
        issue_close(backend, shared, slot);
        slot.recv_cell.complete(outcome);
        return;
    }

    if let Err(e) = slot.finish_receive(n) {
        violation(shared, slot.index(), &e);
        return;
    }
    bump(&shared.stats.receives, 1);
    bump(&shared.stats.bytes_in, n as u64);
    if !slot.is_attached() {
        disconnect(backend, shared, slot);
    }
    slot.recv_cell.complete(Ok(n));
}

fn on_send<B: IoBackend>(backend: &mut B, shared: &WorkerShared, slot: &Slot, res: i32) {
    if res < 0 {
        if let Err(e) = slot.abort_send() {
            violation(shared, slot.index(), &e);
            return;
        }
        kdebug!("worker {}: send on slot {} failed: errno {}", shared.id, slot.index(), -res);
        bump(&shared.stats.errors, 1);
        issue_close(backend, shared, slot);
        slot.send_cell.complete(Err(RegioError::Io(-res)));
        return;
    }

    if let Err(e) = slot.finish_send() {
        violation(shared, slot.index(), &e);
        return;
    }
    bump(&shared.stats.sends, 1);
    bump(&shared.stats.bytes_out, res as u64);
    if !slot.is_attached() {
        disconnect(backend, shared, slot);
    }
    slot.send_cell.complete(Ok(res as usize));
}

fn on_close(shared: &WorkerShared, slot: &Slot, res: i32) {
    if res < 0 {
        kdebug!("worker {}: close on slot {}: errno {}", shared.id, slot.index(), -res);
    }
    match slot.finish_disconnect() {
        Ok(_) => {
            bump(&shared.stats.disconnects, 1);
            ktrace!("worker {}: slot {} disconnected", shared.id, slot.index());
            shared.release(slot.index());
        }
        Err(e) => violation(shared, slot.index(), &e),
    }
}

/// Idle → Disconnecting, then queue the close. A no-op if the slot is
/// not idle (someone else already started tearing it down).
fn disconnect<B: IoBackend>(backend: &mut B, shared: &WorkerShared, slot: &Slot) {
    if slot.start_disconnect().is_ok() {
        issue_close(backend, shared, slot);
    }
}

/// Queue the close of a `Disconnecting` slot, or close synchronously if
/// the ring has no room.
fn issue_close<B: IoBackend>(backend: &mut B, shared: &WorkerShared, slot: &Slot) {
    let op = IoOp::Close {
        ctx: RequestContext::from_slot(slot.index()),
        fd: slot.fd(),
    };
    if let Err(e) = backend.push(&op) {
        kwarn!("worker {}: queueing close of slot {}: {}", shared.id, slot.index(), e);
        shared.close_now(slot.index());
    }
}

fn issue_receive<B: IoBackend>(backend: &mut B, shared: &WorkerShared, index: u32) {
    let Some(slot) = shared.slot(index) else { return };
    let seg = slot.recv_segment();
    let op = IoOp::Receive {
        ctx: RequestContext::from_slot(index),
        fd: slot.fd(),
        buf: shared.pool.ptr(&seg),
        len: seg.length as u32,
        buf_index: seg.buf_index,
    };
    if let Err(e) = backend.push(&op) {
        bump(&shared.stats.errors, 1);
        if slot.abort_receive(0).is_ok() {
            issue_close(backend, shared, slot);
            slot.recv_cell.complete(Err(e));
        }
    }
}

fn issue_send<B: IoBackend>(backend: &mut B, shared: &WorkerShared, index: u32) {
    let Some(slot) = shared.slot(index) else { return };
    let seg = slot.send_segment();
    let op = IoOp::Send {
        ctx: RequestContext::from_slot(index),
        fd: slot.fd(),
        buf: shared.pool.ptr(&seg),
        len: slot.send_len() as u32,
        buf_index: seg.buf_index,
    };
    if let Err(e) = backend.push(&op) {
        bump(&shared.stats.errors, 1);
        if slot.abort_send().is_ok() {
            issue_close(backend, shared, slot);
            slot.send_cell.complete(Err(e));
        }
    }
}

fn set_nodelay(fd: RawFd) -> Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(RegioError::last_os_error(RegioError::Socket));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{poll_once, rig, Rig};
    use std::task::Poll;

    use ConnectionState::*;

    fn receive_op(r: &Rig) -> Option<(u32, *mut u8, u32)> {
        r.script().pushed.iter().rev().find_map(|op| match *op {
            IoOp::Receive { ctx, buf, len, .. } => Some((ctx.slot(), buf, len)),
            _ => None,
        })
    }

    fn send_op(r: &Rig) -> Option<(u32, *const u8, u32)> {
        r.script().pushed.iter().rev().find_map(|op| match *op {
            IoOp::Send { ctx, buf, len, .. } => Some((ctx.slot(), buf, len)),
            _ => None,
        })
    }

    fn closes(r: &Rig) -> usize {
        r.script()
            .pushed
            .iter()
            .filter(|op| matches!(op, IoOp::Close { .. }))
            .count()
    }

    #[test]
    fn test_accept_hands_connection_to_handler() {
        let mut r = rig(2, 32, 32);
        let conn = r.accept();
        assert_eq!(conn.id(), 0);
        assert_eq!(conn.state(), Accepted);
        assert!(conn.peer_addr().is_some());
        assert_eq!(r.executor.spawned(), 1);
        assert_eq!(r.shared.stats.snapshot().accepts, 1);
        assert_eq!(r.shared.free_slots(), 1);
    }

    #[test]
    fn test_ping_echo_round_trip() {
        let mut r = rig(1, 32, 32);
        let mut conn = r.accept();

        {
            let mut fut = conn.receive();
            assert!(poll_once(&mut fut).is_pending());
            r.d.turn(false);

            let (slot, buf, len) = receive_op(&r).expect("receive queued");
            assert_eq!(slot, 0);
            assert_eq!(len, 32);
            // Play the kernel: land the payload in the registered buffer.
            unsafe { std::ptr::copy_nonoverlapping(b"PING".as_ptr(), buf, 4) };
            r.complete(0, 4);
            r.d.turn(false);

            assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(4)));
        }
        assert_eq!(conn.state(), Received);
        assert_eq!(conn.received(), b"PING");

        {
            let (rx, tx) = conn.buffers();
            tx[..rx.len()].copy_from_slice(rx);
        }
        {
            let mut fut = conn.send(4).expect("send accepted");
            r.d.turn(false);

            let (slot, buf, len) = send_op(&r).expect("send queued");
            assert_eq!((slot, len), (0, 4));
            let out = unsafe { std::slice::from_raw_parts(buf, 4) };
            assert_eq!(out, b"PING");

            r.complete(0, 4);
            r.d.turn(false);
            assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(4)));
        }
        assert_eq!(conn.state(), Sent);

        let s = r.shared.stats.snapshot();
        assert_eq!((s.receives, s.sends), (1, 1));
        assert_eq!((s.bytes_in, s.bytes_out), (4, 4));
        assert_eq!(s.protocol_violations, 0);
    }

    #[test]
    fn test_zero_byte_receive_disconnects() {
        let mut r = rig(1, 16, 16);
        let mut conn = r.accept();
        {
            let mut fut = conn.receive();
            r.d.turn(false);
            r.complete(0, 0);
            r.d.turn(false);
            assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(0)));
        }
        assert_eq!(conn.state(), Disconnecting);
        assert_eq!(closes(&r), 1);
        assert!(matches!(conn.send(1), Err(RegioError::InvalidState { .. })));

        r.complete(0, 0);
        r.d.turn(false);
        assert_eq!(conn.state(), Disconnected);
        // The handle still holds its lease.
        assert_eq!(r.shared.free_slots(), 0);
        drop(conn);
        assert_eq!(r.shared.free_slots(), 1);
        assert_eq!(r.shared.stats.snapshot().disconnects, 1);
    }

    #[test]
    fn test_failed_receive_reports_errno_and_disconnects() {
        let mut r = rig(1, 16, 16);
        let mut conn = r.accept();
        {
            let mut fut = conn.receive();
            r.d.turn(false);
            r.complete(0, -libc::ECONNRESET);
            r.d.turn(false);
            assert_eq!(
                poll_once(&mut fut),
                Poll::Ready(Err(RegioError::Io(libc::ECONNRESET)))
            );
        }
        assert_eq!(conn.state(), Disconnecting);
        assert_eq!(r.shared.stats.snapshot().errors, 1);
    }

    #[test]
    fn test_handle_dropped_mid_receive_closes_on_completion() {
        let mut r = rig(1, 16, 16);
        let mut conn = r.accept();
        drop(conn.receive());
        r.d.turn(false);
        drop(conn);
        assert_eq!(r.shared.slots[0].state(), Receiving);
        assert_eq!(closes(&r), 0);

        r.complete(0, 3);
        r.d.turn(false);
        assert_eq!(r.shared.slots[0].state(), Disconnecting);
        assert_eq!(closes(&r), 1);

        r.complete(0, 0);
        r.d.turn(false);
        assert_eq!(r.shared.slots[0].state(), Disconnected);
        assert_eq!(r.shared.free_slots(), 1);
    }

    #[test]
    fn test_explicit_disconnect_from_idle() {
        let mut r = rig(1, 16, 16);
        let conn = r.accept();
        conn.disconnect();
        assert_eq!(r.shared.slots[0].state(), Disconnecting);
        r.d.turn(false);
        assert_eq!(closes(&r), 1);
        r.complete(0, 0);
        r.d.turn(false);
        assert_eq!(r.shared.free_slots(), 1);
    }

    #[test]
    fn test_slot_reused_with_same_index_and_buffer() {
        let mut r = rig(1, 16, 16);
        let mut bufs = Vec::new();
        for _ in 0..3 {
            let mut conn = r.accept();
            assert_eq!(conn.id(), 0);
            {
                let mut fut = conn.receive();
                r.d.turn(false);
                bufs.push(receive_op(&r).map(|(_, b, _)| b as usize));
                r.complete(0, 0);
                r.d.turn(false);
                assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(0)));
            }
            drop(conn);
            r.complete(0, 0);
            r.d.turn(false);
            assert_eq!(r.shared.free_slots(), 1);
        }
        assert!(bufs.iter().all(|b| b.is_some() && *b == bufs[0]));
        assert_eq!(r.shared.stats.snapshot().accepts, 3);
    }

    #[test]
    fn test_shutdown_drains_then_stops() {
        let mut r = rig(2, 16, 16);
        let conn = r.accept();
        r.shared.request_shutdown();

        assert!(r.d.turn(false));
        assert_eq!(conn.state(), Disconnecting);
        assert_eq!(closes(&r), 1);

        r.complete(0, 0);
        assert!(r.d.turn(false));
        assert!(!r.d.turn(false));

        let Rig { d, script, .. } = r;
        d.finish();
        assert_eq!(script.lock().unwrap().unregistered, 1);
        assert_eq!(conn.state(), Disconnected);
    }

    #[test]
    fn test_finish_fails_pending_receive() {
        let mut r = rig(1, 16, 16);
        let mut conn = r.accept();
        let Rig { d, shared, .. } = {
            // Queue a receive the loop never gets to see complete.
            drop(conn.receive());
            r.d.turn(false);
            r
        };
        d.finish();
        assert_eq!(shared.slots[0].recv_cell.result(), Some(Err(RegioError::ConnectionClosed)));
        assert_eq!(conn.state(), Disconnected);
        drop(conn);
        assert_eq!(shared.free_slots(), 1);
    }

    #[test]
    fn test_commands_after_exit_fail_fast() {
        let mut r = rig(1, 16, 16);
        let mut conn = r.accept();
        r.shared.mark_exited();
        let mut fut = conn.receive();
        assert_eq!(poll_once(&mut fut), Poll::Ready(Err(RegioError::ConnectionClosed)));
        drop(fut);
        assert_eq!(conn.state(), Disconnected);
    }

    #[test]
    fn test_completion_for_unknown_slot_is_counted() {
        let mut r = rig(1, 16, 16);
        r.complete(99, 4);
        r.d.turn(false);
        assert_eq!(r.shared.stats.snapshot().protocol_violations, 1);
        assert_eq!(r.shared.free_slots(), 1);
    }

    #[test]
    fn test_completion_for_idle_slot_is_rejected() {
        let mut r = rig(1, 16, 16);
        let conn = r.accept();
        r.complete(0, 4);
        r.d.turn(false);
        assert_eq!(r.shared.stats.snapshot().protocol_violations, 1);
        assert_eq!(conn.state(), Accepted);
        assert!(conn.received().is_empty());
        assert_eq!(closes(&r), 0);
    }

    #[test]
    fn test_failed_accept_setup_recycles_slot() {
        let mut r = rig(1, 16, 16);
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::close(fds[1]) };

        // TCP_NODELAY fails on a pipe.
        let index = r.accept_fd(fds[0], None);
        assert_eq!(r.executor.spawned(), 0);
        assert_eq!(closes(&r), 1);
        assert_eq!(r.shared.slots[index as usize].state(), Disconnecting);

        r.complete(index, 0);
        r.d.turn(false);
        assert_eq!(r.shared.slots[index as usize].state(), Disconnected);
        assert_eq!(r.shared.free_slots(), 1);
        let s = r.shared.stats.snapshot();
        assert_eq!((s.accepts, s.errors, s.disconnects), (0, 1, 1));
    }

    #[test]
    fn test_send_after_peer_close_is_refused() {
        let mut r = rig(1, 16, 16);
        let mut conn = r.accept();
        // The handler gave up waiting on its receive.
        drop(conn.receive());
        r.d.turn(false);
        r.complete(0, 0);
        r.d.turn(false);

        assert_eq!(conn.state(), Disconnecting);
        assert!(matches!(conn.send(4), Err(RegioError::InvalidState { .. })));
        r.d.turn(false);
        assert!(send_op(&r).is_none());
        assert_eq!(closes(&r), 1);
    }

    #[test]
    fn test_failed_send_disconnects() {
        let mut r = rig(1, 16, 16);
        let mut conn = r.accept();
        {
            let mut fut = conn.send(4).unwrap();
            r.d.turn(false);
            r.complete(0, -libc::EPIPE);
            r.d.turn(false);
            assert_eq!(poll_once(&mut fut), Poll::Ready(Err(RegioError::Io(libc::EPIPE))));
        }
        assert_eq!(conn.state(), Disconnecting);
        assert_eq!(closes(&r), 1);
        assert_eq!(r.shared.stats.snapshot().sends, 0);
    }
}
