//! Workers.
//!
//! A worker owns one io_uring, one registered pool, one slot table and
//! one dispatch thread (`regio-worker-{id}`). Connections never migrate
//! between workers.
//!
//! Other threads talk to a worker only through `WorkerShared`: the
//! acceptor claims free slots, handlers flip slot states, and both queue
//! `Command`s on the inbox and ring the notifier. The ring itself is
//! touched by the dispatch thread alone.

use regio_core::error::{RegioError, Result};
use regio_core::executor::Executor;
use regio_core::io_backend::IoBackend;
use regio_core::notifier::Notifier;
use regio_core::{kdebug, kwarn};

use regio_module::{EventFdNotifier, RegisteredPool, UringBackend, UringConfig};

use crossbeam_queue::ArrayQueue;

use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::EngineConfig;
use crate::connection::Handler;
use crate::dispatcher::Dispatcher;
use crate::slot::Slot;
use crate::stats::{bump, StatsSnapshot, WorkerStats};

/// Work queued for the dispatch thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Slot is `Accepting`: take the new socket over and run the handler.
    Accept(u32),
    /// Slot is `Receiving`: queue the receive.
    Receive(u32),
    /// Slot is `Sending`: queue the send.
    Send(u32),
    /// Slot is `Disconnecting`: queue the close.
    Disconnect(u32),
}

/// State shared between a worker's dispatch thread, the acceptor and
/// connection handles.
pub(crate) struct WorkerShared {
    pub(crate) id: usize,
    pub(crate) slots: Box<[Slot]>,
    free: ArrayQueue<u32>,
    pub(crate) inbox: ArrayQueue<Command>,
    pub(crate) pool: RegisteredPool,
    notifier: Arc<dyn Notifier>,
    pub(crate) stats: WorkerStats,
    pub(crate) use_nagle: bool,
    shutdown: AtomicBool,
    /// The dispatch loop has returned; nothing drains the inbox any more.
    exited: AtomicBool,
}

impl WorkerShared {
    /// One slot per pool segment, every slot free.
    pub(crate) fn new(
        id: usize,
        pool: RegisteredPool,
        recv_len: usize,
        notifier: Arc<dyn Notifier>,
        use_nagle: bool,
    ) -> Self {
        let n = pool.segment_count();
        let slots: Box<[Slot]> = (0..n)
            .map(|i| Slot::new(i as u32, pool.segment(i), recv_len))
            .collect();

        // Seeding every slot is the initial accept: each one is now
        // eligible for the next incoming connection.
        let free = ArrayQueue::new(n);
        for i in 0..n {
            let _ = free.push(i as u32);
        }

        Self {
            id,
            slots,
            free,
            // At most one command per slot is ever queued.
            inbox: ArrayQueue::new(n * 2),
            pool,
            notifier,
            stats: WorkerStats::default(),
            use_nagle,
            shutdown: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn try_acquire_slot(&self) -> Option<u32> {
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        self.free.pop()
    }

    /// Bind an accepted socket into a slot claimed by `try_acquire_slot`.
    pub(crate) fn start_accept(&self, index: u32, fd: RawFd, peer: Option<SocketAddr>) -> Result<()> {
        let slot = self.slot(index).ok_or(RegioError::NoFreeSlot)?;
        if let Err(e) = slot.start_accept(fd, peer) {
            let _ = self.free.push(index);
            return Err(e);
        }
        self.submit(Command::Accept(index));
        Ok(())
    }

    /// Queue `cmd` for the dispatch thread and wake it.
    pub(crate) fn submit(&self, cmd: Command) {
        let mut cmd = cmd;
        while let Err(back) = self.inbox.push(cmd) {
            if self.exited.load(Ordering::SeqCst) {
                self.fail_command(back);
                return;
            }
            cmd = back;
            thread::yield_now();
        }
        if let Err(e) = self.notifier.notify() {
            kwarn!("worker {}: notify failed: {}", self.id, e);
        }
        // Pairs with `mark_exited` + `fail_orphans` on the dispatch side:
        // whichever runs second sees the command.
        if self.exited.load(Ordering::SeqCst) {
            self.fail_orphans();
        }
    }

    /// Drop one lease on `index`; the last one frees the slot.
    pub(crate) fn release(&self, index: u32) {
        if let Some(slot) = self.slot(index) {
            if slot.release_lease() && self.free.push(index).is_err() {
                kwarn!("worker {}: free queue overflow on slot {}", self.id, index);
            }
        }
    }

    /// The application handle for `index` is gone.
    pub(crate) fn detach(&self, index: u32) {
        let Some(slot) = self.slot(index) else { return };
        slot.detach();
        // Idle now: close here. Pending: the dispatcher sees the
        // detachment when the operation completes.
        if slot.start_disconnect().is_ok() {
            self.submit(Command::Disconnect(index));
        }
        self.release(index);
    }

    /// Close a `Disconnecting` slot synchronously, bypassing the ring.
    pub(crate) fn close_now(&self, index: u32) {
        let Some(slot) = self.slot(index) else { return };
        if let Ok(fd) = slot.finish_disconnect() {
            if fd >= 0 {
                unsafe { libc::close(fd); }
            }
            bump(&self.stats.disconnects, 1);
            self.release(index);
        }
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.notifier.notify() {
            kwarn!("worker {}: shutdown notify failed: {}", self.id, e);
        }
    }

    #[inline]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Fail every queued command. Used once the dispatch loop is gone.
    pub(crate) fn fail_orphans(&self) {
        while let Some(cmd) = self.inbox.pop() {
            self.fail_command(cmd);
        }
    }

    fn fail_command(&self, cmd: Command) {
        kdebug!("worker {}: failing orphaned {:?}", self.id, cmd);
        match cmd {
            Command::Accept(i) => {
                if let Some(slot) = self.slot(i) {
                    if slot.abort_accept().is_ok() {
                        self.close_now(i);
                    }
                }
            }
            Command::Receive(i) => {
                // Whoever moves the slot out of Receiving owns the cell.
                if let Some(slot) = self.slot(i) {
                    if slot.abort_receive(0).is_ok() {
                        self.close_now(i);
                        slot.recv_cell.complete(Err(RegioError::ConnectionClosed));
                    }
                }
            }
            Command::Send(i) => {
                if let Some(slot) = self.slot(i) {
                    if slot.abort_send().is_ok() {
                        self.close_now(i);
                        slot.send_cell.complete(Err(RegioError::ConnectionClosed));
                    }
                }
            }
            Command::Disconnect(i) => self.close_now(i),
        }
    }
}

/// Cloneable handle used to feed connections to a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Bind `stream` to a free slot. With no slot free the stream is
    /// closed, the rejection counted and `NoFreeSlot` returned.
    pub fn assign(&self, stream: TcpStream, peer: Option<SocketAddr>) -> Result<u32> {
        let Some(index) = self.shared.try_acquire_slot() else {
            bump(&self.shared.stats.rejected, 1);
            return Err(RegioError::NoFreeSlot);
        };
        let fd = stream.into_raw_fd();
        if let Err(e) = self.shared.start_accept(index, fd, peer) {
            unsafe { libc::close(fd); }
            bump(&self.shared.stats.errors, 1);
            return Err(e);
        }
        Ok(index)
    }

    pub fn free_slots(&self) -> usize {
        self.shared.free_slots()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

/// Map the pool, lay out the slots and build the dispatch loop over
/// `backend`, without starting a thread.
pub(crate) fn build<B: IoBackend>(
    id: usize,
    config: &EngineConfig,
    backend: B,
    notifier: Arc<dyn Notifier>,
    executor: Arc<dyn Executor>,
    handler: Handler,
) -> Result<(Arc<WorkerShared>, Dispatcher<B>)> {
    config.validate()?;
    let pool = RegisteredPool::create(&backend, config.segment_length(), config.slots_per_worker())?;
    let shared = Arc::new(WorkerShared::new(
        id,
        pool,
        config.receive_buffer_length,
        notifier,
        config.use_nagle,
    ));
    let dispatcher = Dispatcher::new(
        backend,
        Arc::clone(&shared),
        executor,
        handler,
        config.completion_batch,
        config.shutdown_grace,
    );
    Ok((shared, dispatcher))
}

pub struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create the worker's io_uring, wake eventfd and registered pool, and
    /// start its dispatch thread.
    pub fn start(
        id: usize,
        config: &EngineConfig,
        executor: Arc<dyn Executor>,
        handler: Handler,
    ) -> Result<Worker> {
        let notifier = Arc::new(EventFdNotifier::create()?);
        let backend = UringBackend::new(
            UringConfig {
                sq_entries: config.sq_entries,
                cq_entries: None,
            },
            Arc::clone(&notifier),
        )?;
        Self::with_backend(id, config, backend, notifier, executor, handler)
    }

    /// Start a worker over any backend.
    pub fn with_backend<B: IoBackend + 'static>(
        id: usize,
        config: &EngineConfig,
        backend: B,
        notifier: Arc<dyn Notifier>,
        executor: Arc<dyn Executor>,
        handler: Handler,
    ) -> Result<Worker> {
        let (shared, dispatcher) = build(id, config, backend, notifier, executor, handler)?;
        let thread = thread::Builder::new()
            .name(format!("regio-worker-{}", id))
            .spawn(move || dispatcher.run())
            .map_err(|_| RegioError::Spawn)?;
        Ok(Worker {
            shared,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.shared.free_slots()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Ask the dispatch loop to drain and stop. Does not wait.
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Wait for the dispatch thread to exit.
    pub fn join(&mut self) {
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                kwarn!("worker {}: dispatch thread panicked", self.shared.id);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{rig, tcp_pair};

    #[test]
    fn test_every_slot_starts_free() {
        let r = rig(4, 32, 32);
        assert_eq!(r.shared.slots.len(), 4);
        assert_eq!(r.shared.free_slots(), 4);
        for (i, slot) in r.shared.slots.iter().enumerate() {
            assert_eq!(slot.index(), i as u32);
            assert_eq!(slot.recv_segment().offset, i * 64);
            assert_eq!(slot.send_segment().offset, i * 64 + 32);
        }
    }

    #[test]
    fn test_assign_rejects_when_full() {
        let r = rig(1, 32, 32);
        let handle = WorkerHandle { shared: Arc::clone(&r.shared) };

        let (a, _ca) = tcp_pair();
        assert_eq!(handle.assign(a, None), Ok(0));
        let (b, _cb) = tcp_pair();
        assert_eq!(handle.assign(b, None), Err(RegioError::NoFreeSlot));
        assert_eq!(handle.stats().rejected, 1);
        assert_eq!(r.shared.inbox.pop(), Some(Command::Accept(0)));
        assert_eq!(r.notifier.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_slot_after_shutdown() {
        let r = rig(2, 16, 16);
        r.shared.request_shutdown();
        assert_eq!(r.shared.try_acquire_slot(), None);
    }
}
