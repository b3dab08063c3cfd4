//! The application's view of one accepted connection.
//!
//! A `Connection` is handed to the handler once per accept. It borrows a
//! slot: its receive and send buffers are the slot's registered segment,
//! and `id()` is the slot index. Receive and send return futures resolved
//! by the worker's dispatch thread.
//!
//! ```ignore
//! async fn echo(mut conn: Connection) {
//!     loop {
//!         match conn.receive().await {
//!             Ok(0) | Err(_) => break,
//!             Ok(n) => {
//!                 let (rx, tx) = conn.buffers();
//!                 tx[..n].copy_from_slice(&rx[..n]);
//!             }
//!         }
//!         // ...
//!     }
//! }
//! ```
//!
//! Dropping the handle disconnects: immediately when the slot is idle,
//! otherwise as soon as the pending operation completes.

use regio_core::error::Result;
use regio_core::executor::BoxFuture;
use regio_core::state::ConnectionState;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::completion_cell::CompletionFuture;
use crate::slot::Slot;
use crate::worker::{Command, WorkerShared};

/// Application entry point. The dispatch thread calls it once per accepted
/// connection and hands the returned future to the task pool, so a
/// `Handler` must only package the connection, never do work itself.
pub type Handler = Arc<dyn Fn(Connection) -> BoxFuture + Send + Sync>;

/// Box an `async fn(Connection)` into a `Handler`.
///
/// `f` itself is deferred into the returned future: any synchronous code
/// in it runs on first poll, on a task pool thread.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |conn| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(conn).await }) as BoxFuture
    })
}

pub struct Connection {
    shared: Arc<WorkerShared>,
    index: u32,
}

impl Connection {
    pub(crate) fn new(shared: Arc<WorkerShared>, index: u32) -> Self {
        shared.slots[index as usize].attach();
        Self { shared, index }
    }

    #[inline]
    fn slot(&self) -> &Slot {
        &self.shared.slots[self.index as usize]
    }

    /// Slot index within the worker; stable for the connection's life.
    pub fn id(&self) -> u32 {
        self.index
    }

    pub fn worker(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.slot().state()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.slot().peer_addr()
    }

    /// Receive into the slot's receive buffer. Resolves to the byte count;
    /// 0 means the peer closed and the connection is being torn down.
    ///
    /// Fails immediately unless the connection is `Accepted` or `Sent`.
    pub fn receive(&mut self) -> CompletionFuture<'_> {
        match self.slot().start_receive() {
            Ok(()) => {
                self.shared.submit(Command::Receive(self.index));
                CompletionFuture::new(&self.slot().recv_cell)
            }
            Err(e) => CompletionFuture::failed(e),
        }
    }

    /// Send the first `len` bytes of the send buffer.
    ///
    /// Fails with `BufferTooSmall` if `len` exceeds the send buffer, or
    /// `InvalidState` unless the connection is `Accepted`, `Received` or
    /// `Sent`.
    pub fn send(&mut self, len: usize) -> Result<CompletionFuture<'_>> {
        self.slot().start_send(len)?;
        self.shared.submit(Command::Send(self.index));
        Ok(CompletionFuture::new(&self.slot().send_cell))
    }

    /// Bytes delivered by the last receive. Empty while a receive is
    /// outstanding.
    pub fn received(&self) -> &[u8] {
        let slot = self.slot();
        if slot.state() == ConnectionState::Receiving {
            return &[];
        }
        let seg = slot.recv_segment();
        let n = slot.received_len().min(seg.length);
        // Safety: no receive is in flight, and the only writer of this
        // half is a receive issued through `&mut self`.
        unsafe { &self.shared.pool.data(&seg)[..n] }
    }

    /// The whole send buffer, for filling before `send()`. Empty while a
    /// send is outstanding.
    pub fn send_buffer(&mut self) -> &mut [u8] {
        let slot = self.slot();
        if slot.state() == ConnectionState::Sending {
            return &mut [];
        }
        let seg = slot.send_segment();
        // Safety: no send is in flight and `&mut self` makes this the
        // only view of the send half.
        unsafe { self.shared.pool.data_mut(&seg) }
    }

    /// Received bytes and the send buffer together, for copying from
    /// one into the other.
    pub fn buffers(&mut self) -> (&[u8], &mut [u8]) {
        let slot = self.slot();
        let state = slot.state();

        let rx: &[u8] = if state == ConnectionState::Receiving {
            &[]
        } else {
            let seg = slot.recv_segment();
            let n = slot.received_len().min(seg.length);
            unsafe { &self.shared.pool.data(&seg)[..n] }
        };
        let tx: &mut [u8] = if state == ConnectionState::Sending {
            &mut []
        } else {
            // Disjoint from the receive half.
            unsafe { self.shared.pool.data_mut(&slot.send_segment()) }
        };
        (rx, tx)
    }

    pub fn send_capacity(&self) -> usize {
        self.slot().send_segment().length
    }

    pub fn receive_capacity(&self) -> usize {
        self.slot().recv_segment().length
    }

    /// Close the connection. Same as dropping the handle.
    pub fn disconnect(self) {
        drop(self)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.detach(self.index);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("worker", &self.shared.id)
            .field("slot", &self.index)
            .field("state", &self.state())
            .finish()
    }
}
