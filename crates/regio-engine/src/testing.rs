//! In-memory stand-ins for the kernel, used by the engine's unit tests.

use regio_core::buffer::BufferRegistry;
use regio_core::entry::{IoOp, RequestContext};
use regio_core::error::Result;
use regio_core::executor::{BoxFuture, Executor};
use regio_core::io_backend::{IoBackend, IoCompletion};
use regio_core::notifier::Notifier;

use std::collections::VecDeque;
use std::future::Future;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake, Waker};

use crate::config::EngineConfig;
use crate::connection::{Connection, Handler};
use crate::dispatcher::Dispatcher;
use crate::worker::{build, WorkerShared};

#[derive(Default)]
pub(crate) struct Script {
    pub pushed: Vec<IoOp>,
    pub ready: VecDeque<IoCompletion>,
    pub registered: usize,
    pub unregistered: usize,
}

/// Records every queued operation; completes only what the test injects.
pub(crate) struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    armed: bool,
    inflight: usize,
}

impl ScriptedBackend {
    pub(crate) fn new() -> (Self, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let backend = Self {
            script: Arc::clone(&script),
            armed: false,
            inflight: 0,
        };
        (backend, script)
    }
}

impl BufferRegistry for ScriptedBackend {
    unsafe fn register(&self, _base: *mut u8, _len: usize) -> Result<u16> {
        self.script.lock().unwrap().registered += 1;
        Ok(0)
    }

    fn unregister(&self) -> Result<()> {
        self.script.lock().unwrap().unregistered += 1;
        Ok(())
    }
}

impl IoBackend for ScriptedBackend {
    fn push(&mut self, op: &IoOp) -> Result<()> {
        if let IoOp::Close { fd, .. } = *op {
            unsafe { libc::close(fd) };
        }
        self.script.lock().unwrap().pushed.push(*op);
        self.inflight += 1;
        Ok(())
    }

    fn arm(&mut self) -> Result<()> {
        self.armed = true;
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn submit_and_wait(&mut self, _min_complete: usize) -> Result<usize> {
        Ok(0)
    }

    fn poll_completions(&mut self, buf: &mut [IoCompletion], max: usize) -> usize {
        let mut script = self.script.lock().unwrap();
        let mut n = 0;
        while n < max.min(buf.len()) {
            let Some(c) = script.ready.pop_front() else { break };
            buf[n] = c;
            n += 1;
        }
        self.inflight = self.inflight.saturating_sub(n);
        n
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn capacity(&self) -> usize {
        1024
    }

    fn shutdown(&mut self) {}
}

#[derive(Default)]
pub(crate) struct CountingNotifier(pub AtomicUsize);

impl Notifier for CountingNotifier {
    fn notify(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps spawned handler futures without running them.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    tasks: Mutex<Vec<BoxFuture>>,
}

impl RecordingExecutor {
    pub(crate) fn spawned(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub(crate) fn take(&self) -> Vec<BoxFuture> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }
}

impl Executor for RecordingExecutor {
    fn spawn(&self, task: BoxFuture) -> Result<()> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    fn active_workers(&self) -> usize {
        0
    }

    fn total_workers(&self) -> usize {
        0
    }

    fn shutdown(&self) {}
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

pub(crate) fn poll_once<F: Future + Unpin>(f: &mut F) -> Poll<F::Output> {
    let waker = Waker::from(Arc::new(NoopWake));
    let mut cx = Context::from_waker(&waker);
    Pin::new(f).poll(&mut cx)
}

/// A connected loopback pair: (server side, client side).
pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

/// A dispatcher over a `ScriptedBackend`, driven one `turn` at a time.
pub(crate) struct Rig {
    pub d: Dispatcher<ScriptedBackend>,
    pub shared: Arc<WorkerShared>,
    pub script: Arc<Mutex<Script>>,
    pub executor: Arc<RecordingExecutor>,
    pub notifier: Arc<CountingNotifier>,
    conns: mpsc::Receiver<Connection>,
    clients: Vec<TcpStream>,
}

pub(crate) fn rig(slots: usize, recv: usize, send: usize) -> Rig {
    let (tx, conns) = mpsc::channel();
    let tx = Mutex::new(tx);
    let handler: Handler = Arc::new(move |conn: Connection| {
        let _ = tx.lock().unwrap().send(conn);
        Box::pin(async {}) as BoxFuture
    });
    rig_with(slots, recv, send, handler, conns)
}

/// A rig whose handler never sees connections through `Rig::accept`;
/// drive it with `Rig::accept_socket`.
pub(crate) fn rig_with_handler(slots: usize, recv: usize, send: usize, handler: Handler) -> Rig {
    let (_, conns) = mpsc::channel();
    rig_with(slots, recv, send, handler, conns)
}

fn rig_with(
    slots: usize,
    recv: usize,
    send: usize,
    handler: Handler,
    conns: mpsc::Receiver<Connection>,
) -> Rig {
    let config = EngineConfig::new()
        .workers(1)
        .connection_backlog(slots)
        .receive_buffer_length(recv)
        .send_buffer_length(send);

    let (backend, script) = ScriptedBackend::new();
    let notifier = Arc::new(CountingNotifier::default());
    let executor = Arc::new(RecordingExecutor::default());

    let (shared, d) = build(
        0,
        &config,
        backend,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        Arc::clone(&executor) as Arc<dyn Executor>,
        handler,
    )
    .unwrap();
    assert_eq!(script.lock().unwrap().registered, 1);

    Rig {
        d,
        shared,
        script,
        executor,
        notifier,
        conns,
        clients: Vec::new(),
    }
}

impl Rig {
    pub(crate) fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Inject a completion for `slot`.
    pub(crate) fn complete(&self, slot: u32, result: i32) {
        self.script().ready.push_back(IoCompletion {
            ctx: RequestContext::from_slot(slot),
            result,
            flags: 0,
        });
    }

    /// Accept a real loopback socket into a free slot and run one turn so
    /// the handler receives it.
    pub(crate) fn accept(&mut self) -> Connection {
        self.accept_socket();
        self.conns.try_recv().expect("handler called")
    }

    /// Accept a real loopback socket and run one turn. Returns the slot.
    pub(crate) fn accept_socket(&mut self) -> u32 {
        let (server, client) = tcp_pair();
        let peer = server.peer_addr().ok();
        self.clients.push(client);
        self.accept_fd(server.into_raw_fd(), peer)
    }

    /// Hand `fd` to a free slot as if it had just been accepted, and run
    /// one turn.
    pub(crate) fn accept_fd(&mut self, fd: RawFd, peer: Option<SocketAddr>) -> u32 {
        let index = self.shared.try_acquire_slot().expect("free slot");
        self.shared.start_accept(index, fd, peer).unwrap();
        self.d.turn(false);
        index
    }
}
