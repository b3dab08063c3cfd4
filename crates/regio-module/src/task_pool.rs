//! `TaskPool`: default `Executor` implementation.
//!
//! Spawns N OS threads at creation. Handler futures are wrapped in a
//! `Task` and pushed onto a lock-free MPMC queue; a thread pops a task and
//! polls it once. A task's waker pushes it back onto the queue, so a
//! completion signalled from a dispatch thread only ever enqueues work and
//! the handler resumes on a pool thread.
//!
//! Idle threads advertise themselves on a sleeper queue and park; a push
//! unparks one sleeper. `park_timeout` bounds the cost of a lost unpark.
//!
//! No dynamic scaling. Simple, predictable, safe.

use regio_core::error::{RegioError, Result};
use regio_core::executor::{BoxFuture, Executor};
use regio_core::{kdebug, kwarn};

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

const IDLE_PARK: Duration = Duration::from_millis(1);

/// A spawned future plus its scheduling flag.
struct Task {
    future: Mutex<Option<BoxFuture>>,
    /// Set while the task sits in the run queue.
    scheduled: AtomicBool,
    pool: Weak<PoolInner>,
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.enqueue(Arc::clone(self));
        }
    }
}

/// An idle pool thread waiting to be unparked.
struct Sleeper {
    thread: Thread,
    /// True while this thread has an entry in `sleepers`.
    listed: Arc<AtomicBool>,
}

impl Sleeper {
    fn wake(self) {
        self.listed.store(false, Ordering::Release);
        self.thread.unpark();
    }
}

/// Shared state between spawners and pool threads.
struct PoolInner {
    run_queue: SegQueue<Arc<Task>>,
    sleepers: SegQueue<Sleeper>,
    /// Threads currently polling a task.
    active: AtomicUsize,
    /// Spawned tasks that have not completed yet.
    live_tasks: AtomicUsize,
    shutdown: AtomicBool,
    total: usize,
}

impl PoolInner {
    fn enqueue(&self, task: Arc<Task>) {
        self.run_queue.push(task);
        if let Some(sleeper) = self.sleepers.pop() {
            sleeper.wake();
        }
    }
}

pub struct TaskPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Create a pool with `n` threads named `regio-task-{i}`.
    pub fn new(n: usize) -> Result<Self> {
        let n = n.clamp(1, 256);
        let inner = Arc::new(PoolInner {
            run_queue: SegQueue::new(),
            sleepers: SegQueue::new(),
            active: AtomicUsize::new(0),
            live_tasks: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            total: n,
        });

        let mut handles = Vec::with_capacity(n);
        for id in 0..n {
            let inner_ref = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("regio-task-{}", id))
                .spawn(move || run_loop(inner_ref));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    kwarn!("task thread {} spawn failed: {}", id, e);
                    inner.shutdown.store(true, Ordering::SeqCst);
                    for h in handles {
                        h.thread().unpark();
                        let _ = h.join();
                    }
                    return Err(RegioError::Spawn);
                }
            }
        }

        kdebug!("task pool up: {} threads", n);
        Ok(TaskPool {
            inner,
            handles: Mutex::new(handles),
        })
    }

    /// Default sizing: one thread per available core, at least 2.
    pub fn auto_sized() -> Result<Self> {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(cpus.max(2))
    }

    /// Spawned tasks that have not run to completion.
    pub fn live_tasks(&self) -> usize {
        self.inner.live_tasks.load(Ordering::Acquire)
    }

    /// Stop the threads and wait for them to exit. Queued tasks are dropped.
    pub fn join(&self) {
        self.shutdown();
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for h in handles {
            h.thread().unpark();
            let _ = h.join();
        }
        while self.inner.run_queue.pop().is_some() {}
    }
}

impl Executor for TaskPool {
    fn spawn(&self, future: BoxFuture) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(RegioError::Spawn);
        }
        let task = Arc::new(Task {
            future: Mutex::new(Some(future)),
            scheduled: AtomicBool::new(true),
            pool: Arc::downgrade(&self.inner),
        });
        self.inner.live_tasks.fetch_add(1, Ordering::AcqRel);
        self.inner.enqueue(task);
        Ok(())
    }

    fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn total_workers(&self) -> usize {
        self.inner.total
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        while let Some(sleeper) = self.inner.sleepers.pop() {
            sleeper.wake();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.join();
    }
}

/// Pool thread main loop.
fn run_loop(inner: Arc<PoolInner>) {
    let listed = Arc::new(AtomicBool::new(false));
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        match inner.run_queue.pop() {
            Some(task) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                poll_task(&inner, task);
                inner.active.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                if !listed.swap(true, Ordering::AcqRel) {
                    inner.sleepers.push(Sleeper {
                        thread: thread::current(),
                        listed: Arc::clone(&listed),
                    });
                }
                // Re-check after advertising so a push that raced the
                // advertisement is not slept through.
                if inner.run_queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
                    thread::park_timeout(IDLE_PARK);
                }
            }
        }
    }
}

fn poll_task(inner: &PoolInner, task: Arc<Task>) {
    // Clear before polling so a wake during the poll re-queues the task.
    task.scheduled.store(false, Ordering::Release);

    let mut slot = match task.future.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let Some(future) = slot.as_mut() else {
        return;
    };

    let waker = Waker::from(Arc::clone(&task));
    let mut cx = Context::from_waker(&waker);
    let done = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        future.as_mut().poll(&mut cx)
    })) {
        Ok(Poll::Ready(())) => true,
        Ok(Poll::Pending) => false,
        Err(_) => {
            kwarn!("handler task panicked; dropping it");
            true
        }
    };
    if done {
        *slot = None;
        inner.live_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Pending until `open()` is called from elsewhere.
    #[derive(Clone, Default)]
    struct Gate {
        state: Arc<Mutex<(bool, Option<Waker>)>>,
    }

    impl Gate {
        fn open(&self) {
            let waker = {
                let mut s = self.state.lock().unwrap();
                s.0 = true;
                s.1.take()
            };
            if let Some(w) = waker {
                w.wake();
            }
        }
    }

    impl Future for Gate {
        type Output = ();
        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            let mut s = self.state.lock().unwrap();
            if s.0 {
                Poll::Ready(())
            } else {
                s.1 = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_spawned_task_runs_on_pool_thread() {
        let pool = TaskPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.spawn(Box::pin(async move {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        }))
        .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("regio-task-"));
        assert!(wait_for(|| pool.live_tasks() == 0));
    }

    #[test]
    fn test_wake_from_other_thread_resumes_task() {
        let pool = TaskPool::new(1).unwrap();
        let gate = Gate::default();
        let (tx, rx) = mpsc::channel();
        let g = gate.clone();
        pool.spawn(Box::pin(async move {
            g.await;
            tx.send(()).unwrap();
        }))
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(pool.live_tasks(), 1);

        thread::spawn(move || gate.open()).join().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(wait_for(|| pool.live_tasks() == 0));
    }

    #[test]
    fn test_spawn_after_shutdown_fails() {
        let pool = TaskPool::new(1).unwrap();
        pool.shutdown();
        assert_eq!(pool.spawn(Box::pin(async {})), Err(RegioError::Spawn));
        assert_eq!(pool.total_workers(), 1);
    }

    #[test]
    fn test_panicking_task_does_not_kill_pool() {
        let pool = TaskPool::new(1).unwrap();
        pool.spawn(Box::pin(async { panic!("handler bug") })).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.spawn(Box::pin(async move { tx.send(()).unwrap() })).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
