//! Top-level server: listener, acceptor, workers and handler pool.
//!
//! ```text
//!                       ┌──────────────────┐
//!   clients ──accept──▶ │  regio-acceptor  │  round-robin
//!                       └────────┬─────────┘
//!            ┌───────────────────┼───────────────────┐
//!            ▼                   ▼                   ▼
//!   ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//!   │ regio-worker-0  │ │ regio-worker-1  │ │ regio-worker-N  │
//!   │ io_uring + pool │ │ io_uring + pool │ │ io_uring + pool │
//!   └────────┬────────┘ └────────┬────────┘ └────────┬────────┘
//!            │   wake handler    │                   │
//!            └───────────────────┼───────────────────┘
//!                                ▼
//!                     ┌─────────────────────┐
//!                     │ TaskPool (handlers) │
//!                     └─────────────────────┘
//! ```

use regio_core::error::Result;
use regio_core::executor::Executor;
use regio_core::kinfo;

use regio_module::TaskPool;

use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::connection::{self, Connection};
use crate::distributor::Distributor;
use crate::listener;
use crate::stats::StatsSnapshot;
use crate::worker::Worker;

pub struct Server {
    distributor: Option<Distributor>,
    workers: Vec<Worker>,
    pool: Arc<TaskPool>,
    local_addr: SocketAddr,
    grace: Duration,
}

impl Server {
    /// Bind `config.listen_addr` and start serving every accepted
    /// connection with `serve`.
    pub fn start<F, Fut>(config: EngineConfig, serve: F) -> Result<Server>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        config.validate()?;
        let listener = listener::bind(&config)?;
        Self::start_with_listener(config, listener, serve)
    }

    /// Serve on an already listening socket.
    pub fn start_with_listener<F, Fut>(config: EngineConfig, listener: TcpListener, serve: F) -> Result<Server>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        config.validate()?;
        if config.use_fast_loopback {
            kinfo!("regio: use_fast_loopback has no effect on Linux, ignored");
        }

        let local_addr = listener.local_addr()?;
        let pool = Arc::new(TaskPool::new(config.effective_handler_threads())?);
        let handler = connection::handler(serve);

        let n = config.effective_workers();
        let mut workers = Vec::with_capacity(n);
        for id in 0..n {
            let executor: Arc<dyn Executor> = Arc::clone(&pool) as Arc<dyn Executor>;
            workers.push(Worker::start(id, &config, executor, Arc::clone(&handler))?);
        }

        let distributor = Distributor::start(listener, workers.iter().map(Worker::handle).collect())?;

        kinfo!(
            "regio: serving {} with {} workers x {} slots ({}+{} byte buffers)",
            local_addr,
            n,
            config.slots_per_worker(),
            config.receive_buffer_length,
            config.send_buffer_length
        );

        Ok(Server {
            distributor: Some(distributor),
            workers,
            pool,
            local_addr,
            grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Counters summed over all workers.
    pub fn stats(&self) -> StatsSnapshot {
        self.workers.iter().map(Worker::stats).sum()
    }

    pub fn worker_stats(&self) -> Vec<StatsSnapshot> {
        self.workers.iter().map(Worker::stats).collect()
    }

    pub fn free_slots(&self) -> usize {
        self.workers.iter().map(Worker::free_slots).sum()
    }

    /// Stop accepting, drain and stop every worker, then stop the handler
    /// pool.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(mut distributor) = self.distributor.take() else { return };
        distributor.stop();

        for w in &self.workers {
            w.shutdown();
        }
        for w in &mut self.workers {
            w.join();
        }

        // Handlers woken by the teardown get a moment to observe it.
        let deadline = Instant::now() + self.grace;
        while self.pool.live_tasks() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        self.pool.join();
        kinfo!("regio: stopped {}", self.stats());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
