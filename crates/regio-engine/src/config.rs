//! Engine configuration.
//!
//! Built with chained setters, or read from `REGIO_*` environment variables
//! with `EngineConfig::from_env()`:
//!
//! | Variable               | Field                   | Default        |
//! |------------------------|-------------------------|----------------|
//! | `REGIO_LISTEN`         | `listen_addr`           | `0.0.0.0:9999` |
//! | `REGIO_ACCEPT_BACKLOG` | `accept_backlog`        | 4096           |
//! | `REGIO_CONNECTIONS`    | `connection_backlog`    | 1024           |
//! | `REGIO_RECV_BUF`       | `receive_buffer_length` | 4096           |
//! | `REGIO_SEND_BUF`       | `send_buffer_length`    | 4096           |
//! | `REGIO_WORKERS`        | `workers` (0 = cores)   | 0              |
//! | `REGIO_NAGLE`          | `use_nagle`             | false          |
//! | `REGIO_FAST_LOOPBACK`  | `use_fast_loopback`     | false          |
//! | `REGIO_SQ_ENTRIES`     | `sq_entries`            | 256            |
//! | `REGIO_HANDLER_THREADS`| `handler_threads` (0 = cores) | 0        |

use regio_core::env::{env_get, env_get_bool};
use regio_core::error::{RegioError, Result};

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_addr: SocketAddr,
    /// `listen(2)` backlog.
    pub accept_backlog: u32,
    /// Total connection slots across all workers.
    pub connection_backlog: usize,
    pub receive_buffer_length: usize,
    pub send_buffer_length: usize,
    /// Worker count; 0 means one per available core.
    pub workers: usize,
    /// Leave Nagle's algorithm on for accepted sockets.
    pub use_nagle: bool,
    /// Accepted for compatibility; Linux loopback has no fast path to enable.
    pub use_fast_loopback: bool,
    /// io_uring submission queue size per worker. Power of two.
    pub sq_entries: u32,
    /// Completions drained per dispatch iteration.
    pub completion_batch: usize,
    /// Task pool threads; 0 means one per available core.
    pub handler_threads: usize,
    /// Upper bound on how long a worker keeps draining after shutdown.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9999)),
            accept_backlog: 4096,
            connection_backlog: 1024,
            receive_buffer_length: 4096,
            send_buffer_length: 4096,
            workers: 0,
            use_nagle: false,
            use_fast_loopback: false,
            sq_entries: 256,
            completion_batch: 1024,
            handler_threads: 0,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `REGIO_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            listen_addr: env_get("REGIO_LISTEN", d.listen_addr),
            accept_backlog: env_get("REGIO_ACCEPT_BACKLOG", d.accept_backlog),
            connection_backlog: env_get("REGIO_CONNECTIONS", d.connection_backlog),
            receive_buffer_length: env_get("REGIO_RECV_BUF", d.receive_buffer_length),
            send_buffer_length: env_get("REGIO_SEND_BUF", d.send_buffer_length),
            workers: env_get("REGIO_WORKERS", d.workers),
            use_nagle: env_get_bool("REGIO_NAGLE", d.use_nagle),
            use_fast_loopback: env_get_bool("REGIO_FAST_LOOPBACK", d.use_fast_loopback),
            sq_entries: env_get("REGIO_SQ_ENTRIES", d.sq_entries),
            handler_threads: env_get("REGIO_HANDLER_THREADS", d.handler_threads),
            ..d
        }
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn accept_backlog(mut self, n: u32) -> Self {
        self.accept_backlog = n;
        self
    }

    pub fn connection_backlog(mut self, n: usize) -> Self {
        self.connection_backlog = n;
        self
    }

    pub fn receive_buffer_length(mut self, n: usize) -> Self {
        self.receive_buffer_length = n;
        self
    }

    pub fn send_buffer_length(mut self, n: usize) -> Self {
        self.send_buffer_length = n;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn use_nagle(mut self, on: bool) -> Self {
        self.use_nagle = on;
        self
    }

    pub fn use_fast_loopback(mut self, on: bool) -> Self {
        self.use_fast_loopback = on;
        self
    }

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn completion_batch(mut self, n: usize) -> Self {
        self.completion_batch = n;
        self
    }

    pub fn handler_threads(mut self, n: usize) -> Self {
        self.handler_threads = n;
        self
    }

    pub fn shutdown_grace(mut self, d: Duration) -> Self {
        self.shutdown_grace = d;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.receive_buffer_length == 0 {
            return Err(RegioError::InvalidConfig("receive_buffer_length must be non-zero"));
        }
        if self.send_buffer_length == 0 {
            return Err(RegioError::InvalidConfig("send_buffer_length must be non-zero"));
        }
        if self.receive_buffer_length > u32::MAX as usize || self.send_buffer_length > u32::MAX as usize {
            return Err(RegioError::InvalidConfig("buffer length exceeds 4 GiB"));
        }
        if self.connection_backlog == 0 {
            return Err(RegioError::InvalidConfig("connection_backlog must be non-zero"));
        }
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(RegioError::InvalidConfig("sq_entries must be a power of two"));
        }
        if self.completion_batch == 0 {
            return Err(RegioError::InvalidConfig("completion_batch must be non-zero"));
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the core count, never more workers
    /// than connection slots.
    pub fn effective_workers(&self) -> usize {
        let n = if self.workers == 0 { available_cores() } else { self.workers };
        n.clamp(1, self.connection_backlog.max(1))
    }

    /// ⌈connection_backlog / workers⌉.
    pub fn slots_per_worker(&self) -> usize {
        let w = self.effective_workers();
        self.connection_backlog.div_ceil(w)
    }

    pub fn effective_handler_threads(&self) -> usize {
        if self.handler_threads == 0 {
            available_cores().max(2)
        } else {
            self.handler_threads
        }
    }

    /// Receive half plus send half.
    pub fn segment_length(&self) -> usize {
        self.receive_buffer_length + self.send_buffer_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = EngineConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.segment_length(), 8192);
        assert!(!c.use_nagle);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            EngineConfig::new().receive_buffer_length(0),
            EngineConfig::new().send_buffer_length(0),
            EngineConfig::new().connection_backlog(0),
            EngineConfig::new().sq_entries(100),
            EngineConfig::new().completion_batch(0),
        ];
        for c in bad.iter() {
            assert!(matches!(c.validate(), Err(RegioError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_slots_per_worker_rounds_up() {
        let c = EngineConfig::new().connection_backlog(10).workers(4);
        assert_eq!(c.effective_workers(), 4);
        assert_eq!(c.slots_per_worker(), 3);

        let c = EngineConfig::new().connection_backlog(8).workers(4);
        assert_eq!(c.slots_per_worker(), 2);
    }

    #[test]
    fn test_workers_capped_by_slots() {
        let c = EngineConfig::new().connection_backlog(2).workers(8);
        assert_eq!(c.effective_workers(), 2);
        assert_eq!(c.slots_per_worker(), 1);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("REGIO_CONNECTIONS", "64");
        std::env::set_var("REGIO_NAGLE", "1");
        std::env::set_var("REGIO_LISTEN", "127.0.0.1:7000");
        let c = EngineConfig::from_env();
        std::env::remove_var("REGIO_CONNECTIONS");
        std::env::remove_var("REGIO_NAGLE");
        std::env::remove_var("REGIO_LISTEN");

        assert_eq!(c.connection_backlog, 64);
        assert!(c.use_nagle);
        assert_eq!(c.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(c.sq_entries, 256);
    }
}
