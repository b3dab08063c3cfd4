//! # regio-engine: Registered-buffer TCP engine
//!
//! Accepts TCP connections and runs receive / send / close for each of
//! them through a per-worker io_uring, against buffers registered with the
//! kernel once at start-up. Every worker runs this loop on its own thread:
//!
//! ```text
//! loop {
//!     1. Arm the wake read on the worker's eventfd
//!     2. Submit queued SQEs, wait for >= 1 completion
//!     3. Drain completions; route each by slot index:
//!          Receiving     → Received,  complete recv cell
//!          Sending       → Sent,      complete send cell
//!          Disconnecting → Disconnected, release slot
//!     4. Drain the inbox:
//!          Accept  → start handler on the task pool
//!          Receive → READ_FIXED into the slot's receive half
//!          Send    → WRITE_FIXED from the slot's send half
//!          Close   → CLOSE
//! }
//! ```
//!
//! Slots, and the registered segments behind them, are allocated once
//! and reused for every connection the worker ever serves; nothing on
//! the data path allocates.
//!
//! ## Modules
//!
//! - `config` - `EngineConfig`
//! - `server` - `Server`: listener + acceptor + workers + handler pool
//! - `worker` - one io_uring, one pool, one slot table per worker
//! - `dispatcher` - the dispatch loop
//! - `connection` - the application handle
//! - `slot` - per-connection state machine
//! - `completion_cell` - receive/send completion primitive
//! - `distributor` - round-robin acceptor thread
//! - `listener` - listening socket setup
//! - `stats` - per-worker counters

pub mod completion_cell;
pub mod config;
pub mod stats;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod slot;
        pub mod connection;
        pub mod listener;
        pub mod distributor;
        pub mod worker;
        pub mod server;
        mod dispatcher;

        #[cfg(test)]
        mod testing;

        pub use connection::{handler, Connection, Handler};
        pub use distributor::{Distributor, RoundRobin};
        pub use server::Server;
        pub use worker::{Worker, WorkerHandle};
    } else {
        compile_error!("regio-engine requires Linux io_uring");
    }
}

pub use completion_cell::{CompletionCell, CompletionFuture};
pub use config::EngineConfig;
pub use stats::{StatsSnapshot, WorkerStats};

pub use regio_core::{ConnectionState, RegioError, Result};
