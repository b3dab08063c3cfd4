//! # regio-core: Trait definitions for regio
//!
//! This crate defines the trait boundaries of the registered-buffer TCP
//! engine. Each trait models one capability the engine needs from the
//! platform: a completion-queue backend, a buffer registry, a wake-up
//! notifier and an executor for application handlers.
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."
//!
//! The engine depends on traits from this crate, never on concrete types.
//! The io_uring implementations live in `regio-module`; the engine's tests
//! substitute in-memory ones.
//!
//! ## Modules
//!
//! - `entry` - request context and operation types
//! - `io_backend` - completion-queue backend trait
//! - `buffer` - segment descriptors and the buffer registry trait
//! - `notifier` - dispatch-loop wake-up trait
//! - `executor` - handler execution trait
//! - `state` - connection slot states
//! - `error` - error types
//! - `kprint` - kernel-style leveled logging macros
//! - `env` - environment variable utilities

pub mod entry;
pub mod io_backend;
pub mod buffer;
pub mod notifier;
pub mod executor;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

pub use entry::{IoOp, RequestContext};
pub use io_backend::{IoBackend, IoCompletion};
pub use buffer::{BufferRegistry, SegmentDescriptor};
pub use notifier::Notifier;
pub use executor::{BoxFuture, Executor};
pub use state::ConnectionState;
pub use error::{RegioError, Result};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
