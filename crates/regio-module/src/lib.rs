//! # regio-module: Default implementations
//!
//! This crate provides the default implementation of every regio-core
//! trait, plus the registered buffer pool built on top of `BufferRegistry`.
//!
//! ## Default stack
//!
//! | Trait / concern | Default Impl      | Feature-gated alternative   |
//! |-----------------|-------------------|-----------------------------|
//! | IoBackend       | UringBackend      | UringBackend + SQPOLL (sqpoll) |
//! | BufferRegistry  | UringBackend      |                             |
//! | Notifier        | EventFdNotifier   |                             |
//! | Executor        | TaskPool          |                             |
//! | buffer memory   | RegisteredPool    |                             |

pub mod task_pool;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring_backend;
        pub mod eventfd_notifier;
        pub mod registered_pool;

        pub use uring_backend::{UringBackend, UringConfig};
        pub use eventfd_notifier::EventFdNotifier;
        pub use registered_pool::RegisteredPool;
    }
}

pub use task_pool::TaskPool;
