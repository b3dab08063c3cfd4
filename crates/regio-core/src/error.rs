//! regio error types.

use std::fmt;

use crate::state::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegioError {
    /// io_uring setup failed.
    RingSetup(i32),
    /// Submission queue is full.
    RingFull,
    /// io_uring_enter failed.
    Submit(i32),
    /// Mapping the buffer region failed.
    BufferAlloc(i32),
    /// Registering the buffer region with the kernel failed.
    BufferRegister(i32),
    /// Wake-up eventfd creation or write failed.
    Notifier(i32),
    /// Listening or connection socket setup failed.
    Socket(i32),
    /// A thread could not be spawned, or the task pool is shut down.
    Spawn,
    /// Configuration rejected by `validate()`.
    InvalidConfig(&'static str),
    /// Operation requested from a state that does not allow it.
    InvalidState { slot: u32, state: ConnectionState },
    /// Send length exceeds the slot's send buffer.
    BufferTooSmall { requested: usize, capacity: usize },
    /// Every slot of the worker is in use.
    NoFreeSlot,
    /// The connection has been torn down.
    ConnectionClosed,
    /// A receive or send completed with an error.
    Io(i32),
    /// OS error with errno.
    Os(i32),
}

impl RegioError {
    /// errno carried by the error, if any.
    pub fn errno(&self) -> Option<i32> {
        match *self {
            Self::RingSetup(e)
            | Self::Submit(e)
            | Self::BufferAlloc(e)
            | Self::BufferRegister(e)
            | Self::Notifier(e)
            | Self::Socket(e)
            | Self::Io(e)
            | Self::Os(e) => Some(e),
            _ => None,
        }
    }

    /// Build from the calling thread's last OS error.
    pub fn last_os_error(wrap: fn(i32) -> RegioError) -> RegioError {
        wrap(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for RegioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingSetup(e) => write!(f, "io_uring setup: errno {}", e),
            Self::RingFull => write!(f, "ring full"),
            Self::Submit(e) => write!(f, "io_uring submit: errno {}", e),
            Self::BufferAlloc(e) => write!(f, "buffer alloc failed: errno {}", e),
            Self::BufferRegister(e) => write!(f, "buffer register failed: errno {}", e),
            Self::Notifier(e) => write!(f, "notifier: errno {}", e),
            Self::Socket(e) => write!(f, "socket: errno {}", e),
            Self::Spawn => write!(f, "spawn failed"),
            Self::InvalidConfig(why) => write!(f, "invalid config: {}", why),
            Self::InvalidState { slot, state } => {
                write!(f, "slot {} in invalid state {}", slot, state)
            }
            Self::BufferTooSmall { requested, capacity } => {
                write!(f, "send of {} bytes exceeds buffer of {}", requested, capacity)
            }
            Self::NoFreeSlot => write!(f, "no free connection slot"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O completion failed: errno {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for RegioError {}

impl From<std::io::Error> for RegioError {
    fn from(e: std::io::Error) -> Self {
        RegioError::Os(e.raw_os_error().unwrap_or(0))
    }
}

pub type Result<T> = std::result::Result<T, RegioError>;
