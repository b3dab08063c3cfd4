//! Connection slot states.

use core::fmt;

/// Lifecycle state of a connection slot.
///
/// The cycle is `Disconnected → Accepting → Accepted → Receiving → Received
/// → Sending → Sent → Disconnecting → Disconnected`, with `Sent → Receiving`
/// looping while the connection is kept alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Free, no socket bound
    Disconnected = 0,

    /// Socket bound, waiting for the dispatch loop to take it over
    Accepting = 1,

    /// Connected, no operation outstanding
    Accepted = 2,

    /// Receive outstanding
    Receiving = 3,

    /// Receive completed, no operation outstanding
    Received = 4,

    /// Send outstanding
    Sending = 5,

    /// Send completed, no operation outstanding
    Sent = 6,

    /// Close outstanding
    Disconnecting = 7,
}

impl ConnectionState {
    /// Connected with nothing in flight: the handler may start an operation
    /// or disconnect.
    #[inline]
    pub const fn is_idle(&self) -> bool {
        matches!(
            self,
            ConnectionState::Accepted | ConnectionState::Received | ConnectionState::Sent
        )
    }

    /// A kernel operation is outstanding.
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            ConnectionState::Receiving | ConnectionState::Sending | ConnectionState::Disconnecting
        )
    }

    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Accepted | ConnectionState::Sent)
    }

    #[inline]
    pub const fn can_send(&self) -> bool {
        self.is_idle()
    }

    #[inline]
    pub const fn can_disconnect(&self) -> bool {
        self.is_idle()
    }
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnectionState::Accepting,
            2 => ConnectionState::Accepted,
            3 => ConnectionState::Receiving,
            4 => ConnectionState::Received,
            5 => ConnectionState::Sending,
            6 => ConnectionState::Sent,
            7 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(state: ConnectionState) -> u8 {
        state as u8
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Accepting => "ACCEPTING",
            ConnectionState::Accepted => "ACCEPTED",
            ConnectionState::Receiving => "RECEIVING",
            ConnectionState::Received => "RECEIVED",
            ConnectionState::Sending => "SENDING",
            ConnectionState::Sent => "SENT",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}
