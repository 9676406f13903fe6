//! Socket facade types
//!
//! Handles are opaque values; the connection state behind them is owned by
//! the protocol engines inside [`NetStack`](crate::net::stack::NetStack).
//! Calls that would block return [`Completion::Suspend`] with a
//! [`WaitToken`] describing what to wait for.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt;
use log::trace;

use crate::net::error::SocketError;
use crate::net::tcp::ConnId;
use crate::net::timer::Instant;
use crate::net::udp::UdpId;

/// Port range for ephemeral (dynamic) port allocation
pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Opaque reference to a TCP connection, TCP listener or UDP socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SocketHandle {
    Tcp(ConnId),
    Udp(UdpId),
}

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketHandle::Tcp(id) => write!(f, "{}", id),
            SocketHandle::Udp(id) => write!(f, "udp#{}", id.raw()),
        }
    }
}

/// The condition a suspended call is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Active open reaching ESTABLISHED
    Connected,
    /// An established connection in a listener's backlog
    Acceptable,
    /// Data, EOF or a datagram to read
    Readable,
}

/// Names a suspended call so the scheduler can resume it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitToken {
    pub handle: SocketHandle,
    pub interest: Interest,
    /// After this instant `NetStack::wait` fails with `TimedOut`
    pub deadline: Option<Instant>,
}

/// Result of a call that may suspend
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Completion<T> {
    Ready(T),
    Suspend(WaitToken),
}

impl<T> Completion<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Completion::Ready(_))
    }

    /// The value, if the call completed
    pub fn ready(self) -> Option<T> {
        match self {
            Completion::Ready(value) => Some(value),
            Completion::Suspend(_) => None,
        }
    }

    pub fn token(&self) -> Option<WaitToken> {
        match self {
            Completion::Ready(_) => None,
            Completion::Suspend(token) => Some(*token),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completion<U> {
        match self {
            Completion::Ready(value) => Completion::Ready(f(value)),
            Completion::Suspend(token) => Completion::Suspend(token),
        }
    }
}

/// Outcome of a stream read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Vec<u8>),
    /// Peer sent FIN and all data before it has been read
    Eof,
}

/// Bound ports of one protocol, with round-robin ephemeral allocation
#[derive(Debug)]
pub struct PortRegistry {
    bound: BTreeSet<u16>,
    /// Next ephemeral port to try
    next_ephemeral: u16,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self {
            bound: BTreeSet::new(),
            next_ephemeral: EPHEMERAL_PORT_START,
        }
    }
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.bound.contains(&port)
    }

    /// Bind `port`, or an ephemeral port when `port` is 0
    ///
    /// # Returns
    /// The port actually bound
    pub fn bind(&mut self, port: u16) -> Result<u16, SocketError> {
        if port == 0 {
            return self.allocate_ephemeral();
        }
        if !self.bound.insert(port) {
            return Err(SocketError::AddressInUse);
        }
        Ok(port)
    }

    pub fn unbind(&mut self, port: u16) {
        self.bound.remove(&port);
    }

    fn allocate_ephemeral(&mut self) -> Result<u16, SocketError> {
        let start = self.next_ephemeral;

        loop {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == EPHEMERAL_PORT_END {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };

            if self.bound.insert(port) {
                trace!("allocated ephemeral port {}", port);
                return Ok(port);
            }
            if self.next_ephemeral == start {
                return Err(SocketError::NoPortsAvailable);
            }
        }
    }
}
