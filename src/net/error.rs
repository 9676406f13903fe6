//! Errors returned to callers of the stack
//!
//! Malformed input is never reported here; it is dropped and counted in
//! [`NetStats`](crate::net::stack::NetStats). These are the resource and
//! connection errors an owner has to handle.

use thiserror::Error;

use crate::drivers::net::TransmitError;
use crate::net::arp::ArpError;
use crate::net::ethernet::EthernetError;

/// Interface-level failures on the send path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("interface has not been brought up")]
    NotConfigured,
    #[error("interface is already configured")]
    AlreadyConfigured,
    #[error("invalid interface configuration")]
    InvalidConfig,
    #[error("no route to host")]
    NoRoute,
    #[error("packet exceeds the MTU")]
    PayloadTooLarge,
    #[error("address resolution failed: {0}")]
    Arp(#[from] ArpError),
    #[error("transmit failed: {0}")]
    Transmit(#[from] TransmitError),
}

impl From<EthernetError> for NetError {
    fn from(err: EthernetError) -> Self {
        match err {
            EthernetError::PayloadTooLarge | EthernetError::FrameTooShort => {
                NetError::PayloadTooLarge
            }
        }
    }
}

/// Errors surfaced by the socket facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("unknown socket handle")]
    InvalidHandle,
    #[error("address already in use")]
    AddressInUse,
    #[error("no ephemeral ports available")]
    NoPortsAvailable,
    #[error("operation not valid in the current connection state")]
    InvalidState,
    #[error("socket is not connected")]
    NotConnected,
    #[error("send buffer full")]
    BufferFull,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("operation timed out")]
    TimedOut,
    #[error(transparent)]
    Net(#[from] NetError),
}

impl From<ArpError> for SocketError {
    fn from(err: ArpError) -> Self {
        SocketError::Net(NetError::Arp(err))
    }
}
