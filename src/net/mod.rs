//! Network stack
//!
//! Layers, bottom up: [`ethernet`] framing, [`arp`] resolution, [`ipv4`]
//! routing and validation, then [`icmp`], [`udp`] and [`tcp`] on top.
//! [`stack::NetStack`] ties them to a device and exposes the socket calls;
//! [`io`] wraps those in futures.

pub mod arp;
pub mod checksum;
pub mod config;
pub mod error;
pub mod ethernet;
pub mod icmp;
pub mod io;
pub mod ipv4;
pub mod loopback;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod timer;
pub mod udp;

pub use config::{NetworkConfig, StackConfig};
pub use error::{NetError, SocketError};
pub use socket::{Completion, Interest, Received, SocketHandle, WaitToken};
pub use stack::{NetStack, NetStats};
