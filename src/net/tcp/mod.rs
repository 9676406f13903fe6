//! TCP Protocol Implementation (RFC 793)
//!
//! Provides Transmission Control Protocol support for reliable, connection-oriented communication.
//!
//! # Features
//! - Segment parsing and building with strict checksum validation
//! - Active and passive open with a bounded accept backlog
//! - Sliding send window bounded by the peer's advertisement
//! - Retransmission of the oldest unacknowledged segment with exponential backoff
//! - Full connection teardown including TIME_WAIT
//!
//! # Limitations
//! - No congestion control, fast retransmit or SACK
//! - No window scaling and no options on outbound segments
//! - Out-of-order segments are dropped, not queued
//! - No persist timer; a zero window is reopened by the peer's update

mod engine;
mod segment;
mod state;
mod tcb;

use core::fmt;
use core::net::SocketAddrV4;
use core::time::Duration;
use thiserror::Error;

pub use engine::TcpEngine;
pub use segment::{TCP_HEADER_SIZE, TcpFlags, TcpSegment, seq_ge, seq_gt, seq_le, seq_lt};
pub use state::{TcpEvent, TcpState};

/// Identifies a connection or listener inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u32);

impl ConnId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp#{}", self.0)
    }
}

/// Errors for malformed segments; they are dropped, never surfaced to sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TcpError {
    /// Packet is too short to contain a valid TCP header
    #[error("segment too short")]
    PacketTooShort,
    /// Invalid data offset (header length)
    #[error("invalid data offset {0}")]
    InvalidDataOffset(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// Snapshot of a connection for introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpInfo {
    pub id: ConnId,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub state: TcpState,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub rto: Duration,
    pub backoff: u32,
    /// Segments awaiting acknowledgment
    pub unacked: usize,
    pub send_buffered: usize,
    pub recv_buffered: usize,
}

/// TCP counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub segments_in: u64,
    pub segments_out: u64,
    pub malformed: u64,
    pub checksum_errors: u64,
    pub resets_sent: u64,
    pub retransmissions: u64,
    pub backlog_overflows: u64,
    /// Segments discarded by sequence or acknowledgment checks
    pub dropped: u64,
    pub timeouts: u64,
}
