//! ICMP (Internet Control Message Protocol) Implementation
//! RFC 792 - https://www.rfc-editor.org/rfc/rfc792
//!
//! Echo request/reply only: inbound requests are answered, and replies to
//! our own pings are collected with their round-trip time.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use core::time::Duration;
use log::{debug, trace};
use thiserror::Error;

use crate::net::checksum::internet_checksum;
use crate::net::timer::Instant;

/// Replies kept before the oldest is discarded
const MAX_STORED_REPLIES: usize = 32;

/// ICMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    /// Echo Reply (Type 0)
    EchoReply,
    /// Destination Unreachable (Type 3)
    DestinationUnreachable,
    /// Echo Request (Type 8)
    EchoRequest,
    /// Time Exceeded (Type 11)
    TimeExceeded,
    Unknown(u8),
}

impl From<u8> for IcmpType {
    fn from(value: u8) -> Self {
        match value {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            8 => IcmpType::EchoRequest,
            11 => IcmpType::TimeExceeded,
            other => IcmpType::Unknown(other),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(icmp_type: IcmpType) -> Self {
        match icmp_type {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::EchoRequest => 8,
            IcmpType::TimeExceeded => 11,
            IcmpType::Unknown(val) => val,
        }
    }
}

impl fmt::Display for IcmpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpType::EchoReply => write!(f, "Echo Reply"),
            IcmpType::DestinationUnreachable => write!(f, "Destination Unreachable"),
            IcmpType::EchoRequest => write!(f, "Echo Request"),
            IcmpType::TimeExceeded => write!(f, "Time Exceeded"),
            IcmpType::Unknown(val) => write!(f, "Unknown({})", val),
        }
    }
}

/// ICMP parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IcmpError {
    /// Packet too short (minimum 8 bytes)
    #[error("ICMP packet too short")]
    PacketTooShort,
    #[error("invalid ICMP checksum")]
    InvalidChecksum,
}

/// ICMP packet structure
///
/// Format:
/// ```text
/// [Type (1)][Code (1)][Checksum (2)]
/// [Identifier (2)][Sequence (2)][Data (variable)]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub icmp_type: IcmpType,
    pub code: u8,
    /// Identifier (for echo request/reply)
    pub identifier: u16,
    /// Sequence number (for echo request/reply)
    pub sequence: u16,
    pub data: Vec<u8>,
}

impl IcmpPacket {
    /// Minimum ICMP packet size (header only)
    pub const MIN_SIZE: usize = 8;

    /// Parse an ICMP packet, verifying the checksum over the whole message
    pub fn from_bytes(data: &[u8]) -> Result<Self, IcmpError> {
        if data.len() < Self::MIN_SIZE {
            return Err(IcmpError::PacketTooShort);
        }
        if internet_checksum(data) != 0 {
            return Err(IcmpError::InvalidChecksum);
        }

        Ok(IcmpPacket {
            icmp_type: IcmpType::from(data[0]),
            code: data[1],
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            data: data[8..].to_vec(),
        })
    }

    /// Convert to raw bytes with the checksum filled in
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::MIN_SIZE + self.data.len());
        bytes.push(self.icmp_type.into());
        bytes.push(self.code);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.identifier.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.data);

        let checksum = internet_checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    /// # Arguments
    /// * `identifier` - Request identifier
    /// * `sequence` - Sequence number (increments with each ping)
    /// * `data` - Payload echoed back by the peer
    pub fn echo_request(identifier: u16, sequence: u16, data: Vec<u8>) -> Self {
        IcmpPacket {
            icmp_type: IcmpType::EchoRequest,
            code: 0,
            identifier,
            sequence,
            data,
        }
    }

    /// Echo reply carrying the request's identifier, sequence and payload
    pub fn echo_reply(request: &IcmpPacket) -> Self {
        IcmpPacket {
            icmp_type: IcmpType::EchoReply,
            code: 0,
            identifier: request.identifier,
            sequence: request.sequence,
            data: request.data.clone(),
        }
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type == IcmpType::EchoRequest
    }

    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type == IcmpType::EchoReply
    }
}

/// A reply to one of our pings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    pub from: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
    pub data: Vec<u8>,
    /// Zero when the matching request was not sent by this stack
    pub rtt: Duration,
}

/// Echo responder and ping bookkeeping
#[derive(Debug, Default)]
pub struct IcmpHandler {
    /// Send time of each outstanding request
    outstanding: BTreeMap<(Ipv4Addr, u16, u16), Instant>,
    replies: VecDeque<EchoReply>,
}

impl IcmpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an outgoing echo request for RTT measurement
    pub fn record_request(&mut self, dst: Ipv4Addr, identifier: u16, sequence: u16, now: Instant) {
        self.outstanding.insert((dst, identifier, sequence), now);
    }

    /// Handle an inbound ICMP message
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` - an echo reply to send back to `src`
    /// * `Ok(None)` - consumed, nothing to send
    /// * `Err(IcmpError)` - malformed, drop it
    pub fn handle(
        &mut self,
        src: Ipv4Addr,
        data: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, IcmpError> {
        let packet = IcmpPacket::from_bytes(data)?;

        match packet.icmp_type {
            IcmpType::EchoRequest => {
                trace!("ICMP: echo request from {} seq={}", src, packet.sequence);
                Ok(Some(IcmpPacket::echo_reply(&packet).to_bytes()))
            }
            IcmpType::EchoReply => {
                let sent = self
                    .outstanding
                    .remove(&(src, packet.identifier, packet.sequence));
                let rtt = sent.map_or(Duration::ZERO, |at| now.saturating_since(at));
                debug!("ICMP: echo reply from {} seq={} rtt={:?}", src, packet.sequence, rtt);

                if self.replies.len() >= MAX_STORED_REPLIES {
                    self.replies.pop_front();
                }
                self.replies.push_back(EchoReply {
                    from: src,
                    identifier: packet.identifier,
                    sequence: packet.sequence,
                    data: packet.data,
                    rtt,
                });
                Ok(None)
            }
            other => {
                trace!("ICMP: ignoring {} from {}", other, src);
                Ok(None)
            }
        }
    }

    /// Drain collected echo replies, oldest first
    pub fn take_replies(&mut self) -> Vec<EchoReply> {
        self.replies.drain(..).collect()
    }
}
