//! TCP segment codec
//!
//! ```text
//! [Src Port (2)][Dst Port (2)][Sequence (4)][Acknowledgment (4)]
//! [Offset/Reserved (1)][Flags (1)][Window (2)][Checksum (2)][Urgent (2)]
//! [Options (offset*4 - 20)][Data]
//! ```
//!
//! Segments are always built without options; options on inbound segments
//! are skipped.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::net::Ipv4Addr;

use super::TcpError;
use crate::net::checksum::transport_checksum;
use crate::net::ipv4::IpProtocol;

/// Minimum TCP header size (20 bytes, no options)
pub const TCP_HEADER_SIZE: usize = 20;

bitflags! {
    /// TCP control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        /// No more data from sender
        const FIN = 0x01;
        /// Synchronize sequence numbers
        const SYN = 0x02;
        /// Reset the connection
        const RST = 0x04;
        /// Push function
        const PSH = 0x08;
        /// Acknowledgment field significant
        const ACK = 0x10;
        /// Urgent pointer field significant
        const URG = 0x20;
    }
}

/// A parsed or to-be-built TCP segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent_pointer: u16,
    pub data: Vec<u8>,
}

impl TcpSegment {
    pub fn new(src_port: u16, dest_port: u16, seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dest_port,
            seq,
            ack,
            flags,
            window: 0,
            urgent_pointer: 0,
            data: Vec::new(),
        }
    }

    /// Parse a segment and verify its checksum
    ///
    /// # Arguments
    /// * `data` - Raw segment bytes (TCP header + payload)
    /// * `src_addr` - Source IP address (for the pseudo-header)
    /// * `dest_addr` - Destination IP address (for the pseudo-header)
    pub fn parse(data: &[u8], src_addr: Ipv4Addr, dest_addr: Ipv4Addr) -> Result<Self, TcpError> {
        if data.len() < TCP_HEADER_SIZE {
            return Err(TcpError::PacketTooShort);
        }

        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(TcpError::InvalidDataOffset(data_offset));
        }
        let header_len = (data_offset as usize) * 4;
        if data.len() < header_len {
            return Err(TcpError::PacketTooShort);
        }

        if transport_checksum(src_addr, dest_addr, IpProtocol::TCP, data) != 0 {
            return Err(TcpError::ChecksumMismatch);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dest_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::from_bits_truncate(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            data: data[header_len..].to_vec(),
        })
    }

    /// Build the segment with its checksum filled in
    pub fn build(&self, src_addr: Ipv4Addr, dest_addr: Ipv4Addr) -> Vec<u8> {
        let mut packet = Vec::with_capacity(TCP_HEADER_SIZE + self.data.len());

        packet.extend_from_slice(&self.src_port.to_be_bytes());
        packet.extend_from_slice(&self.dest_port.to_be_bytes());
        packet.extend_from_slice(&self.seq.to_be_bytes());
        packet.extend_from_slice(&self.ack.to_be_bytes());
        packet.push(((TCP_HEADER_SIZE / 4) as u8) << 4);
        packet.push(self.flags.bits());
        packet.extend_from_slice(&self.window.to_be_bytes());
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&self.urgent_pointer.to_be_bytes());
        packet.extend_from_slice(&self.data);

        let checksum = transport_checksum(src_addr, dest_addr, IpProtocol::TCP, &packet);
        packet[16..18].copy_from_slice(&checksum.to_be_bytes());

        packet
    }

    pub fn has(&self, flags: TcpFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Sequence space consumed: data plus one each for SYN and FIN
    pub fn seq_len(&self) -> u32 {
        let mut len = self.data.len() as u32;
        if self.has(TcpFlags::SYN) {
            len += 1;
        }
        if self.has(TcpFlags::FIN) {
            len += 1;
        }
        len
    }
}

/// `a < b` in sequence space
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a > b` in sequence space
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// `a >= b` in sequence space
pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_le(b, a)
}
