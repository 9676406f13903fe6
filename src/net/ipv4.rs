//! IPv4 Protocol Implementation
//!
//! Implements IPv4 packet parsing, building, and next-hop routing.
//! Options are skipped and fragments are never reassembled.
//!
//! # References
//! - RFC 791: Internet Protocol (IPv4)
//! - RFC 1071: Computing the Internet Checksum

use alloc::vec::Vec;
use thiserror::Error;

pub use core::net::Ipv4Addr;

use crate::net::checksum::internet_checksum;
use crate::net::error::NetError;

/// IPv4 header flags (the 3-bit field above the fragment offset)
pub mod flags {
    pub const DONT_FRAGMENT: u8 = 0b010;
    pub const MORE_FRAGMENTS: u8 = 0b001;
}

/// Default TTL (Time To Live) value
pub const DEFAULT_TTL: u8 = 64;

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// Upper-layer protocol carried in the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Unknown(u8),
}

impl IpProtocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            Self::ICMP => IpProtocol::Icmp,
            Self::TCP => IpProtocol::Tcp,
            Self::UDP => IpProtocol::Udp,
            other => IpProtocol::Unknown(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(protocol: IpProtocol) -> Self {
        match protocol {
            IpProtocol::Icmp => IpProtocol::ICMP,
            IpProtocol::Tcp => IpProtocol::TCP,
            IpProtocol::Udp => IpProtocol::UDP,
            IpProtocol::Unknown(value) => value,
        }
    }
}

/// Send side of the IP layer as seen by the transport engines
pub trait IpTransmit {
    /// Source address for outbound packets
    fn local_ip(&self) -> Ipv4Addr;

    /// Encapsulate `payload` and route it towards `dest`
    fn send_ipv4(
        &mut self,
        dest: Ipv4Addr,
        protocol: IpProtocol,
        payload: Vec<u8>,
    ) -> Result<(), NetError>;
}

/// IPv4 Error Types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ipv4Error {
    /// Packet is too short to contain a valid header
    #[error("packet too short")]
    PacketTooShort,
    /// Invalid IP version (not 4)
    #[error("invalid IP version: {0}")]
    InvalidVersion(u8),
    /// Invalid IHL (Internet Header Length < 5)
    #[error("invalid IHL: {0}")]
    InvalidIhl(u8),
    /// Total length field disagrees with the header or the buffer
    #[error("invalid total length")]
    InvalidLength,
    /// Header checksum mismatch
    #[error("header checksum mismatch")]
    ChecksumMismatch,
}

/// IPv4 Header Structure
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version|  IHL  |    DSCP   |ECN|         Total Length          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Identification        |Flags|      Fragment Offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Time to Live |    Protocol   |         Header Checksum       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Source Address                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Destination Address                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Options present on inbound packets are skipped; outbound headers never
/// carry any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Differentiated Services Code Point
    pub dscp: u8,
    /// Explicit Congestion Notification
    pub ecn: u8,
    /// Total packet length (header + data) in bytes
    pub total_length: u16,
    pub identification: u16,
    /// 3-bit flags field, see [`flags`]
    pub flags: u8,
    /// Fragment offset in 8-byte blocks
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    /// Header checksum as seen on the wire (recomputed by `to_bytes`)
    pub checksum: u16,
    pub src_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
}

impl Ipv4Header {
    /// Create an outbound header: TTL 64, DF set, checksum filled in by `to_bytes`
    ///
    /// # Arguments
    /// * `src_ip` - Source IP address
    /// * `dest_ip` - Destination IP address
    /// * `protocol` - Upper-layer protocol
    /// * `payload_len` - Length of the payload data; the total length saturates at 65535
    pub fn new(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: IpProtocol, payload_len: u16) -> Self {
        Self {
            dscp: 0,
            ecn: 0,
            total_length: (MIN_HEADER_SIZE as u16).saturating_add(payload_len),
            identification: 0,
            flags: flags::DONT_FRAGMENT,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src_ip,
            dest_ip,
        }
    }

    /// Parse and validate an IPv4 header
    ///
    /// # Returns
    /// - `Ok((Ipv4Header, payload_offset))` - Parsed header and offset to payload data
    /// - `Err(Ipv4Error)` - Parse error
    ///
    /// # Validation
    /// - Version must be 4 and IHL at least 5
    /// - Total length must cover the header and fit in `data`
    /// - Header checksum must verify
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), Ipv4Error> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Ipv4Error::PacketTooShort);
        }

        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;
        if version != 4 {
            return Err(Ipv4Error::InvalidVersion(version));
        }
        if ihl < 5 {
            return Err(Ipv4Error::InvalidIhl(ihl));
        }

        let header_len = (ihl as usize) * 4;
        if data.len() < header_len {
            return Err(Ipv4Error::PacketTooShort);
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < header_len || (total_length as usize) > data.len() {
            return Err(Ipv4Error::InvalidLength);
        }

        if internet_checksum(&data[..header_len]) != 0 {
            return Err(Ipv4Error::ChecksumMismatch);
        }

        let flags_frag = u16::from_be_bytes([data[6], data[7]]);

        let header = Self {
            dscp: data[1] >> 2,
            ecn: data[1] & 0x03,
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags: (flags_frag >> 13) as u8,
            fragment_offset: flags_frag & 0x1FFF,
            ttl: data[8],
            protocol: IpProtocol::from(data[9]),
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src_ip: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dest_ip: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        };

        Ok((header, header_len))
    }

    /// Serialize the header; the checksum is calculated and inserted
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MIN_HEADER_SIZE);

        bytes.push((4 << 4) | 5);
        bytes.push((self.dscp << 2) | (self.ecn & 0x03));
        bytes.extend_from_slice(&self.total_length.to_be_bytes());
        bytes.extend_from_slice(&self.identification.to_be_bytes());
        let flags_frag = (((self.flags & 0x07) as u16) << 13) | (self.fragment_offset & 0x1FFF);
        bytes.extend_from_slice(&flags_frag.to_be_bytes());
        bytes.push(self.ttl);
        bytes.push(self.protocol.into());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.src_ip.octets());
        bytes.extend_from_slice(&self.dest_ip.octets());

        let checksum = internet_checksum(&bytes);
        bytes[10..12].copy_from_slice(&checksum.to_be_bytes());

        bytes
    }

    /// MF set or a nonzero offset
    pub fn is_fragmented(&self) -> bool {
        (self.flags & flags::MORE_FRAGMENTS) != 0 || self.fragment_offset != 0
    }

    pub fn dont_fragment(&self) -> bool {
        (self.flags & flags::DONT_FRAGMENT) != 0
    }
}

/// IPv4 Packet (Header + Payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub header: Ipv4Header,
    pub payload: Vec<u8>,
}

impl Ipv4Packet {
    /// Payloads past the 16-bit total length saturate it; `send_ipv4` rejects them earlier
    pub fn new(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: IpProtocol, payload: Vec<u8>) -> Self {
        let payload_len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
        let header = Ipv4Header::new(src_ip, dest_ip, protocol, payload_len);
        Self { header, payload }
    }

    /// Parse an IPv4 packet, trimming link-layer padding by the total length
    pub fn from_bytes(data: &[u8]) -> Result<Self, Ipv4Error> {
        let (header, offset) = Ipv4Header::from_bytes(data)?;
        let payload = data[offset..header.total_length as usize].to_vec();
        Ok(Self { header, payload })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header.to_bytes();
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Size of the serialized packet
    pub fn wire_len(&self) -> usize {
        MIN_HEADER_SIZE + self.payload.len()
    }
}

/// IPv4 Routing Table
///
/// Built once when the interface comes up. Determines if a destination is
/// on the local subnet or has to go through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingTable {
    pub local_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

impl RoutingTable {
    pub fn new(local_ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            local_ip,
            netmask,
            gateway,
        }
    }

    /// Determine the next hop for a destination IP
    ///
    /// # Returns
    /// - `Some(ip)` - Next hop IP (either destination if local, or gateway)
    /// - `None` - No route available
    pub fn next_hop(&self, dest_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.is_local(dest_ip) {
            Some(dest_ip)
        } else {
            self.gateway
        }
    }

    /// Check if a destination IP is on the local subnet
    pub fn is_local(&self, dest_ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        (u32::from(self.local_ip) & mask) == (u32::from(dest_ip) & mask)
    }

    pub fn is_our_ip(&self, ip: Ipv4Addr) -> bool {
        ip == self.local_ip
    }

    /// Directed broadcast address of the local subnet
    pub fn subnet_broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.local_ip) | !u32::from(self.netmask))
    }

    /// Limited or subnet broadcast
    pub fn is_broadcast(&self, ip: Ipv4Addr) -> bool {
        ip.is_broadcast() || ip == self.subnet_broadcast()
    }

    /// Receive filter: our address or a broadcast
    pub fn accepts(&self, dest_ip: Ipv4Addr) -> bool {
        self.is_our_ip(dest_ip) || self.is_broadcast(dest_ip)
    }
}
