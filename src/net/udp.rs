//! UDP Protocol Implementation (RFC 768)
//!
//! Connectionless datagrams dispatched by destination port. Datagrams for
//! unbound ports are dropped without an ICMP error.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};
use log::{debug, trace};
use thiserror::Error;

use crate::net::checksum::transport_checksum;
use crate::net::config::UdpConfig;
use crate::net::error::SocketError;
use crate::net::ipv4::{IpProtocol, IpTransmit};
use crate::net::socket::PortRegistry;

/// Minimum UDP header size (8 bytes)
pub const UDP_HEADER_SIZE: usize = 8;

/// Errors that can occur while parsing a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UdpError {
    /// Packet is too short to contain a valid UDP header
    #[error("datagram too short")]
    PacketTooShort,
    /// Length field doesn't match actual packet size
    #[error("length field disagrees with the packet")]
    InvalidLength,
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// UDP packet structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub src_port: u16,
    pub dest_port: u16,
    /// Length of UDP header + data (minimum 8 bytes)
    pub length: u16,
    /// Checksum (0 means the sender did not compute one)
    pub checksum: u16,
    pub data: Vec<u8>,
}

impl UdpPacket {
    /// Create a new UDP packet with calculated length (checksum 0)
    pub fn new(src_port: u16, dest_port: u16, data: Vec<u8>) -> Self {
        let length = (UDP_HEADER_SIZE + data.len()) as u16;
        Self {
            src_port,
            dest_port,
            length,
            checksum: 0,
            data,
        }
    }

    /// Parse a UDP packet from raw bytes
    ///
    /// Bytes past the length field are ignored. The checksum is not
    /// checked here, see [`UdpPacket::parse_verified`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UdpError> {
        if bytes.len() < UDP_HEADER_SIZE {
            return Err(UdpError::PacketTooShort);
        }

        let length = u16::from_be_bytes([bytes[4], bytes[5]]);
        if (length as usize) < UDP_HEADER_SIZE || length as usize > bytes.len() {
            return Err(UdpError::InvalidLength);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dest_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            length,
            checksum: u16::from_be_bytes([bytes[6], bytes[7]]),
            data: bytes[UDP_HEADER_SIZE..length as usize].to_vec(),
        })
    }

    /// Parse and verify the checksum against the pseudo-header
    ///
    /// A zero checksum means none was computed and is accepted.
    pub fn parse_verified(
        bytes: &[u8],
        src_ip: Ipv4Addr,
        dest_ip: Ipv4Addr,
    ) -> Result<Self, UdpError> {
        let packet = Self::from_bytes(bytes)?;
        if packet.checksum != 0
            && transport_checksum(
                src_ip,
                dest_ip,
                IpProtocol::UDP,
                &bytes[..packet.length as usize],
            ) != 0
        {
            return Err(UdpError::ChecksumMismatch);
        }
        Ok(packet)
    }

    /// Serialize as-is, with whatever is in `checksum`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length as usize);
        bytes.extend_from_slice(&self.src_port.to_be_bytes());
        bytes.extend_from_slice(&self.dest_port.to_be_bytes());
        bytes.extend_from_slice(&self.length.to_be_bytes());
        bytes.extend_from_slice(&self.checksum.to_be_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Serialize with the pseudo-header checksum filled in
    ///
    /// A computed checksum of zero goes on the wire as 0xFFFF.
    pub fn to_bytes_checksummed(&self, src_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> Vec<u8> {
        let mut bytes = Self {
            checksum: 0,
            ..self.clone()
        }
        .to_bytes();
        let checksum = match transport_checksum(src_ip, dest_ip, IpProtocol::UDP, &bytes) {
            0 => 0xFFFF,
            sum => sum,
        };
        bytes[6..8].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }
}

/// Identifies a bound UDP socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UdpId(u32);

impl UdpId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A received datagram and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src: SocketAddrV4,
    pub data: Vec<u8>,
}

struct UdpSocket {
    local_port: u16,
    rx_queue: VecDeque<Datagram>,
}

/// What happened to an inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpDelivery {
    Delivered(UdpId),
    /// No socket bound to the destination port
    NoSocket,
    /// Socket receive queue full
    QueueFull(UdpId),
}

/// Port-keyed datagram dispatch
pub struct UdpEngine {
    sockets: BTreeMap<UdpId, UdpSocket>,
    by_port: BTreeMap<u16, UdpId>,
    ports: PortRegistry,
    next_id: u32,
    config: UdpConfig,
}

impl UdpEngine {
    pub fn new(config: UdpConfig) -> Self {
        Self {
            sockets: BTreeMap::new(),
            by_port: BTreeMap::new(),
            ports: PortRegistry::new(),
            next_id: 0,
            config,
        }
    }

    /// Bind a socket to `port` (0 = allocate ephemeral port)
    pub fn bind(&mut self, port: u16) -> Result<UdpId, SocketError> {
        let local_port = self.ports.bind(port)?;
        let id = UdpId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        self.sockets.insert(
            id,
            UdpSocket {
                local_port,
                rx_queue: VecDeque::new(),
            },
        );
        self.by_port.insert(local_port, id);
        debug!("UDP: bound socket to port {}", local_port);
        Ok(id)
    }

    /// Release the socket and its port; queued datagrams are discarded
    pub fn close(&mut self, id: UdpId) -> Result<(), SocketError> {
        let socket = self.sockets.remove(&id).ok_or(SocketError::InvalidHandle)?;
        self.by_port.remove(&socket.local_port);
        self.ports.unbind(socket.local_port);
        debug!("UDP: unbound port {}", socket.local_port);
        Ok(())
    }

    pub fn local_port(&self, id: UdpId) -> Result<u16, SocketError> {
        self.socket(id).map(|socket| socket.local_port)
    }

    fn socket(&self, id: UdpId) -> Result<&UdpSocket, SocketError> {
        self.sockets.get(&id).ok_or(SocketError::InvalidHandle)
    }

    /// Send data to a remote address
    ///
    /// # Arguments
    /// * `id` - Sending socket
    /// * `dest` - Destination address and port
    /// * `data` - Payload; must fit in one unfragmented IP packet
    /// * `ip` - IP layer to transmit through
    pub fn send_to(
        &mut self,
        id: UdpId,
        dest: SocketAddrV4,
        data: &[u8],
        ip: &mut impl IpTransmit,
    ) -> Result<(), SocketError> {
        let src_port = self.socket(id)?.local_port;
        trace!("UDP: sending {} bytes from port {} to {}", data.len(), src_port, dest);

        let packet = UdpPacket::new(src_port, dest.port(), data.to_vec());
        let bytes = packet.to_bytes_checksummed(ip.local_ip(), *dest.ip());
        ip.send_ipv4(*dest.ip(), IpProtocol::Udp, bytes)?;
        Ok(())
    }

    /// Next queued datagram, if any
    pub fn recv_from(&mut self, id: UdpId) -> Result<Option<Datagram>, SocketError> {
        let socket = self.sockets.get_mut(&id).ok_or(SocketError::InvalidHandle)?;
        Ok(socket.rx_queue.pop_front())
    }

    pub fn has_data(&self, id: UdpId) -> Result<bool, SocketError> {
        self.socket(id).map(|socket| !socket.rx_queue.is_empty())
    }

    /// Handle an inbound UDP packet
    ///
    /// # Arguments
    /// * `src_ip` - Source IPv4 address
    /// * `dest_ip` - Destination IPv4 address
    /// * `data` - UDP packet bytes
    pub fn receive(
        &mut self,
        src_ip: Ipv4Addr,
        dest_ip: Ipv4Addr,
        data: &[u8],
    ) -> Result<UdpDelivery, UdpError> {
        let packet = UdpPacket::parse_verified(data, src_ip, dest_ip)?;

        let Some(&id) = self.by_port.get(&packet.dest_port) else {
            trace!("UDP: no socket bound to port {}, dropping", packet.dest_port);
            return Ok(UdpDelivery::NoSocket);
        };
        let Some(socket) = self.sockets.get_mut(&id) else {
            return Ok(UdpDelivery::NoSocket);
        };

        if socket.rx_queue.len() >= self.config.rx_queue_len {
            debug!("UDP: port {} receive queue full, dropping", socket.local_port);
            return Ok(UdpDelivery::QueueFull(id));
        }

        socket.rx_queue.push_back(Datagram {
            src: SocketAddrV4::new(src_ip, packet.src_port),
            data: packet.data,
        });
        Ok(UdpDelivery::Delivered(id))
    }

    /// Handles of every bound socket
    pub fn sockets(&self) -> Vec<UdpId> {
        self.sockets.keys().copied().collect()
    }
}
