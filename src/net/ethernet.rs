//Ethernet Frame Layer (OSI Layer 2)
//
//Handles Ethernet II frame parsing, building, and EtherType dispatch.
//Frame structure: [Dest MAC (6)][Src MAC (6)][EtherType (2)][Payload (46-1500)]
//The FCS is appended and stripped by the NIC, never by this codec.

use alloc::vec::Vec;
use core::fmt;
use thiserror::Error;

/// Minimum Ethernet payload size (padding required if smaller)
pub const MIN_PAYLOAD_SIZE: usize = 46;

/// Maximum Ethernet payload size (MTU)
pub const MAX_PAYLOAD_SIZE: usize = 1500;

/// Ethernet frame header size
pub const HEADER_SIZE: usize = 14;

/// A 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Broadcast MAC address (FF:FF:FF:FF:FF:FF)
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// All-zero address, used as the unknown target in ARP requests
    pub const UNSPECIFIED: MacAddress = MacAddress([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set, excluding broadcast
    pub fn is_multicast(&self) -> bool {
        (self.0[0] & 0x01) != 0 && !self.is_broadcast()
    }

    pub fn is_unicast(&self) -> bool {
        (self.0[0] & 0x01) == 0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// EtherType field - indicates protocol of payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Arp,
    Unknown(u16),
}

impl EtherType {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            Self::IPV4 => EtherType::Ipv4,
            Self::ARP => EtherType::Arp,
            other => EtherType::Unknown(other),
        }
    }
}

impl From<EtherType> for u16 {
    fn from(ethertype: EtherType) -> Self {
        match ethertype {
            EtherType::Ipv4 => EtherType::IPV4,
            EtherType::Arp => EtherType::ARP,
            EtherType::Unknown(value) => value,
        }
    }
}

/// Errors that can occur during Ethernet frame operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EthernetError {
    /// Frame is too short to be valid
    #[error("frame shorter than the 14-byte header")]
    FrameTooShort,
    /// Payload exceeds MTU
    #[error("payload exceeds the 1500-byte MTU")]
    PayloadTooLarge,
}

/// Represents an Ethernet frame
#[derive(Debug, Clone, PartialEq)]
pub struct EthernetFrame {
    pub dest_mac: MacAddress,
    pub src_mac: MacAddress,
    pub ethertype: EtherType,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// # Arguments
    /// * `dest` - Destination MAC address
    /// * `src` - Source MAC address
    /// * `ethertype` - Protocol of the payload
    /// * `payload` - Frame payload data
    pub fn new(
        dest: MacAddress,
        src: MacAddress,
        ethertype: EtherType,
        payload: Vec<u8>,
    ) -> Result<Self, EthernetError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EthernetError::PayloadTooLarge);
        }

        Ok(Self {
            dest_mac: dest,
            src_mac: src,
            ethertype,
            payload,
        })
    }

    /// Parse an Ethernet frame from raw bytes
    ///
    /// Everything after the header is payload, including any minimum-size
    /// padding; upper layers trim by their own length fields.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EthernetError> {
        if data.len() < HEADER_SIZE {
            return Err(EthernetError::FrameTooShort);
        }

        let mut dest_mac = [0u8; 6];
        dest_mac.copy_from_slice(&data[0..6]);

        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&data[6..12]);

        let ethertype = u16::from_be_bytes([data[12], data[13]]);

        Ok(Self {
            dest_mac: MacAddress(dest_mac),
            src_mac: MacAddress(src_mac),
            ethertype: EtherType::from(ethertype),
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }

    /// Convert the Ethernet frame to bytes for transmission
    ///
    /// Pads the payload to the 46-byte minimum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + self.payload.len().max(MIN_PAYLOAD_SIZE));

        frame.extend_from_slice(&self.dest_mac.0);
        frame.extend_from_slice(&self.src_mac.0);
        frame.extend_from_slice(&u16::from(self.ethertype).to_be_bytes());
        frame.extend_from_slice(&self.payload);

        if frame.len() < HEADER_SIZE + MIN_PAYLOAD_SIZE {
            frame.resize(HEADER_SIZE + MIN_PAYLOAD_SIZE, 0);
        }

        frame
    }

    /// Check if the frame is a broadcast frame
    pub fn is_broadcast(&self) -> bool {
        self.dest_mac.is_broadcast()
    }

    /// Check if the frame is a multicast frame
    pub fn is_multicast(&self) -> bool {
        self.dest_mac.is_multicast()
    }

    /// Check if the frame is a unicast frame
    pub fn is_unicast(&self) -> bool {
        self.dest_mac.is_unicast()
    }

    /// Receive filter: unicast to us, broadcast, or multicast
    pub fn is_for(&self, our_mac: MacAddress) -> bool {
        !self.is_unicast() || self.dest_mac == our_mac
    }

    /// Get frame size on the wire (excluding FCS)
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len().max(MIN_PAYLOAD_SIZE)
    }

    /// Get the payload as a slice
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
