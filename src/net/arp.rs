//! ARP (Address Resolution Protocol) - RFC 826
//!
//! Maps IPv4 addresses to MAC addresses on local networks.
//! Packet format: [HW Type (2)][Proto Type (2)][HW Len (1)][Proto Len (1)]
//!                [Operation (2)][Sender MAC (6)][Sender IP (4)]
//!                [Target MAC (6)][Target IP (4)]
//!
//! Cache entries never expire and unanswered requests are not retried.
//! Outbound packets waiting on a resolution are held per target address
//! and released in arrival order when the mapping is learned.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use log::{debug, trace, warn};
use thiserror::Error;

use crate::net::config::ArpConfig;
use crate::net::ethernet::MacAddress;
use crate::net::timer::Instant;

/// ARP hardware type for Ethernet
pub const HW_TYPE_ETHERNET: u16 = 1;

/// ARP protocol type for IPv4
pub const PROTO_TYPE_IPV4: u16 = 0x0800;

/// ARP packet size (fixed at 28 bytes)
pub const ARP_PACKET_SIZE: usize = 28;

/// Errors that can occur during ARP operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArpError {
    /// Packet is too short to be valid
    #[error("packet too short")]
    PacketTooShort,
    /// Invalid hardware type (not Ethernet)
    #[error("hardware type is not Ethernet")]
    InvalidHardwareType,
    /// Invalid protocol type (not IPv4)
    #[error("protocol type is not IPv4")]
    InvalidProtocolType,
    /// Invalid hardware address length
    #[error("invalid hardware address length")]
    InvalidHardwareLength,
    /// Invalid protocol address length
    #[error("invalid protocol address length")]
    InvalidProtocolLength,
    /// Unknown operation code
    #[error("unknown operation {0}")]
    UnknownOperation(u16),
    /// Too many packets already waiting on this address
    #[error("pending queue for the address is full")]
    PendingQueueFull,
}

/// ARP operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
}

impl ArpOperation {
    pub const REQUEST: u16 = 1;
    pub const REPLY: u16 = 2;

    fn code(self) -> u16 {
        match self {
            ArpOperation::Request => Self::REQUEST,
            ArpOperation::Reply => Self::REPLY,
        }
    }
}

/// ARP packet for Ethernet/IPv4
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Create a new ARP request packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address
    /// * `target_ip` - The IP address we want to resolve
    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOperation::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::UNSPECIFIED,
            target_ip,
        }
    }

    /// Create a new ARP reply packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address
    /// * `target_mac` - The MAC address of the requester
    /// * `target_ip` - The IP address of the requester
    pub fn reply(
        sender_mac: MacAddress,
        sender_ip: Ipv4Addr,
        target_mac: MacAddress,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ArpOperation::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Parse an ARP packet from raw bytes
    ///
    /// Trailing Ethernet padding is ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ArpError> {
        if data.len() < ARP_PACKET_SIZE {
            return Err(ArpError::PacketTooShort);
        }

        if u16::from_be_bytes([data[0], data[1]]) != HW_TYPE_ETHERNET {
            return Err(ArpError::InvalidHardwareType);
        }
        if u16::from_be_bytes([data[2], data[3]]) != PROTO_TYPE_IPV4 {
            return Err(ArpError::InvalidProtocolType);
        }
        if data[4] != 6 {
            return Err(ArpError::InvalidHardwareLength);
        }
        if data[5] != 4 {
            return Err(ArpError::InvalidProtocolLength);
        }

        let operation = match u16::from_be_bytes([data[6], data[7]]) {
            ArpOperation::REQUEST => ArpOperation::Request,
            ArpOperation::REPLY => ArpOperation::Reply,
            other => return Err(ArpError::UnknownOperation(other)),
        };

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&data[18..24]);

        Ok(Self {
            operation,
            sender_mac: MacAddress(sender_mac),
            sender_ip: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            target_mac: MacAddress(target_mac),
            target_ip: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
        })
    }

    /// Convert the ARP packet to bytes for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ARP_PACKET_SIZE);
        bytes.extend_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
        bytes.extend_from_slice(&PROTO_TYPE_IPV4.to_be_bytes());
        bytes.push(6);
        bytes.push(4);
        bytes.extend_from_slice(&self.operation.code().to_be_bytes());
        bytes.extend_from_slice(&self.sender_mac.0);
        bytes.extend_from_slice(&self.sender_ip.octets());
        bytes.extend_from_slice(&self.target_mac.0);
        bytes.extend_from_slice(&self.target_ip.octets());
        bytes
    }

    pub fn is_request(&self) -> bool {
        self.operation == ArpOperation::Request
    }

    pub fn is_reply(&self) -> bool {
        self.operation == ArpOperation::Reply
    }

    /// Sender fields carry a usable mapping (not a probe)
    fn has_sender(&self) -> bool {
        !self.sender_ip.is_unspecified() && self.sender_mac.is_unicast()
    }
}

/// IP → MAC mappings; entries live for the lifetime of the stack
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: BTreeMap<Ipv4Addr, MacAddress>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a mapping
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddress) {
        self.entries.insert(ip, mac);
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.entries.get(&ip).copied()
    }

    pub fn remove(&mut self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.entries.remove(&ip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in address order (for debugging/display)
    pub fn entries(&self) -> Vec<(Ipv4Addr, MacAddress)> {
        self.entries.iter().map(|(ip, mac)| (*ip, *mac)).collect()
    }
}

#[derive(Debug)]
struct PendingQueue {
    /// When the request for this address went out
    requested_at: Instant,
    packets: VecDeque<Vec<u8>>,
}

/// Outcome of [`ArpResolver::resolve`]
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Mapping known; the packet is handed back for immediate transmission
    Resolved(MacAddress, Vec<u8>),
    /// Packet queued; `send_request` is set when no request is outstanding yet
    Pending { send_request: bool },
}

/// What the owner must transmit after an inbound ARP packet
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArpOutcome {
    /// Reply to send back to the requester
    pub reply: Option<ArpPacket>,
    /// Packets released by a new mapping, in arrival order
    pub released: Vec<(MacAddress, Vec<u8>)>,
}

/// Resolution cache plus the pending-send queues
#[derive(Debug)]
pub struct ArpResolver {
    cache: ArpCache,
    pending: BTreeMap<Ipv4Addr, PendingQueue>,
    config: ArpConfig,
}

impl ArpResolver {
    pub fn new(config: ArpConfig) -> Self {
        Self {
            cache: ArpCache::new(),
            pending: BTreeMap::new(),
            config,
        }
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.cache.lookup(ip)
    }

    /// Resolve `ip` for an outbound packet
    ///
    /// # Returns
    /// * `Resolution::Resolved` with the packet when the mapping is cached
    /// * `Resolution::Pending` when the packet was queued
    /// * `Err(ArpError::PendingQueueFull)` when the per-address bound is reached
    pub fn resolve(
        &mut self,
        ip: Ipv4Addr,
        packet: Vec<u8>,
        now: Instant,
    ) -> Result<Resolution, ArpError> {
        if let Some(mac) = self.cache.lookup(ip) {
            return Ok(Resolution::Resolved(mac, packet));
        }

        let send_request = !self.pending.contains_key(&ip);
        let queue = self.pending.entry(ip).or_insert_with(|| PendingQueue {
            requested_at: now,
            packets: VecDeque::new(),
        });

        if queue.packets.len() >= self.config.max_pending_per_ip {
            warn!("ARP: pending queue for {} full, refusing packet", ip);
            return Err(ArpError::PendingQueueFull);
        }
        queue.packets.push_back(packet);
        trace!("ARP: queued packet for {} ({} pending)", ip, queue.packets.len());

        Ok(Resolution::Pending { send_request })
    }

    /// Record a mapping and release everything queued for it
    pub fn learn(&mut self, ip: Ipv4Addr, mac: MacAddress) -> Vec<(MacAddress, Vec<u8>)> {
        self.cache.insert(ip, mac);
        match self.pending.remove(&ip) {
            Some(queue) => {
                debug!("ARP: {} is at {}, releasing {} packets", ip, mac, queue.packets.len());
                queue.packets.into_iter().map(|packet| (mac, packet)).collect()
            }
            None => Vec::new(),
        }
    }

    /// Handle an incoming ARP packet
    ///
    /// # Arguments
    /// * `packet` - Parsed ARP packet
    /// * `our_mac` - Our MAC address (for sending replies)
    /// * `our_ip` - Our IP address (to check if the request is for us)
    pub fn handle_packet(
        &mut self,
        packet: &ArpPacket,
        our_mac: MacAddress,
        our_ip: Ipv4Addr,
    ) -> ArpOutcome {
        let mut outcome = ArpOutcome::default();

        // Requests, replies and gratuitous announcements all teach us the sender
        if packet.has_sender() && packet.sender_ip != our_ip {
            outcome.released = self.learn(packet.sender_ip, packet.sender_mac);
        }

        if packet.is_request() && packet.target_ip == our_ip {
            outcome.reply = Some(ArpPacket::reply(
                our_mac,
                our_ip,
                packet.sender_mac,
                packet.sender_ip,
            ));
        }

        outcome
    }

    /// Drop pending queues whose request has gone unanswered too long
    ///
    /// # Returns
    /// Number of packets discarded
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.config.pending_timeout else {
            return 0;
        };

        let mut dropped = 0;
        self.pending.retain(|ip, queue| {
            if now.saturating_since(queue.requested_at) >= timeout {
                debug!("ARP: no reply from {}, dropping {} packets", ip, queue.packets.len());
                dropped += queue.packets.len();
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Packets waiting on `ip`
    pub fn pending_len(&self, ip: Ipv4Addr) -> usize {
        self.pending.get(&ip).map_or(0, |queue| queue.packets.len())
    }

    pub fn is_pending(&self, ip: Ipv4Addr) -> bool {
        self.pending.contains_key(&ip)
    }
}
