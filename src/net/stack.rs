//! Network Stack Integration
//!
//! [`NetStack`] owns one interface and every protocol engine on top of it.
//! Frames come in through [`NetStack::poll`] (or [`NetStack::receive_frame`]),
//! time advances through [`NetStack::tick`], and applications use the socket
//! calls. Nothing here is global; an embedding kernel that shares the stack
//! between tasks wraps it in a `spin::Mutex` (see [`crate::net::io`]).

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::task::Waker;
use futures_util::task::AtomicWaker;
use log::{debug, info, trace, warn};

use crate::drivers::net::{FrameSink, NetworkDevice};
use crate::net::arp::{ArpPacket, ArpResolver, Resolution};
use crate::net::config::{NetworkConfig, StackConfig};
use crate::net::error::{NetError, SocketError};
use crate::net::ethernet::{EtherType, EthernetFrame, MAX_PAYLOAD_SIZE, MacAddress};
use crate::net::icmp::{EchoReply, IcmpHandler, IcmpPacket};
use crate::net::ipv4::{IpProtocol, IpTransmit, Ipv4Error, Ipv4Packet, MIN_HEADER_SIZE, RoutingTable};
use crate::net::socket::{Completion, Interest, Received, SocketHandle, WaitToken};
use crate::net::tcp::{TcpEngine, TcpInfo, TcpState, TcpStats};
use crate::net::timer::Instant;
use crate::net::udp::{Datagram, UdpDelivery, UdpEngine, UdpError};

/// Stack counters
///
/// Malformed and unwanted input is dropped silently; this is where the
/// drops show up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub tx_errors: u64,
    /// Frames or packets that failed to parse
    pub malformed: u64,
    /// Unicast to another MAC, or an IP we do not answer for
    pub not_for_us: u64,
    pub unknown_ethertype: u64,
    pub unknown_protocol: u64,
    pub ip_checksum_errors: u64,
    pub ip_fragments_dropped: u64,
    pub arp_requests_sent: u64,
    pub arp_replies_sent: u64,
    pub arp_pending_overflow: u64,
    /// Packets discarded because their ARP request went unanswered
    pub arp_pending_expired: u64,
    pub icmp_in: u64,
    pub icmp_errors: u64,
    pub icmp_echoes_answered: u64,
    pub udp_checksum_errors: u64,
    pub udp_no_socket: u64,
    pub udp_queue_overflow: u64,
    pub tcp: TcpStats,
}

/// Link + IP layer: the device, addressing, ARP and the IPv4 send path
struct Interface<D> {
    device: D,
    mac: MacAddress,
    network: NetworkConfig,
    routes: OnceCell<RoutingTable>,
    arp: ArpResolver,
    ip_ident: u16,
    now: Instant,
    stats: NetStats,
}

impl<D: NetworkDevice> Interface<D> {
    fn routes(&self) -> Result<RoutingTable, NetError> {
        self.routes
            .try_get()
            .copied()
            .map_err(|_| NetError::NotConfigured)
    }

    fn transmit_frame(
        &mut self,
        dest: MacAddress,
        ethertype: EtherType,
        payload: Vec<u8>,
    ) -> Result<(), NetError> {
        let frame = EthernetFrame::new(dest, self.mac, ethertype, payload)?;
        match self.device.transmit(&frame.to_bytes()) {
            Ok(()) => {
                self.stats.frames_out += 1;
                Ok(())
            }
            Err(err) => {
                self.stats.tx_errors += 1;
                warn!("TX: {} failed to transmit: {}", self.device.device_name(), err);
                Err(err.into())
            }
        }
    }

    fn send_arp_request(&mut self, target: Ipv4Addr) {
        let request = ArpPacket::request(self.mac, self.network.ip_addr, target);
        debug!("ARP: who has {}? tell {}", target, self.network.ip_addr);
        if self
            .transmit_frame(MacAddress::BROADCAST, EtherType::Arp, request.to_bytes())
            .is_ok()
        {
            self.stats.arp_requests_sent += 1;
        }
    }

    fn release(&mut self, released: Vec<(MacAddress, Vec<u8>)>) {
        for (mac, packet) in released {
            if let Err(err) = self.transmit_frame(mac, EtherType::Ipv4, packet) {
                debug!("TX: released packet lost: {}", err);
            }
        }
    }
}

impl<D: NetworkDevice> IpTransmit for Interface<D> {
    fn local_ip(&self) -> Ipv4Addr {
        self.network.ip_addr
    }

    fn send_ipv4(
        &mut self,
        dest: Ipv4Addr,
        protocol: IpProtocol,
        payload: Vec<u8>,
    ) -> Result<(), NetError> {
        let routes = self.routes()?;
        if MIN_HEADER_SIZE + payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NetError::PayloadTooLarge);
        }

        let mut packet = Ipv4Packet::new(routes.local_ip, dest, protocol, payload);
        packet.header.identification = self.ip_ident;
        self.ip_ident = self.ip_ident.wrapping_add(1);
        let bytes = packet.to_bytes();
        trace!("TX: {:?} {} -> {} ({} bytes)", protocol, routes.local_ip, dest, bytes.len());

        if routes.is_broadcast(dest) {
            return self.transmit_frame(MacAddress::BROADCAST, EtherType::Ipv4, bytes);
        }
        if routes.is_our_ip(dest) {
            let mac = self.mac;
            return self.transmit_frame(mac, EtherType::Ipv4, bytes);
        }

        let next_hop = routes.next_hop(dest).ok_or(NetError::NoRoute)?;
        match self.arp.resolve(next_hop, bytes, self.now) {
            Ok(Resolution::Resolved(mac, bytes)) => {
                self.transmit_frame(mac, EtherType::Ipv4, bytes)
            }
            Ok(Resolution::Pending { send_request }) => {
                if send_request {
                    self.send_arp_request(next_hop);
                }
                Ok(())
            }
            Err(err) => {
                self.stats.arp_pending_overflow += 1;
                Err(err.into())
            }
        }
    }
}

/// A complete network stack bound to one device
pub struct NetStack<D: NetworkDevice> {
    iface: Interface<D>,
    tcp: TcpEngine,
    udp: UdpEngine,
    icmp: IcmpHandler,
    sink: FrameSink,
    wakers: BTreeMap<SocketHandle, AtomicWaker>,
    /// Deadlines of registered waiters
    deadlines: BTreeMap<SocketHandle, Instant>,
    ready: BTreeSet<SocketHandle>,
    config: StackConfig,
}

impl<D: NetworkDevice> NetStack<D> {
    /// Create a stack on top of `device`
    ///
    /// The interface stays down until [`bring_up`](Self::bring_up).
    pub fn new(device: D, config: StackConfig) -> Self {
        let mac = device.mac_address();
        info!("Network: {} ({}) attached", device.device_name(), mac);
        Self {
            iface: Interface {
                device,
                mac,
                network: config.network,
                routes: OnceCell::uninit(),
                arp: ArpResolver::new(config.arp),
                ip_ident: 0,
                now: Instant::ZERO,
                stats: NetStats::default(),
            },
            tcp: TcpEngine::new(config.tcp, config.tick_period),
            udp: UdpEngine::new(config.udp),
            icmp: IcmpHandler::new(),
            sink: FrameSink::new(config.frame_queue_len),
            wakers: BTreeMap::new(),
            deadlines: BTreeMap::new(),
            ready: BTreeSet::new(),
            config,
        }
    }

    /// Compute the routing table and start accepting IP traffic
    pub fn bring_up(&mut self) -> Result<(), NetError> {
        let network = self.iface.network;
        if !self.config.is_valid() {
            return Err(NetError::InvalidConfig);
        }
        self.iface
            .routes
            .try_init_once(|| RoutingTable::new(network.ip_addr, network.netmask, network.gateway))
            .map_err(|_| NetError::AlreadyConfigured)?;

        info!(
            "Network configured: {} / {} gateway {:?}",
            network.ip_addr, network.netmask, network.gateway
        );
        Ok(())
    }

    pub fn is_up(&self) -> bool {
        self.iface.routes.try_get().is_ok()
    }

    /// Receive path to hand to the driver
    pub fn frame_sink(&self) -> FrameSink {
        self.sink.clone()
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn network(&self) -> NetworkConfig {
        self.iface.network
    }

    pub fn mac_address(&self) -> MacAddress {
        self.iface.mac
    }

    pub fn device(&self) -> &D {
        &self.iface.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.iface.device
    }

    pub fn now(&self) -> Instant {
        self.iface.now
    }

    pub fn stats(&self) -> NetStats {
        NetStats {
            tcp: self.tcp.stats(),
            ..self.iface.stats
        }
    }

    /// Process every frame waiting in the sink, then whatever the device holds
    ///
    /// # Returns
    /// Number of frames processed
    pub fn poll(&mut self) -> usize {
        let mut processed = 0;
        while let Some(frame) = self.sink.pop() {
            self.receive_frame(&frame);
            processed += 1;
        }
        while let Some(frame) = self.iface.device.receive() {
            self.receive_frame(&frame);
            processed += 1;
        }
        processed
    }

    /// Advance the clock by one tick period and run expired timers
    pub fn tick(&mut self) {
        let now = self.iface.now + self.config.tick_period;
        self.iface.now = now;

        self.tcp.on_tick(now, &mut self.iface);

        let expired = self.iface.arp.expire_pending(now);
        self.iface.stats.arp_pending_expired += expired as u64;

        let due: Vec<SocketHandle> = self
            .deadlines
            .iter()
            .filter(|&(_, deadline)| *deadline <= now)
            .map(|(&handle, _)| handle)
            .collect();
        for handle in due {
            self.deadlines.remove(&handle);
            self.wake(handle);
        }

        self.collect_tcp_ready();
    }

    /// Run one inbound frame through the stack
    pub fn receive_frame(&mut self, bytes: &[u8]) {
        self.iface.stats.frames_in += 1;

        let frame = match EthernetFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                self.iface.stats.malformed += 1;
                trace!("RX: dropping frame: {}", err);
                return;
            }
        };
        if !frame.is_for(self.iface.mac) {
            self.iface.stats.not_for_us += 1;
            return;
        }

        match frame.ethertype {
            EtherType::Arp => self.handle_arp(&frame.payload),
            EtherType::Ipv4 => self.handle_ipv4(&frame.payload),
            EtherType::Unknown(ethertype) => {
                self.iface.stats.unknown_ethertype += 1;
                trace!("RX: unknown EtherType 0x{:04X}", ethertype);
            }
        }

        self.collect_tcp_ready();
    }

    fn handle_arp(&mut self, payload: &[u8]) {
        let packet = match ArpPacket::from_bytes(payload) {
            Ok(packet) => packet,
            Err(err) => {
                self.iface.stats.malformed += 1;
                trace!("RX: invalid ARP packet: {}", err);
                return;
            }
        };

        let up = self.is_up();
        let our_ip = self.iface.network.ip_addr;
        let outcome = self.iface.arp.handle_packet(&packet, self.iface.mac, our_ip);

        // Not answering for an address we have not taken yet
        if let Some(reply) = outcome.reply.filter(|_| up) {
            let dest = reply.target_mac;
            if self
                .iface
                .transmit_frame(dest, EtherType::Arp, reply.to_bytes())
                .is_ok()
            {
                self.iface.stats.arp_replies_sent += 1;
            }
        }
        self.iface.release(outcome.released);
    }

    fn handle_ipv4(&mut self, payload: &[u8]) {
        let Ok(routes) = self.iface.routes() else {
            self.iface.stats.not_for_us += 1;
            return;
        };

        let packet = match Ipv4Packet::from_bytes(payload) {
            Ok(packet) => packet,
            Err(Ipv4Error::ChecksumMismatch) => {
                self.iface.stats.ip_checksum_errors += 1;
                return;
            }
            Err(err) => {
                self.iface.stats.malformed += 1;
                trace!("RX: invalid IPv4 packet: {}", err);
                return;
            }
        };

        let header = &packet.header;
        if !routes.accepts(header.dest_ip) {
            self.iface.stats.not_for_us += 1;
            return;
        }
        if header.is_fragmented() {
            self.iface.stats.ip_fragments_dropped += 1;
            debug!("RX: dropping fragment from {}", header.src_ip);
            return;
        }

        let (src, dest) = (header.src_ip, header.dest_ip);
        let unicast = routes.is_our_ip(dest);
        match header.protocol {
            IpProtocol::Icmp if unicast => self.handle_icmp(src, &packet.payload),
            IpProtocol::Tcp if unicast => {
                // Counted in the engine's stats
                if let Err(err) = self.tcp.on_segment(src, dest, &packet.payload, &mut self.iface) {
                    trace!("RX: invalid TCP segment from {}: {}", src, err);
                }
            }
            IpProtocol::Udp => self.handle_udp(src, dest, &packet.payload),
            IpProtocol::Icmp | IpProtocol::Tcp => {
                self.iface.stats.not_for_us += 1;
            }
            IpProtocol::Unknown(protocol) => {
                self.iface.stats.unknown_protocol += 1;
                trace!("RX: unsupported IPv4 protocol {}", protocol);
            }
        }
    }

    fn handle_icmp(&mut self, src: Ipv4Addr, payload: &[u8]) {
        self.iface.stats.icmp_in += 1;
        match self.icmp.handle(src, payload, self.iface.now) {
            Ok(Some(reply)) => match self.iface.send_ipv4(src, IpProtocol::Icmp, reply) {
                Ok(()) => self.iface.stats.icmp_echoes_answered += 1,
                Err(err) => debug!("ICMP: echo reply to {} failed: {}", src, err),
            },
            Ok(None) => {}
            Err(err) => {
                self.iface.stats.icmp_errors += 1;
                trace!("RX: invalid ICMP packet from {}: {}", src, err);
            }
        }
    }

    fn handle_udp(&mut self, src: Ipv4Addr, dest: Ipv4Addr, payload: &[u8]) {
        match self.udp.receive(src, dest, payload) {
            Ok(UdpDelivery::Delivered(id)) => self.mark_ready(SocketHandle::Udp(id)),
            Ok(UdpDelivery::NoSocket) => self.iface.stats.udp_no_socket += 1,
            Ok(UdpDelivery::QueueFull(_)) => self.iface.stats.udp_queue_overflow += 1,
            Err(UdpError::ChecksumMismatch) => self.iface.stats.udp_checksum_errors += 1,
            Err(err) => {
                self.iface.stats.malformed += 1;
                trace!("RX: invalid UDP packet from {}: {}", src, err);
            }
        }
    }

    fn collect_tcp_ready(&mut self) {
        for id in self.tcp.take_ready() {
            self.mark_ready(SocketHandle::Tcp(id));
        }
    }

    fn mark_ready(&mut self, handle: SocketHandle) {
        self.ready.insert(handle);
        self.wake(handle);
    }

    fn wake(&self, handle: SocketHandle) {
        if let Some(waker) = self.wakers.get(&handle) {
            waker.wake();
        }
    }

    fn token(&self, handle: SocketHandle, interest: Interest) -> WaitToken {
        WaitToken {
            handle,
            interest,
            deadline: self.config.socket_timeout.map(|timeout| self.iface.now + timeout),
        }
    }

    /// Open a TCP connection
    ///
    /// The SYN is sent immediately. The call suspends until the handshake
    /// completes; the token carries the new handle.
    pub fn connect(&mut self, remote: SocketAddrV4) -> Result<Completion<SocketHandle>, SocketError> {
        if !self.is_up() {
            return Err(NetError::NotConfigured.into());
        }
        let id = self.tcp.connect(remote, &mut self.iface)?;
        let handle = SocketHandle::Tcp(id);
        if self.tcp.connected(id)? {
            return Ok(Completion::Ready(handle));
        }
        Ok(Completion::Suspend(self.token(handle, Interest::Connected)))
    }

    /// Listen for TCP connections on `port`
    pub fn listen(&mut self, port: u16, backlog: usize) -> Result<SocketHandle, SocketError> {
        if !self.is_up() {
            return Err(NetError::NotConfigured.into());
        }
        self.tcp
            .listen(port, backlog, &self.iface)
            .map(SocketHandle::Tcp)
    }

    pub fn accept(&mut self, listener: SocketHandle) -> Result<Completion<SocketHandle>, SocketError> {
        let SocketHandle::Tcp(id) = listener else {
            return Err(SocketError::InvalidState);
        };
        match self.tcp.accept(id)? {
            Some(child) => {
                self.ready.remove(&listener);
                Ok(Completion::Ready(SocketHandle::Tcp(child)))
            }
            None => Ok(Completion::Suspend(self.token(listener, Interest::Acceptable))),
        }
    }

    /// Queue bytes on a TCP connection
    ///
    /// # Returns
    /// Bytes accepted; may be short when the send buffer is nearly full
    pub fn send(&mut self, handle: SocketHandle, data: &[u8]) -> Result<usize, SocketError> {
        let SocketHandle::Tcp(id) = handle else {
            return Err(SocketError::InvalidState);
        };
        self.tcp.send(id, data, &mut self.iface)
    }

    /// Read up to `max_len` bytes from a TCP connection
    pub fn recv(&mut self, handle: SocketHandle, max_len: usize) -> Result<Completion<Received>, SocketError> {
        let SocketHandle::Tcp(id) = handle else {
            return Err(SocketError::InvalidState);
        };
        match self.tcp.recv(id, max_len, &mut self.iface)? {
            Some(received) => Ok(Completion::Ready(received)),
            None => Ok(Completion::Suspend(self.token(handle, Interest::Readable))),
        }
    }

    /// Release a TCP or UDP handle
    pub fn close(&mut self, handle: SocketHandle) -> Result<(), SocketError> {
        self.ready.remove(&handle);
        self.deadlines.remove(&handle);
        if let Some(waker) = self.wakers.remove(&handle) {
            waker.wake();
        }

        match handle {
            SocketHandle::Tcp(id) => self.tcp.close(id, &mut self.iface),
            SocketHandle::Udp(id) => self.udp.close(id),
        }
    }

    /// Non-blocking readability check
    ///
    /// A failed connection is readable: the next call reports its error.
    pub fn poll_readable(&self, handle: SocketHandle) -> bool {
        let readable = match handle {
            SocketHandle::Tcp(id) => self.tcp.readable(id),
            SocketHandle::Udp(id) => self.udp.has_data(id),
        };
        match readable {
            Ok(readable) => readable,
            Err(SocketError::InvalidHandle) => false,
            Err(_) => true,
        }
    }

    pub fn udp_bind(&mut self, port: u16) -> Result<SocketHandle, SocketError> {
        self.udp.bind(port).map(SocketHandle::Udp)
    }

    pub fn send_to(&mut self, handle: SocketHandle, dest: SocketAddrV4, data: &[u8]) -> Result<(), SocketError> {
        let SocketHandle::Udp(id) = handle else {
            return Err(SocketError::InvalidState);
        };
        self.udp.send_to(id, dest, data, &mut self.iface)
    }

    pub fn recv_from(&mut self, handle: SocketHandle) -> Result<Completion<Datagram>, SocketError> {
        let SocketHandle::Udp(id) = handle else {
            return Err(SocketError::InvalidState);
        };
        match self.udp.recv_from(id)? {
            Some(datagram) => Ok(Completion::Ready(datagram)),
            None => Ok(Completion::Suspend(self.token(handle, Interest::Readable))),
        }
    }

    /// Re-check a suspended call
    ///
    /// # Returns
    /// * `Ready` - retry the original call
    /// * `Suspend` - still waiting
    /// * `Err` - the deadline passed or the connection failed
    pub fn wait(&self, token: &WaitToken) -> Result<Completion<()>, SocketError> {
        let ready = match (token.handle, token.interest) {
            (SocketHandle::Tcp(id), Interest::Connected) => self.tcp.connected(id)?,
            (SocketHandle::Tcp(id), Interest::Acceptable) => self.tcp.acceptable(id)?,
            (SocketHandle::Tcp(id), Interest::Readable) => self.tcp.readable(id)?,
            (SocketHandle::Udp(id), Interest::Readable) => self.udp.has_data(id)?,
            (SocketHandle::Udp(_), _) => return Err(SocketError::InvalidState),
        };
        if ready {
            return Ok(Completion::Ready(()));
        }
        if token.deadline.is_some_and(|deadline| self.iface.now >= deadline) {
            return Err(SocketError::TimedOut);
        }
        Ok(Completion::Suspend(*token))
    }

    /// Wake `waker` when the token's handle becomes ready or its deadline passes
    pub fn register_waker(&mut self, token: &WaitToken, waker: &Waker) {
        self.wakers.entry(token.handle).or_default().register(waker);
        if let Some(deadline) = token.deadline {
            self.deadlines.insert(token.handle, deadline);
        }
    }

    /// Handles whose readiness changed since the last call
    pub fn take_ready(&mut self) -> Vec<SocketHandle> {
        core::mem::take(&mut self.ready).into_iter().collect()
    }

    /// Send an ICMP echo request
    pub fn ping(&mut self, dest: Ipv4Addr, identifier: u16, sequence: u16, data: &[u8]) -> Result<(), NetError> {
        let request = IcmpPacket::echo_request(identifier, sequence, data.to_vec());
        self.iface
            .send_ipv4(dest, IpProtocol::Icmp, request.to_bytes())?;
        self.icmp
            .record_request(dest, identifier, sequence, self.iface.now);
        Ok(())
    }

    pub fn take_echo_replies(&mut self) -> Vec<EchoReply> {
        self.icmp.take_replies()
    }

    /// Insert a permanent ARP mapping and flush anything waiting on it
    pub fn add_static_arp(&mut self, ip: Ipv4Addr, mac: MacAddress) {
        let released = self.iface.arp.learn(ip, mac);
        self.iface.release(released);
    }

    pub fn arp_lookup(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.iface.arp.lookup(ip)
    }

    /// Packets queued behind an unresolved address
    pub fn arp_pending(&self, ip: Ipv4Addr) -> usize {
        self.iface.arp.pending_len(ip)
    }

    /// State of a TCP handle; `None` for UDP handles
    pub fn tcp_state(&self, handle: SocketHandle) -> Option<TcpState> {
        match handle {
            SocketHandle::Tcp(id) => Some(self.tcp.state(id)),
            SocketHandle::Udp(_) => None,
        }
    }

    pub fn tcp_info(&self, handle: SocketHandle) -> Option<TcpInfo> {
        match handle {
            SocketHandle::Tcp(id) => self.tcp.info(id),
            SocketHandle::Udp(_) => None,
        }
    }

    pub fn tcp_connections(&self) -> Vec<TcpInfo> {
        self.tcp.connections()
    }

    pub fn local_addr(&self, handle: SocketHandle) -> Result<SocketAddrV4, SocketError> {
        match handle {
            SocketHandle::Tcp(id) => self.tcp.local_addr(id),
            SocketHandle::Udp(id) => self
                .udp
                .local_port(id)
                .map(|port| SocketAddrV4::new(self.iface.network.ip_addr, port)),
        }
    }

    pub fn peer_addr(&self, handle: SocketHandle) -> Result<SocketAddrV4, SocketError> {
        match handle {
            SocketHandle::Tcp(id) => self.tcp.remote_addr(id),
            SocketHandle::Udp(_) => Err(SocketError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use crate::net::loopback::LoopbackDevice;

    const IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn stack() -> NetStack<LoopbackDevice> {
        let config = StackConfig::new(NetworkConfig::new(
            IP,
            Ipv4Addr::new(255, 255, 255, 0),
            None,
        ));
        NetStack::new(LoopbackDevice::new(MacAddress([2, 0, 0, 0, 0, 1]), 64), config)
    }

    #[test]
    fn test_bring_up_once() {
        let mut stack = stack();
        assert!(!stack.is_up());
        assert_eq!(stack.bring_up(), Ok(()));
        assert!(stack.is_up());
        assert_eq!(stack.bring_up(), Err(NetError::AlreadyConfigured));
    }

    #[test]
    fn test_tick_below_clock_resolution_rejected() {
        let network = NetworkConfig::new(IP, Ipv4Addr::new(255, 255, 255, 0), None);
        let config = StackConfig::new(network).with_tick_period(Duration::from_nanos(500));
        let mut stack = NetStack::new(LoopbackDevice::new(MacAddress([2, 0, 0, 0, 0, 1]), 64), config);
        assert_eq!(stack.bring_up(), Err(NetError::InvalidConfig));
        assert!(!stack.is_up());
    }

    #[test]
    fn test_send_before_bring_up_fails() {
        let mut stack = stack();
        assert_eq!(
            stack.ping(Ipv4Addr::new(10, 0, 0, 2), 1, 1, b"x"),
            Err(NetError::NotConfigured)
        );
        assert_eq!(
            stack.connect(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80)),
            Err(SocketError::Net(NetError::NotConfigured))
        );
    }

    #[test]
    fn test_off_subnet_without_gateway_has_no_route() {
        let mut stack = stack();
        stack.bring_up().unwrap();
        assert_eq!(
            stack.ping(Ipv4Addr::new(192, 168, 1, 1), 1, 1, b"x"),
            Err(NetError::NoRoute)
        );
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let mut stack = stack();
        stack.bring_up().unwrap();
        let socket = stack.udp_bind(0).unwrap();
        let dest = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 255), 9);
        assert_eq!(
            stack.send_to(socket, dest, &[0u8; 1473]),
            Err(SocketError::Net(NetError::PayloadTooLarge))
        );
        assert_eq!(stack.send_to(socket, dest, &[0u8; 1472]), Ok(()));
    }

    #[test]
    fn test_ping_self_over_loopback() {
        let mut stack = stack();
        stack.bring_up().unwrap();
        stack.ping(IP, 7, 1, b"abc").unwrap();

        // request, then the reply it provoked
        assert_eq!(stack.poll(), 2);
        let replies = stack.take_echo_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].sequence, 1);
        assert_eq!(replies[0].data, b"abc".to_vec());
    }
}
