mod common;

use std::net::Ipv4Addr;

use common::{IP_A, IP_B, MAC_A, MAC_B, NETMASK, pair, pump};
use rustrial_net::net::checksum::internet_checksum;
use rustrial_net::net::ethernet::{EtherType, EthernetFrame};
use rustrial_net::net::ipv4::{
    DEFAULT_TTL, IpProtocol, Ipv4Error, Ipv4Header, Ipv4Packet, MIN_HEADER_SIZE, RoutingTable, flags,
};
use rustrial_net::net::udp::UdpPacket;

fn sample() -> Ipv4Packet {
    Ipv4Packet::new(IP_A, IP_B, IpProtocol::Udp, vec![0xDE, 0xAD, 0xBE, 0xEF])
}

fn recompute_checksum(bytes: &mut [u8], header_len: usize) {
    bytes[10..12].copy_from_slice(&[0, 0]);
    let checksum = internet_checksum(&bytes[..header_len]);
    bytes[10..12].copy_from_slice(&checksum.to_be_bytes());
}

#[test]
fn test_outbound_header_defaults() {
    let header = sample().header;
    assert_eq!(header.ttl, DEFAULT_TTL);
    assert_eq!(header.ttl, 64);
    assert!(header.dont_fragment());
    assert!(!header.is_fragmented());
    assert_eq!(header.total_length, 24);
    assert_eq!(header.protocol, IpProtocol::Udp);
}

#[test]
fn test_oversized_lengths_saturate() {
    let header = Ipv4Header::new(IP_A, IP_B, IpProtocol::Tcp, u16::MAX - 10);
    assert_eq!(header.total_length, u16::MAX);

    let packet = Ipv4Packet::new(IP_A, IP_B, IpProtocol::Udp, vec![0; 70_000]);
    assert_eq!(packet.header.total_length, u16::MAX);
    assert_eq!(packet.payload.len(), 70_000);
}

#[test]
fn test_header_checksum_verifies() {
    let bytes = sample().to_bytes();
    assert_eq!(bytes[0], 0x45);
    assert_eq!(&bytes[6..8], &[0x40, 0x00]);
    assert_eq!(bytes[9], 17);
    assert_eq!(internet_checksum(&bytes[..MIN_HEADER_SIZE]), 0);
}

#[test]
fn test_packet_round_trip_trims_padding() {
    let packet = sample();
    let mut bytes = packet.to_bytes();
    assert_eq!(bytes.len(), packet.wire_len());
    bytes.extend_from_slice(&[0; 18]);

    let parsed = Ipv4Packet::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.payload, packet.payload);
    assert_eq!(parsed.header.src_ip, IP_A);
    assert_eq!(parsed.header.dest_ip, IP_B);
    assert_eq!(parsed.to_bytes(), packet.to_bytes());
}

#[test]
fn test_options_are_skipped() {
    let mut bytes = sample().to_bytes();
    bytes.splice(20..20, [1, 1, 1, 0]);
    bytes[0] = 0x46;
    bytes[2..4].copy_from_slice(&28u16.to_be_bytes());
    recompute_checksum(&mut bytes, 24);

    let (header, offset) = Ipv4Header::from_bytes(&bytes).unwrap();
    assert_eq!(offset, 24);
    assert_eq!(header.total_length, 28);
    assert_eq!(Ipv4Packet::from_bytes(&bytes).unwrap().payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn test_parse_errors() {
    let good = sample().to_bytes();

    assert_eq!(Ipv4Header::from_bytes(&good[..19]), Err(Ipv4Error::PacketTooShort));

    let mut bad = good.clone();
    bad[0] = 0x65;
    assert_eq!(Ipv4Header::from_bytes(&bad), Err(Ipv4Error::InvalidVersion(6)));

    let mut bad = good.clone();
    bad[0] = 0x44;
    assert_eq!(Ipv4Header::from_bytes(&bad), Err(Ipv4Error::InvalidIhl(4)));

    let mut bad = good.clone();
    bad[2..4].copy_from_slice(&100u16.to_be_bytes());
    recompute_checksum(&mut bad, 20);
    assert_eq!(Ipv4Header::from_bytes(&bad), Err(Ipv4Error::InvalidLength));

    let mut bad = good.clone();
    bad[2..4].copy_from_slice(&16u16.to_be_bytes());
    recompute_checksum(&mut bad, 20);
    assert_eq!(Ipv4Header::from_bytes(&bad), Err(Ipv4Error::InvalidLength));

    let mut bad = good;
    bad[8] ^= 0x01;
    assert_eq!(Ipv4Header::from_bytes(&bad), Err(Ipv4Error::ChecksumMismatch));
}

#[test]
fn test_fragment_detection() {
    let mut header = sample().header;
    header.flags = flags::MORE_FRAGMENTS;
    assert!(header.is_fragmented());

    let mut packet = sample();
    packet.header.flags = 0;
    packet.header.fragment_offset = 185;
    assert!(packet.header.is_fragmented());

    let parsed = Ipv4Packet::from_bytes(&packet.to_bytes()).unwrap().header;
    assert_eq!(parsed.fragment_offset, 185);
    assert_eq!(parsed.flags, 0);
    assert!(parsed.is_fragmented());
}

#[test]
fn test_protocol_numbers() {
    assert_eq!(IpProtocol::from(1), IpProtocol::Icmp);
    assert_eq!(IpProtocol::from(6), IpProtocol::Tcp);
    assert_eq!(IpProtocol::from(17), IpProtocol::Udp);
    assert_eq!(IpProtocol::from(41), IpProtocol::Unknown(41));
    assert_eq!(u8::from(IpProtocol::Unknown(41)), 41);
}

#[test]
fn test_routing() {
    let gateway = Ipv4Addr::new(10, 0, 0, 254);
    let routes = RoutingTable::new(IP_A, NETMASK, Some(gateway));

    assert_eq!(routes.next_hop(IP_B), Some(IP_B));
    assert_eq!(routes.next_hop(Ipv4Addr::new(8, 8, 8, 8)), Some(gateway));
    assert!(routes.is_local(IP_B));
    assert!(!routes.is_local(Ipv4Addr::new(10, 0, 1, 2)));

    assert_eq!(routes.subnet_broadcast(), Ipv4Addr::new(10, 0, 0, 255));
    assert!(routes.is_broadcast(Ipv4Addr::BROADCAST));
    assert!(routes.accepts(IP_A));
    assert!(routes.accepts(Ipv4Addr::new(10, 0, 0, 255)));
    assert!(!routes.accepts(IP_B));

    let isolated = RoutingTable::new(IP_A, NETMASK, None);
    assert_eq!(isolated.next_hop(Ipv4Addr::new(8, 8, 8, 8)), None);
}

fn inject_ipv4(stack: &mut common::Stack, packet: &[u8]) {
    let frame = EthernetFrame::new(MAC_A, MAC_B, EtherType::Ipv4, packet.to_vec()).unwrap();
    stack.receive_frame(&frame.to_bytes());
}

fn udp_to_a(port: u16) -> Ipv4Packet {
    let datagram = UdpPacket::new(4000, port, b"payload".to_vec()).to_bytes_checksummed(IP_B, IP_A);
    Ipv4Packet::new(IP_B, IP_A, IpProtocol::Udp, datagram)
}

#[test]
fn test_fragments_are_dropped() {
    let (mut a, _b) = pair();
    let socket = a.udp_bind(7).unwrap();

    let mut packet = udp_to_a(7);
    packet.header.flags = flags::MORE_FRAGMENTS;
    inject_ipv4(&mut a, &packet.to_bytes());

    assert_eq!(a.stats().ip_fragments_dropped, 1);
    assert!(!a.poll_readable(socket));

    inject_ipv4(&mut a, &udp_to_a(7).to_bytes());
    assert!(a.poll_readable(socket));
}

#[test]
fn test_bad_checksum_and_unknown_protocol_are_counted() {
    let (mut a, _b) = pair();

    let mut bytes = udp_to_a(7).to_bytes();
    bytes[8] = 1;
    inject_ipv4(&mut a, &bytes);

    let unknown = Ipv4Packet::new(IP_B, IP_A, IpProtocol::Unknown(47), vec![0; 8]);
    inject_ipv4(&mut a, &unknown.to_bytes());

    let elsewhere = Ipv4Packet::new(IP_B, Ipv4Addr::new(10, 0, 0, 3), IpProtocol::Udp, vec![0; 8]);
    inject_ipv4(&mut a, &elsewhere.to_bytes());

    let stats = a.stats();
    assert_eq!(stats.ip_checksum_errors, 1);
    assert_eq!(stats.unknown_protocol, 1);
    assert_eq!(stats.not_for_us, 1);
}

#[test]
fn test_identification_increments() {
    let (mut a, mut b) = pair();
    a.add_static_arp(IP_B, MAC_B);

    a.ping(IP_B, 9, 1, b"").unwrap();
    a.ping(IP_B, 9, 2, b"").unwrap();
    let frames = b.device_mut().take_pending();
    assert_eq!(frames.len(), 2);

    let ident = |frame: &Vec<u8>| {
        let frame = EthernetFrame::from_bytes(frame).unwrap();
        let packet = Ipv4Packet::from_bytes(&frame.payload).unwrap();
        assert_eq!(packet.header.ttl, 64);
        assert!(packet.header.dont_fragment());
        packet.header.identification
    };
    assert_eq!(ident(&frames[1]), ident(&frames[0]).wrapping_add(1));
    assert_eq!(pump(&mut a, &mut b), 0);
}

#[test]
fn test_ip_packets_ignored_before_bring_up() {
    let (dev_a, _dev_b) = rustrial_net::net::loopback::LoopbackDevice::pair(MAC_A, MAC_B, 16);
    let mut a = rustrial_net::net::NetStack::new(dev_a, common::config(IP_A));

    inject_ipv4(&mut a, &udp_to_a(7).to_bytes());
    assert_eq!(a.stats().not_for_us, 1);
}
