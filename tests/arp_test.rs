mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use common::{IP_A, IP_B, MAC_A, MAC_B, config, pair, pair_with, run_ticks};
use rustrial_net::net::NetError;
use rustrial_net::net::arp::{ARP_PACKET_SIZE, ArpError, ArpOperation, ArpPacket, ArpResolver, Resolution};
use rustrial_net::net::config::ArpConfig;
use rustrial_net::net::ethernet::{EtherType, EthernetFrame, MacAddress};
use rustrial_net::net::timer::Instant;

const NOBODY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

#[test]
fn test_request_layout() {
    let request = ArpPacket::request(MAC_A, IP_A, IP_B);
    let bytes = request.to_bytes();

    assert_eq!(bytes.len(), ARP_PACKET_SIZE);
    assert_eq!(&bytes[0..8], &[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    assert_eq!(&bytes[8..14], &MAC_A.0);
    assert_eq!(&bytes[14..18], &[10, 0, 0, 1]);
    assert_eq!(&bytes[18..24], &[0; 6]);
    assert_eq!(&bytes[24..28], &[10, 0, 0, 2]);
    assert_eq!(ArpPacket::from_bytes(&bytes), Ok(request));
}

#[test]
fn test_reply_parses_with_padding() {
    let reply = ArpPacket::reply(MAC_B, IP_B, MAC_A, IP_A);
    let mut bytes = reply.to_bytes();
    bytes.resize(46, 0);

    let parsed = ArpPacket::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.operation, ArpOperation::Reply);
    assert!(parsed.is_reply());
    assert_eq!(parsed, reply);
}

#[test]
fn test_parse_errors() {
    let good = ArpPacket::request(MAC_A, IP_A, IP_B).to_bytes();

    assert_eq!(ArpPacket::from_bytes(&good[..27]), Err(ArpError::PacketTooShort));

    let mut bad = good.clone();
    bad[1] = 6;
    assert_eq!(ArpPacket::from_bytes(&bad), Err(ArpError::InvalidHardwareType));

    let mut bad = good.clone();
    bad[2] = 0x86;
    assert_eq!(ArpPacket::from_bytes(&bad), Err(ArpError::InvalidProtocolType));

    let mut bad = good.clone();
    bad[4] = 8;
    assert_eq!(ArpPacket::from_bytes(&bad), Err(ArpError::InvalidHardwareLength));

    let mut bad = good.clone();
    bad[5] = 16;
    assert_eq!(ArpPacket::from_bytes(&bad), Err(ArpError::InvalidProtocolLength));

    let mut bad = good;
    bad[7] = 3;
    assert_eq!(ArpPacket::from_bytes(&bad), Err(ArpError::UnknownOperation(3)));
}

#[test]
fn test_resolver_queues_until_reply() {
    let mut resolver = ArpResolver::new(ArpConfig::default());

    assert_eq!(
        resolver.resolve(IP_B, vec![1], Instant::ZERO),
        Ok(Resolution::Pending { send_request: true })
    );
    assert_eq!(
        resolver.resolve(IP_B, vec![2], Instant::ZERO),
        Ok(Resolution::Pending { send_request: false })
    );
    assert_eq!(resolver.pending_len(IP_B), 2);

    let outcome = resolver.handle_packet(&ArpPacket::reply(MAC_B, IP_B, MAC_A, IP_A), MAC_A, IP_A);
    assert_eq!(outcome.reply, None);
    assert_eq!(outcome.released, vec![(MAC_B, vec![1]), (MAC_B, vec![2])]);
    assert!(!resolver.is_pending(IP_B));

    assert_eq!(
        resolver.resolve(IP_B, vec![3], Instant::ZERO),
        Ok(Resolution::Resolved(MAC_B, vec![3]))
    );
}

#[test]
fn test_resolver_answers_requests_for_us() {
    let mut resolver = ArpResolver::new(ArpConfig::default());
    let outcome = resolver.handle_packet(&ArpPacket::request(MAC_B, IP_B, IP_A), MAC_A, IP_A);

    assert_eq!(outcome.reply, Some(ArpPacket::reply(MAC_A, IP_A, MAC_B, IP_B)));
    assert_eq!(resolver.lookup(IP_B), Some(MAC_B));

    // Requests for other hosts still teach us the sender, but get no answer
    let outcome = resolver.handle_packet(
        &ArpPacket::request(MAC_B, IP_B, NOBODY),
        MAC_A,
        IP_A,
    );
    assert_eq!(outcome.reply, None);
}

#[test]
fn test_resolver_pending_bound() {
    let config = ArpConfig {
        max_pending_per_ip: 2,
        ..ArpConfig::default()
    };
    let mut resolver = ArpResolver::new(config);

    assert!(resolver.resolve(NOBODY, vec![1], Instant::ZERO).is_ok());
    assert!(resolver.resolve(NOBODY, vec![2], Instant::ZERO).is_ok());
    assert_eq!(
        resolver.resolve(NOBODY, vec![3], Instant::ZERO),
        Err(ArpError::PendingQueueFull)
    );
    assert_eq!(resolver.pending_len(NOBODY), 2);
}

#[test]
fn test_resolver_expires_pending() {
    let mut resolver = ArpResolver::new(ArpConfig::default());
    resolver.resolve(NOBODY, vec![1], Instant::from_millis(500)).unwrap();
    resolver.resolve(NOBODY, vec![2], Instant::from_millis(900)).unwrap();

    assert_eq!(resolver.expire_pending(Instant::from_millis(3499)), 0);
    assert_eq!(resolver.expire_pending(Instant::from_millis(3500)), 2);
    assert!(!resolver.is_pending(NOBODY));
}

#[test]
fn test_second_send_uses_cache() {
    let (mut a, mut b) = pair();

    b.ping(IP_A, 1, 1, b"first").unwrap();
    common::pump(&mut a, &mut b);
    assert_eq!(b.arp_lookup(IP_A), Some(MAC_A));
    assert_eq!(b.stats().arp_requests_sent, 1);
    assert_eq!(a.stats().arp_replies_sent, 1);

    b.ping(IP_A, 1, 2, b"second").unwrap();
    common::pump(&mut a, &mut b);
    assert_eq!(b.stats().arp_requests_sent, 1);
    assert_eq!(b.take_echo_replies().len(), 2);

    // A learned B from the request and never had to ask
    assert_eq!(a.arp_lookup(IP_B), Some(MAC_B));
    assert_eq!(a.stats().arp_requests_sent, 0);
}

#[test]
fn test_static_entry_skips_resolution() {
    let (mut a, mut b) = pair();
    b.add_static_arp(IP_A, MAC_A);

    b.ping(IP_A, 1, 1, b"x").unwrap();
    assert_eq!(b.stats().arp_requests_sent, 0);
    common::pump(&mut a, &mut b);
    assert_eq!(b.take_echo_replies().len(), 1);
}

#[test]
fn test_pending_queue_full_is_reported() {
    let arp = ArpConfig {
        max_pending_per_ip: 2,
        ..ArpConfig::default()
    };
    let (_a, mut b) = pair_with(config(IP_A), config(IP_B).with_arp(arp));

    b.ping(NOBODY, 1, 1, b"").unwrap();
    b.ping(NOBODY, 1, 2, b"").unwrap();
    assert_eq!(
        b.ping(NOBODY, 1, 3, b""),
        Err(NetError::Arp(ArpError::PendingQueueFull))
    );
    assert_eq!(b.arp_pending(NOBODY), 2);
    assert_eq!(b.stats().arp_requests_sent, 1);
    assert_eq!(b.stats().arp_pending_overflow, 1);
}

#[test]
fn test_unanswered_request_expires() {
    let (mut a, mut b) = pair();
    assert_eq!(b.config().arp.pending_timeout, Some(Duration::from_secs(3)));

    b.ping(NOBODY, 1, 1, b"").unwrap();
    run_ticks(&mut a, &mut b, 299);
    assert_eq!(b.arp_pending(NOBODY), 1);

    run_ticks(&mut a, &mut b, 1);
    assert_eq!(b.arp_pending(NOBODY), 0);
    assert_eq!(b.stats().arp_pending_expired, 1);

    // A fresh send starts a fresh request
    b.ping(NOBODY, 1, 2, b"").unwrap();
    assert_eq!(b.stats().arp_requests_sent, 2);
}

#[test]
fn test_gratuitous_arp_is_learned() {
    let (mut a, mut b) = pair();
    let peer_ip = Ipv4Addr::new(10, 0, 0, 7);
    let peer_mac = MacAddress([0x52, 0x54, 0, 0, 0, 0x07]);

    let announcement = ArpPacket {
        operation: ArpOperation::Request,
        sender_mac: peer_mac,
        sender_ip: peer_ip,
        target_mac: MacAddress::UNSPECIFIED,
        target_ip: peer_ip,
    };
    let frame = EthernetFrame::new(MacAddress::BROADCAST, peer_mac, EtherType::Arp, announcement.to_bytes()).unwrap();
    a.receive_frame(&frame.to_bytes());

    assert_eq!(a.arp_lookup(peer_ip), Some(peer_mac));
    assert_eq!(a.stats().arp_replies_sent, 0);
    assert_eq!(b.device_mut().take_pending().len(), 0);
}

#[test]
fn test_request_for_us_is_answered_on_the_wire() {
    let (mut a, mut b) = pair();

    let request = ArpPacket::request(MAC_B, IP_B, IP_A);
    let frame = EthernetFrame::new(MacAddress::BROADCAST, MAC_B, EtherType::Arp, request.to_bytes()).unwrap();
    a.receive_frame(&frame.to_bytes());

    let sent = b.device_mut().take_pending();
    assert_eq!(sent.len(), 1);
    let reply_frame = EthernetFrame::from_bytes(&sent[0]).unwrap();
    assert_eq!(reply_frame.dest_mac, MAC_B);
    assert_eq!(reply_frame.ethertype, EtherType::Arp);

    let reply = ArpPacket::from_bytes(&reply_frame.payload).unwrap();
    assert_eq!(reply, ArpPacket::reply(MAC_A, IP_A, MAC_B, IP_B));
}
