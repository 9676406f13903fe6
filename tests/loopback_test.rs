use std::net::{Ipv4Addr, SocketAddrV4};

use rustrial_net::drivers::net::{LinkStatus, MAX_FRAME_SIZE, NetworkDevice, ReceiveError, TransmitError};
use rustrial_net::net::ethernet::MacAddress;
use rustrial_net::net::loopback::LoopbackDevice;
use rustrial_net::net::{NetStack, NetworkConfig, StackConfig};

const MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
const IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

fn stack(config: StackConfig) -> NetStack<LoopbackDevice> {
    let mut stack = NetStack::new(LoopbackDevice::new(MAC, 16), config);
    stack.bring_up().unwrap();
    stack
}

fn loopback_config() -> StackConfig {
    StackConfig::new(NetworkConfig::new(IP, Ipv4Addr::new(255, 0, 0, 0), None))
}

#[test]
fn test_loopback_basic() {
    let mut lo = LoopbackDevice::new(MAC, 8);

    assert_eq!(lo.mac_address(), MAC);
    assert_eq!(lo.device_name(), "lo (loopback)");
    assert!(lo.is_ready());
    assert_eq!(lo.receive(), None);
}

#[test]
fn test_loopback_fifo() {
    let mut lo = LoopbackDevice::new(MAC, 8);
    for i in 0..3u8 {
        lo.transmit(&[i; 4]).unwrap();
    }

    assert_eq!(lo.pending(), 3);
    assert_eq!(lo.receive(), Some(vec![0; 4]));
    assert_eq!(lo.receive(), Some(vec![1; 4]));
    assert_eq!(lo.receive(), Some(vec![2; 4]));
    assert_eq!(lo.receive(), None);
}

#[test]
fn test_loopback_buffer_full() {
    let mut lo = LoopbackDevice::new(MAC, 2);
    lo.transmit(&[1]).unwrap();
    lo.transmit(&[2]).unwrap();
    assert_eq!(lo.transmit(&[3]), Err(TransmitError::BufferFull));

    lo.receive();
    assert!(lo.transmit(&[3]).is_ok());
}

#[test]
fn test_loopback_rejects_oversized_frame() {
    let mut lo = LoopbackDevice::new(MAC, 2);
    assert_eq!(lo.transmit(&vec![0; MAX_FRAME_SIZE + 1]), Err(TransmitError::PacketTooLarge));
    assert!(lo.transmit(&vec![0; MAX_FRAME_SIZE]).is_ok());
}

#[test]
fn test_link_down() {
    let mut lo = LoopbackDevice::new(MAC, 2);
    lo.set_link(LinkStatus::Down);
    assert_eq!(lo.link_status(), LinkStatus::Down);
    assert_eq!(lo.transmit(&[0]), Err(TransmitError::NotReady));
}

#[test]
fn test_boxed_device() {
    let mut boxed: Box<dyn NetworkDevice> = Box::new(LoopbackDevice::new(MAC, 2));
    boxed.transmit(&[9]).unwrap();
    assert_eq!(boxed.receive(), Some(vec![9]));

    let mut stack = NetStack::new(boxed, loopback_config());
    stack.bring_up().unwrap();
    assert_eq!(stack.mac_address(), MAC);
}

#[test]
fn test_stack_pings_itself() {
    let mut stack = stack(loopback_config());

    stack.ping(IP, 1, 1, b"self").unwrap();
    // Request, then the reply it produced
    assert_eq!(stack.poll(), 2);

    let replies = stack.take_echo_replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].from, IP);
    assert_eq!(stack.stats().arp_requests_sent, 0);
}

#[test]
fn test_udp_to_self() {
    let mut stack = stack(loopback_config());
    let server = stack.udp_bind(7).unwrap();
    let client = stack.udp_bind(0).unwrap();

    stack.send_to(client, SocketAddrV4::new(IP, 7), b"echo").unwrap();
    stack.poll();

    let datagram = stack.recv_from(server).unwrap().ready().unwrap();
    assert_eq!(datagram.data, b"echo".to_vec());
    assert_eq!(datagram.src, stack.local_addr(client).unwrap());
}

#[test]
fn test_tcp_to_self() {
    let mut stack = stack(loopback_config());
    let listener = stack.listen(9000, 1).unwrap();

    let token = stack
        .connect(SocketAddrV4::new(IP, 9000))
        .unwrap()
        .token()
        .unwrap();
    while stack.poll() > 0 {}

    assert!(stack.wait(&token).unwrap().is_ready());
    let server = stack.accept(listener).unwrap().ready().unwrap();
    assert_eq!(stack.local_addr(server), Ok(SocketAddrV4::new(IP, 9000)));
    assert_eq!(stack.peer_addr(server), stack.local_addr(token.handle));

    stack.send(token.handle, b"round trip").unwrap();
    while stack.poll() > 0 {}
    assert!(stack.poll_readable(server));
}

#[test]
fn test_frame_sink_delivery() {
    let mut stack = stack(loopback_config().with_frame_queue_len(1));
    let sink = stack.frame_sink();

    assert_eq!(sink.deliver(&vec![0; MAX_FRAME_SIZE + 1]), Err(ReceiveError::PacketTooLarge));
    assert_eq!(sink.deliver(&[0; 60]), Ok(()));
    assert_eq!(sink.deliver(&[0; 60]), Err(ReceiveError::QueueFull));
    assert_eq!(sink.len(), 1);

    assert_eq!(stack.poll(), 1);
    assert!(sink.is_empty());
    assert_eq!(stack.stats().frames_in, 1);
}
