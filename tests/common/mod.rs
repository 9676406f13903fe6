//! Two stacks joined by a virtual cable

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};

use rustrial_net::net::ethernet::MacAddress;
use rustrial_net::net::loopback::LoopbackDevice;
use rustrial_net::net::{Completion, NetStack, NetworkConfig, SocketHandle, StackConfig};

pub const MAC_A: MacAddress = MacAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x01]);
pub const MAC_B: MacAddress = MacAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x02]);
pub const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

pub type Stack = NetStack<LoopbackDevice>;

pub fn config(ip: Ipv4Addr) -> StackConfig {
    StackConfig::new(NetworkConfig::new(ip, NETMASK, None))
}

/// Stack A at 10.0.0.1 and stack B at 10.0.0.2, both up
pub fn pair_with(config_a: StackConfig, config_b: StackConfig) -> (Stack, Stack) {
    let (dev_a, dev_b) = LoopbackDevice::pair(MAC_A, MAC_B, 256);
    let mut a = NetStack::new(dev_a, config_a);
    let mut b = NetStack::new(dev_b, config_b);
    a.bring_up().unwrap();
    b.bring_up().unwrap();
    (a, b)
}

pub fn pair() -> (Stack, Stack) {
    pair_with(config(IP_A), config(IP_B))
}

/// Deliver frames in both directions until the cable is quiet
pub fn pump(a: &mut Stack, b: &mut Stack) -> usize {
    let mut total = 0;
    loop {
        let processed = a.poll() + b.poll();
        if processed == 0 {
            return total;
        }
        total += processed;
    }
}

/// Tick both stacks `ticks` times, pumping after each tick
pub fn run_ticks(a: &mut Stack, b: &mut Stack, ticks: usize) {
    for _ in 0..ticks {
        a.tick();
        b.tick();
        pump(a, b);
    }
}

/// B connects to A on `port`; A must already be listening
///
/// # Returns
/// (client handle on B, accepted handle on A)
pub fn establish(a: &mut Stack, b: &mut Stack, listener: SocketHandle, port: u16) -> (SocketHandle, SocketHandle) {
    let token = b
        .connect(SocketAddrV4::new(IP_A, port))
        .unwrap()
        .token()
        .unwrap();
    pump(a, b);
    assert_eq!(b.wait(&token), Ok(Completion::Ready(())));

    let server = a.accept(listener).unwrap().ready().unwrap();
    (token.handle, server)
}
