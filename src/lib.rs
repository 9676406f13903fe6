#![cfg_attr(not(test), no_std)]

//! Rustrial network stack
//!
//! Ethernet, ARP, IPv4, ICMP, UDP and TCP over any [`drivers::net::NetworkDevice`],
//! owned by a single [`net::NetStack`] value.

extern crate alloc;

//Network drivers
pub mod drivers;

//Networking infrastructure
pub mod net;
