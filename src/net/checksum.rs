//! Internet checksum (RFC 1071)
//!
//! Shared by the IPv4 header, ICMP, and the TCP/UDP pseudo-header checksums.

use core::net::Ipv4Addr;

/// Add `data` to a running one's complement sum as big-endian 16-bit words
///
/// An odd trailing byte is padded with zero.
pub fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        // Fold early so long payloads cannot overflow the accumulator
        if sum > 0xFFFF_0000 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Fold a 32-bit sum to 16 bits and take the one's complement
pub fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Checksum of a contiguous buffer
///
/// Computing this over a buffer that already contains a valid checksum
/// yields zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(sum_words(0, data))
}

/// Running sum of the TCP/UDP pseudo-header
///
/// ```text
/// [Src IP (4)][Dst IP (4)][Zero (1)][Protocol (1)][Length (2)]
/// ```
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let mut sum = sum_words(0, &src.octets());
    sum = sum_words(sum, &dst.octets());
    sum += protocol as u32;
    sum += length as u32;
    sum
}

/// Checksum of a transport segment including its pseudo-header
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, protocol, segment.len() as u16);
    finish(sum_words(sum, segment))
}
