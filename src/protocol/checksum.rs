//! Internet checksum - RFC 1071
//!
//! Partial sums are carried as already-folded `u16` values so that a checksum
//! can be extended across several buffers (pseudo header, transport header,
//! chained fragment payloads) before the final complement.

use std::net::Ipv4Addr;

/// One's-complement sum of `buf` folded into `initial`.
///
/// An odd trailing byte is treated as the high byte of a zero-padded word.
pub fn checksum(buf: &[u8], initial: u16) -> u16 {
    let mut sum = initial as u32;
    let mut words = buf.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }
    checksum_combine(sum as u16, (sum >> 16) as u16)
}

/// Fold two partial sums together with end-around carry.
pub fn checksum_combine(a: u16, b: u16) -> u16 {
    let v = a as u32 + b as u32;
    (v + (v >> 16)) as u16
}

/// Partial sum over the IPv4 pseudo header (addresses and protocol).
///
/// The segment length is folded in separately by the transport routine.
pub fn pseudo_header_checksum(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
    let xsum = checksum(&src.octets(), 0);
    let xsum = checksum(&dst.octets(), xsum);
    checksum(&[0, protocol], xsum)
}
