//! UDP protocol - RFC 768
//!
//! Header accessors plus the checksum routine used after SNAT rewrites.
//! The payload of a reassembled datagram may span several fragment buffers,
//! so the checksum is computed over an iterator of slices.

use super::checksum::{checksum, pseudo_header_checksum};
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// UDP header size (fixed)
pub const HEADER_SIZE: usize = 8;

/// UDP protocol number for pseudo-header
pub const PROTOCOL_NUMBER: u8 = 17;

/// Parsed UDP header (zero-copy reference)
#[derive(Debug)]
pub struct UdpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Length (header + data)
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// 0 means the sender did not compute one
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

/// Mutable UDP header for port rewrites
#[derive(Debug)]
pub struct UdpHeaderMut<'a> {
    buffer: &'a mut [u8],
}

impl<'a> UdpHeaderMut<'a> {
    pub fn parse(buffer: &'a mut [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.buffer[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.buffer[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_checksum(&mut self, sum: u16) {
        self.buffer[6..8].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }
}

/// Full UDP checksum over a header and a payload split across `chunks`.
///
/// `header` must have its checksum field zeroed. Every chunk except the last
/// must have even length. A computed zero is transmitted as `0xffff`.
pub fn udp_checksum<'c, I>(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, header: &[u8], chunks: I) -> u16
where
    I: IntoIterator<Item = &'c [u8]>,
{
    let length = u16::from_be_bytes([header[4], header[5]]);
    let mut sum = pseudo_header_checksum(PROTOCOL_NUMBER, src_ip, dst_ip);
    sum = checksum(&length.to_be_bytes(), sum);
    sum = checksum(&header[..HEADER_SIZE], sum);
    for chunk in chunks {
        sum = checksum(chunk, sum);
    }
    match !sum {
        0 => 0xffff,
        v => v,
    }
}

/// Build a UDP datagram with a valid checksum (tests and device shims)
pub fn build_datagram(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = (HEADER_SIZE + payload.len()) as u16;
    let mut datagram = Vec::with_capacity(len as usize);
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&len.to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);

    let sum = udp_checksum(src_ip, dst_ip, &datagram[..HEADER_SIZE], [payload]);
    datagram[6..8].copy_from_slice(&sum.to_be_bytes());
    datagram
}

/// True when the datagram's checksum is absent or verifies
pub fn verify_datagram(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, datagram: &[u8]) -> bool {
    let Ok(header) = UdpHeader::parse(datagram) else {
        return false;
    };
    if header.checksum() == 0 {
        return true;
    }
    let mut sum = pseudo_header_checksum(PROTOCOL_NUMBER, src_ip, dst_ip);
    sum = checksum(&header.length().to_be_bytes(), sum);
    checksum(datagram, sum) == 0xffff
}
