//! Ethernet II framing

use super::{EtherType, MacAddr};
use crate::{Error, Result};

/// Ethernet header size (no 802.1Q tag; zones replace VLANs on the overlay)
pub const HEADER_SIZE: usize = 14;
/// Smallest frame a link accepts: Ethernet header plus an ARP body
pub const MIN_FRAME_SIZE: usize = 42;
/// Largest untagged frame without FCS
pub const MAX_FRAME_SIZE: usize = 1514;

/// Parsed Ethernet frame (zero-copy reference)
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse(format!(
                "ethernet frame too short: {} bytes",
                buffer.len()
            )));
        }
        Ok(Self { buffer })
    }

    pub fn dst_mac(&self) -> MacAddr {
        MacAddr([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
            self.buffer[5],
        ])
    }

    pub fn src_mac(&self) -> MacAddr {
        MacAddr([
            self.buffer[6],
            self.buffer[7],
            self.buffer[8],
            self.buffer[9],
            self.buffer[10],
            self.buffer[11],
        ])
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.buffer[12], self.buffer[13]])
    }

    pub fn is_arp(&self) -> bool {
        self.ethertype() == EtherType::Arp as u16
    }

    pub fn is_ipv4(&self) -> bool {
        self.ethertype() == EtherType::Ipv4 as u16
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[HEADER_SIZE..]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buffer
    }
}

/// Builder for Ethernet frames, used by tests and device shims
#[derive(Debug, Default)]
pub struct FrameBuilder {
    dst: MacAddr,
    src: MacAddr,
    ethertype: u16,
    payload: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dst_mac(mut self, mac: MacAddr) -> Self {
        self.dst = mac;
        self
    }

    pub fn src_mac(mut self, mac: MacAddr) -> Self {
        self.src = mac;
        self
    }

    pub fn ethertype(mut self, ethertype: EtherType) -> Self {
        self.ethertype = ethertype as u16;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        frame.extend_from_slice(&self.dst.0);
        frame.extend_from_slice(&self.src.0);
        frame.extend_from_slice(&self.ethertype.to_be_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }
}
