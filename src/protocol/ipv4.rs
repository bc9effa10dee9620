//! IPv4 protocol - RFC 791
//!
//! Fields are read and written as big-endian integers at fixed offsets of a
//! borrowed buffer; nothing is ever reinterpreted as a struct.

use super::checksum::checksum;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

const TOTAL_LEN: usize = 2;
const IDENT: usize = 4;
const FLAGS_FRAG: usize = 6;
const TTL: usize = 8;
const PROTOCOL: usize = 9;
const CHECKSUM: usize = 10;
const SRC_ADDR: usize = 12;
const DST_ADDR: usize = 16;

/// IPv4 protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl Protocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Protocol::Icmp),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

/// Fragment flags (top three bits of the flags/offset word)
pub mod flags {
    /// Don't Fragment
    pub const DF: u8 = 0b010;
    /// More Fragments
    pub const MF: u8 = 0b001;
}

fn addr_at(buffer: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buffer[at], buffer[at + 1], buffer[at + 2], buffer[at + 3])
}

fn validate(buffer: &[u8]) -> Result<usize> {
    if buffer.len() < MIN_HEADER_SIZE {
        return Err(Error::Parse("IPv4 header too short".into()));
    }
    if buffer[0] >> 4 != 4 {
        return Err(Error::Parse("not an IPv4 packet".into()));
    }
    let header_len = (buffer[0] & 0x0F) as usize * 4;
    if header_len < MIN_HEADER_SIZE || buffer.len() < header_len {
        return Err(Error::Parse("IPv4 header truncated".into()));
    }
    Ok(header_len)
}

/// Parsed IPv4 header (zero-copy reference)
#[derive(Debug)]
pub struct Ipv4Header<'a> {
    buffer: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4Header<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        let header_len = validate(buffer)?;
        Ok(Self { buffer, header_len })
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[TOTAL_LEN], self.buffer[TOTAL_LEN + 1]])
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.buffer[IDENT], self.buffer[IDENT + 1]])
    }

    pub fn flags(&self) -> u8 {
        self.buffer[FLAGS_FRAG] >> 5
    }

    /// Fragment offset in 8-byte units
    pub fn fragment_offset(&self) -> u16 {
        u16::from_be_bytes([self.buffer[FLAGS_FRAG] & 0x1F, self.buffer[FLAGS_FRAG + 1]])
    }

    /// Fragment offset in bytes
    pub fn fragment_byte_offset(&self) -> u16 {
        self.fragment_offset() << 3
    }

    pub fn more_fragments(&self) -> bool {
        self.flags() & flags::MF != 0
    }

    /// MF set or nonzero offset
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() > 0
    }

    pub fn ttl(&self) -> u8 {
        self.buffer[TTL]
    }

    pub fn protocol(&self) -> u8 {
        self.buffer[PROTOCOL]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[CHECKSUM], self.buffer[CHECKSUM + 1]])
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        addr_at(self.buffer, SRC_ADDR)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        addr_at(self.buffer, DST_ADDR)
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Bytes after the header, as declared by total length
    pub fn payload_len(&self) -> usize {
        (self.total_length() as usize).saturating_sub(self.header_len)
    }

    pub fn validate_checksum(&self) -> bool {
        checksum(&self.buffer[..self.header_len], 0) == 0xffff
    }
}

/// Mutable view used by NAT to rewrite addresses in place
#[derive(Debug)]
pub struct Ipv4HeaderMut<'a> {
    buffer: &'a mut [u8],
    header_len: usize,
}

impl<'a> Ipv4HeaderMut<'a> {
    pub fn parse(buffer: &'a mut [u8]) -> Result<Self> {
        let header_len = validate(buffer)?;
        Ok(Self { buffer, header_len })
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        addr_at(self.buffer, SRC_ADDR)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        addr_at(self.buffer, DST_ADDR)
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.buffer[SRC_ADDR..SRC_ADDR + 4].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.buffer[DST_ADDR..DST_ADDR + 4].copy_from_slice(&addr.octets());
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[TOTAL_LEN], self.buffer[TOTAL_LEN + 1]])
    }

    /// Recompute the header checksum from scratch
    pub fn update_checksum(&mut self) {
        self.buffer[CHECKSUM..CHECKSUM + 2].fill(0);
        let sum = !checksum(&self.buffer[..self.header_len], 0);
        self.buffer[CHECKSUM..CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());
    }
}

/// Builder for IPv4 packets (tests and device shims)
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    identification: u16,
    more_fragments: bool,
    fragment_offset: u16,
    ttl: u8,
    protocol: u8,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    payload: Vec<u8>,
}

impl Ipv4Builder {
    pub fn new() -> Self {
        Self {
            identification: 0,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: 0,
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            payload: Vec::new(),
        }
    }

    pub fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    pub fn more_fragments(mut self, mf: bool) -> Self {
        self.more_fragments = mf;
        self
    }

    /// Offset in bytes; must be a multiple of 8
    pub fn fragment_byte_offset(mut self, offset: u16) -> Self {
        self.fragment_offset = (offset >> 3) & 0x1FFF;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol as u8;
        self
    }

    pub fn src_addr(mut self, addr: Ipv4Addr) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn dst_addr(mut self, addr: Ipv4Addr) -> Self {
        self.dst_addr = addr;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total = MIN_HEADER_SIZE + self.payload.len();
        let mut buffer = vec![0u8; total];
        buffer[0] = 0x45;
        buffer[TOTAL_LEN..TOTAL_LEN + 2].copy_from_slice(&(total as u16).to_be_bytes());
        buffer[IDENT..IDENT + 2].copy_from_slice(&self.identification.to_be_bytes());
        let mut flags_frag = self.fragment_offset;
        if self.more_fragments {
            flags_frag |= 0x2000;
        }
        buffer[FLAGS_FRAG..FLAGS_FRAG + 2].copy_from_slice(&flags_frag.to_be_bytes());
        buffer[TTL] = self.ttl;
        buffer[PROTOCOL] = self.protocol;
        buffer[SRC_ADDR..SRC_ADDR + 4].copy_from_slice(&self.src_addr.octets());
        buffer[DST_ADDR..DST_ADDR + 4].copy_from_slice(&self.dst_addr.octets());
        buffer[MIN_HEADER_SIZE..].copy_from_slice(&self.payload);

        let sum = !checksum(&buffer[..MIN_HEADER_SIZE], 0);
        buffer[CHECKSUM..CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());
        buffer
    }
}

impl Default for Ipv4Builder {
    fn default() -> Self {
        Self::new()
    }
}
