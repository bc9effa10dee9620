//! TCP protocol - RFC 793
//!
//! Only what connection tracking needs: ports and the flags byte.

use crate::{Error, Result};

/// Minimum TCP header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// TCP protocol number
pub const PROTOCOL_NUMBER: u8 = 6;

/// Flag bits of byte 13
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// TCP flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    /// Exactly SYN, nothing else
    pub fn is_syn(&self) -> bool {
        self.0 == flags::SYN
    }

    /// SYN together with ACK
    pub fn is_syn_ack(&self) -> bool {
        self.0 & (flags::SYN | flags::ACK) == flags::SYN | flags::ACK
    }

    /// Exactly ACK, nothing else
    pub fn is_ack(&self) -> bool {
        self.0 == flags::ACK
    }

    pub fn is_fin(&self) -> bool {
        self.0 & flags::FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.0 & flags::RST != 0
    }
}

/// Parsed TCP header (zero-copy reference)
#[derive(Debug)]
pub struct TcpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> TcpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP header too short".into()));
        }
        let header_len = (buffer[12] >> 4) as usize * 4;
        if header_len < MIN_HEADER_SIZE {
            return Err(Error::Parse("invalid TCP data offset".into()));
        }
        Ok(Self { buffer })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags(self.buffer[13])
    }

    pub fn header_len(&self) -> usize {
        (self.buffer[12] >> 4) as usize * 4
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[16], self.buffer[17]])
    }
}

/// Minimal TCP header with the given ports and flags (tests and device shims)
pub fn build_segment(src_port: u16, dst_port: u16, flag_bits: u8) -> Vec<u8> {
    let mut segment = vec![0u8; MIN_HEADER_SIZE];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[12] = 5 << 4;
    segment[13] = flag_bits;
    segment[14..16].copy_from_slice(&65535u16.to_be_bytes());
    segment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_header() {
        let segment = build_segment(12345, 80, flags::SYN);
        let header = TcpHeader::parse(&segment).unwrap();
        assert_eq!(header.src_port(), 12345);
        assert_eq!(header.dst_port(), 80);
        assert_eq!(header.header_len(), 20);
        assert!(header.flags().is_syn());
    }

    #[test]
    fn test_flag_classification() {
        assert!(TcpFlags(flags::SYN).is_syn());
        assert!(!TcpFlags(flags::SYN | flags::ACK).is_syn());
        assert!(TcpFlags(flags::SYN | flags::ACK).is_syn_ack());
        assert!(TcpFlags(flags::ACK).is_ack());
        assert!(!TcpFlags(flags::ACK | flags::PSH).is_ack());
        assert!(!TcpFlags(flags::ACK | flags::FIN).is_ack());
        assert!(TcpFlags(flags::ACK | flags::FIN).is_fin());
        assert!(TcpFlags(flags::RST).is_rst());
    }

    #[test]
    fn test_parse_rejects_short_and_bad_offset() {
        assert!(TcpHeader::parse(&[0u8; 19]).is_err());
        let mut segment = build_segment(1, 2, 0);
        segment[12] = 4 << 4;
        assert!(TcpHeader::parse(&segment).is_err());
    }
}
