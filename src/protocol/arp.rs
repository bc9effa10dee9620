//! ARP (Address Resolution Protocol) - RFC 826
//!
//! The overlay never answers ARP itself; it only needs to recognise replies,
//! which are allowed to migrate a MAC binding between ports.

use super::{ethernet, EtherType, MacAddr};
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// ARP body size (for Ethernet/IPv4)
pub const ARP_PACKET_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl ArpOp {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }
}

/// ARP packet (Ethernet/IPv4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < ARP_PACKET_SIZE {
            return Err(Error::Parse("ARP packet too short".into()));
        }
        let operation = ArpOp::from_u16(u16::from_be_bytes([buffer[6], buffer[7]]))
            .ok_or_else(|| Error::Parse("invalid ARP operation".into()))?;
        let mac_at = |at: usize| MacAddr::from_slice(&buffer[at..]).unwrap_or_default();
        let ip_at = |at: usize| Ipv4Addr::new(buffer[at], buffer[at + 1], buffer[at + 2], buffer[at + 3]);

        Ok(Self {
            operation,
            sender_mac: mac_at(8),
            sender_ip: ip_at(14),
            target_mac: mac_at(18),
            target_ip: ip_at(24),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_SIZE] {
        let mut buf = [0u8; ARP_PACKET_SIZE];
        buf[0..2].copy_from_slice(&1u16.to_be_bytes());
        buf[2..4].copy_from_slice(&(EtherType::Ipv4 as u16).to_be_bytes());
        buf[4] = 6;
        buf[5] = 4;
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_mac.0);
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_mac.0);
        buf[24..28].copy_from_slice(&self.target_ip.octets());
        buf
    }
}

/// True when `frame` is an Ethernet frame carrying an ARP reply.
pub fn is_reply(frame: &[u8]) -> bool {
    if frame.len() < ethernet::HEADER_SIZE + 8 {
        return false;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let op_at = ethernet::HEADER_SIZE + 6;
    ethertype == EtherType::Arp as u16
        && u16::from_be_bytes([frame[op_at], frame[op_at + 1]]) == ArpOp::Reply as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ethernet::FrameBuilder;

    fn arp_frame(op: ArpOp) -> Vec<u8> {
        let pkt = ArpPacket {
            operation: op,
            sender_mac: MacAddr([0x02, 0, 0, 0, 0, 1]),
            sender_ip: Ipv4Addr::new(10, 0, 0, 1),
            target_mac: MacAddr::ZERO,
            target_ip: Ipv4Addr::new(10, 0, 0, 2),
        };
        FrameBuilder::new()
            .dst_mac(MacAddr::BROADCAST)
            .src_mac(pkt.sender_mac)
            .ethertype(EtherType::Arp)
            .payload(&pkt.to_bytes())
            .build()
    }

    #[test]
    fn test_parse_roundtrip_fields() {
        let frame = arp_frame(ArpOp::Request);
        let pkt = ArpPacket::parse(&frame[ethernet::HEADER_SIZE..]).unwrap();
        assert_eq!(pkt.operation, ArpOp::Request);
        assert_eq!(pkt.sender_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pkt.target_ip, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_is_reply() {
        assert!(is_reply(&arp_frame(ArpOp::Reply)));
        assert!(!is_reply(&arp_frame(ArpOp::Request)));
        assert!(!is_reply(&[0u8; 10]));
    }

    #[test]
    fn test_parse_too_short() {
        assert!(ArpPacket::parse(&[0u8; 20]).is_err());
    }
}
