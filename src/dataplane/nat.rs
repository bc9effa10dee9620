//! UDP source NAT rewriting
//!
//! Operates on the buffers conntrack accepted: one datagram, or a reassembled
//! fragment chain head first. Addresses are rewritten in every fragment, the
//! port only in the head, and the UDP checksum is recomputed over the whole
//! chain.

use super::conntrack::{Conntrack, Direction};
use crate::packet::PacketBuf;
use crate::protocol::ipv4::Ipv4HeaderMut;
use crate::protocol::udp::{udp_checksum, UdpHeaderMut, HEADER_SIZE};
use crate::{Error, Result};
use std::iter;
use std::net::Ipv4Addr;

/// Rewrite a UDP datagram travelling in `dir` of a NAT record.
///
/// Origin packets get the SNAT source address and port from the reply
/// tuple; reply packets get the original source back as destination.
/// Network and transport offsets must already be set on every buffer.
pub fn rewrite_udp(ct: &Conntrack, dir: Direction, bufs: &mut [PacketBuf]) -> Result<()> {
    let (addr, port) = match dir {
        Direction::Origin => (ct.reply().dst, ct.reply().dport),
        Direction::Reply => (ct.original().src, ct.original().sport),
    };
    let Some((head, rest)) = bufs.split_first_mut() else {
        return Err(Error::InvalidPacket("empty fragment chain".into()));
    };

    let (src, dst) = rewrite_addr(head.network_data_mut(), dir, addr)?;
    {
        let mut udp = UdpHeaderMut::parse(head.transport_data_mut())?;
        match dir {
            Direction::Origin => udp.set_src_port(port),
            Direction::Reply => udp.set_dst_port(port),
        }
        udp.set_checksum(0);
    }
    for frag in rest.iter_mut() {
        rewrite_addr(frag.network_data_mut(), dir, addr)?;
    }

    let sum = {
        let (header, body) = head.transport_data().split_at(HEADER_SIZE);
        let chunks = iter::once(body).chain(rest.iter().map(PacketBuf::transport_data));
        udp_checksum(src, dst, header, chunks)
    };
    UdpHeaderMut::parse(head.transport_data_mut())?.set_checksum(sum);
    Ok(())
}

/// Swap the NAT-side address in one IP header and fix its checksum.
/// Returns the resulting (src, dst).
fn rewrite_addr(network: &mut [u8], dir: Direction, addr: Ipv4Addr) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let mut ip = Ipv4HeaderMut::parse(network)?;
    match dir {
        Direction::Origin => ip.set_src_addr(addr),
        Direction::Reply => ip.set_dst_addr(addr),
    }
    ip.update_checksum();
    Ok((ip.src_addr(), ip.dst_addr()))
}
