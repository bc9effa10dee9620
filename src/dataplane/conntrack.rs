//! Connection tracking with UDP source NAT
//!
//! One table per zone. Every record is indexed under both its original and
//! its reply tuple, so a lookup with the tuple of any packet finds the record
//! and tells the direction. Transitions that race with timer expiry are
//! serialized by a per-record lock: a handler that fails to cancel a timer
//! leaves the transition to the timer callback.

use super::fragment::{FragKey, FragmentTable, Reassembly};
use super::nat;
use crate::packet::PacketBuf;
use crate::protocol::ethernet::{self, Frame};
use crate::protocol::ipv4::{Ipv4Header, Protocol};
use crate::protocol::tcp::{TcpFlags, TcpHeader};
use crate::protocol::udp::UdpHeader;
use crate::protocol::ZoneId;
use crate::timer::{TimerHandle, TimerWheel};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;
use tracing::{debug, trace, warn};

// ============================================================================
// Timeouts
// ============================================================================

pub const TCP_SYN_TIMEOUT: Duration = Duration::from_secs(3);
pub const TCP_SYN_RCVD_TIMEOUT: Duration = Duration::from_secs(3);
pub const TCP_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(240);
/// Grace period between DEL and removal
pub const DEL_TIMEOUT: Duration = Duration::from_secs(10);
pub const UDP_NEW_TIMEOUT: Duration = Duration::from_secs(15);
pub const UDP_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(120);

fn established_timeout(proto: u8) -> Duration {
    match Protocol::from_u8(proto) {
        Some(Protocol::Tcp) => TCP_ESTABLISHED_TIMEOUT,
        _ => UDP_ESTABLISHED_TIMEOUT,
    }
}

// ============================================================================
// Tuples and records
// ============================================================================

/// Connection key (5-tuple)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Tuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub proto: u8,
}

impl Tuple {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, proto: u8) -> Self {
        Self {
            src,
            dst,
            sport,
            dport,
            proto,
        }
    }

    /// The tuple seen by packets flowing the other way (swap src/dst)
    pub fn invert(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
            proto: self.proto,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.proto, self.src, self.sport, self.dst, self.dport
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CtStatus {
    /// First packet seen
    New,
    /// SYN+ACK seen from the responder
    Reply,
    Established,
    /// Closing; removed when the grace timer fires
    Del,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Origin,
    Reply,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Origin => 0,
            Direction::Reply => 1,
        }
    }
}

#[derive(Debug)]
struct CtState {
    status: CtStatus,
    timer: Option<TimerHandle>,
    /// Bumped whenever a new timer is armed
    epoch: u64,
    finished_at: Option<DateTime<Utc>>,
}

/// One tracked connection
#[derive(Debug)]
pub struct Conntrack {
    zone: ZoneId,
    tuples: [Tuple; 2],
    bytes: [AtomicU64; 2],
    state: Mutex<CtState>,
    created_at: DateTime<Utc>,
    outbound: bool,
    nat: bool,
}

impl Conntrack {
    fn new(zone: ZoneId, origin: Tuple, reply: Tuple, outbound: bool, nat: bool) -> Self {
        Self {
            zone,
            tuples: [origin, reply],
            bytes: [AtomicU64::new(0), AtomicU64::new(0)],
            state: Mutex::new(CtState {
                status: CtStatus::New,
                timer: None,
                epoch: 0,
                finished_at: None,
            }),
            created_at: Utc::now(),
            outbound,
            nat,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn original(&self) -> &Tuple {
        &self.tuples[0]
    }

    pub fn reply(&self) -> &Tuple {
        &self.tuples[1]
    }

    /// Direction of a packet carrying `tuple`
    pub fn direction(&self, tuple: &Tuple) -> Direction {
        if *tuple == self.tuples[1] && *tuple != self.tuples[0] {
            Direction::Reply
        } else {
            Direction::Origin
        }
    }

    pub fn status(&self) -> CtStatus {
        self.lock().status
    }

    /// Bytes seen per direction, origin first
    pub fn bytes(&self) -> [u64; 2] {
        [
            self.bytes[0].load(Ordering::Relaxed),
            self.bytes[1].load(Ordering::Relaxed),
        ]
    }

    fn account(&self, dir: Direction, len: usize) {
        self.bytes[dir.index()].fetch_add(len as u64, Ordering::Relaxed);
    }

    /// First packet travelled from the local side
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Reply tuple was rewritten by SNAT
    pub fn is_nat(&self) -> bool {
        self.nat
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn snapshot(&self) -> ConntrackSnapshot {
        let state = self.lock();
        let [bytes_origin, bytes_reply] = self.bytes();
        ConntrackSnapshot {
            zone: self.zone,
            origin: self.tuples[0],
            reply: self.tuples[1],
            status: state.status,
            bytes_origin,
            bytes_reply,
            outbound: self.outbound,
            nat: self.nat,
            created_at: self.created_at,
            finished_at: state.finished_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConntrackSnapshot {
    pub zone: ZoneId,
    pub origin: Tuple,
    pub reply: Tuple,
    pub status: CtStatus,
    pub bytes_origin: u64,
    pub bytes_reply: u64,
    pub outbound: bool,
    pub nat: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What a record's timer does when it fires
#[derive(Debug, Clone, Copy)]
enum Expiry {
    Delete,
    /// Idle check carrying the byte counters seen when it was armed
    Established([u64; 2]),
}

enum Insert {
    Created(Arc<Conntrack>),
    Exists(Arc<Conntrack>),
    /// The reply tuple already belongs to another record
    Conflict,
}

/// Outcome of running a frame through conntrack
#[derive(Debug)]
pub enum Verdict {
    /// Deliver these buffers in order (one, or a reassembled fragment chain)
    Accept(Vec<PacketBuf>),
    /// Held by the reassembly queue
    Stolen,
    Drop,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept(_))
    }
}

/// Find a reply tuple for an SNAT flow: destination `snat`, destination port
/// probed upward from the original source port until no record holds it.
pub fn unique_reply_tuple<V>(
    table: &HashMap<Tuple, V>,
    origin: &Tuple,
    snat: Ipv4Addr,
) -> Option<Tuple> {
    let mut candidate = origin.invert();
    candidate.dst = snat;
    for _ in 0..=u16::MAX as u32 {
        if candidate != *origin && !table.contains_key(&candidate) {
            return Some(candidate);
        }
        candidate.dport = candidate.dport.wrapping_add(1);
    }
    None
}

// ============================================================================
// Per-zone table
// ============================================================================

/// Conntrack table of one zone
pub struct ZoneConntrack {
    zone: ZoneId,
    table: RwLock<HashMap<Tuple, Arc<Conntrack>>>,
    fragments: Arc<FragmentTable>,
    snat: Option<Ipv4Addr>,
    timers: Arc<TimerWheel>,
}

impl ZoneConntrack {
    pub fn new(zone: ZoneId, snat: Option<Ipv4Addr>, timers: Arc<TimerWheel>) -> Self {
        Self {
            zone,
            table: RwLock::new(HashMap::new()),
            fragments: Arc::new(FragmentTable::new(timers.clone())),
            snat,
            timers,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Tuple, Arc<Conntrack>>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Tuple, Arc<Conntrack>>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn snat(&self) -> Option<Ipv4Addr> {
        self.snat
    }

    pub fn fragments(&self) -> &Arc<FragmentTable> {
        &self.fragments
    }

    pub fn find(&self, tuple: &Tuple) -> Option<Arc<Conntrack>> {
        self.read().get(tuple).cloned()
    }

    /// Number of records (not keys)
    pub fn len(&self) -> usize {
        self.read()
            .iter()
            .filter(|(key, ct)| *key == ct.original())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConntrackSnapshot> {
        let mut records: Vec<_> = self
            .read()
            .iter()
            .filter(|(key, ct)| *key == ct.original())
            .map(|(_, ct)| ct.snapshot())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    fn insert(&self, origin: Tuple, outbound: bool, snat: Option<Ipv4Addr>) -> Result<Insert> {
        let mut table = self.write();
        if let Some(ct) = table.get(&origin) {
            return Ok(Insert::Exists(ct.clone()));
        }
        let reply = match snat {
            Some(addr) => unique_reply_tuple(&table, &origin, addr)
                .ok_or(Error::TupleExhausted { zone: self.zone })?,
            None => {
                let reply = origin.invert();
                if reply != origin && table.contains_key(&reply) {
                    return Ok(Insert::Conflict);
                }
                reply
            }
        };
        let ct = Arc::new(Conntrack::new(
            self.zone,
            origin,
            reply,
            outbound,
            snat.is_some(),
        ));
        table.insert(origin, ct.clone());
        table.insert(reply, ct.clone());
        Ok(Insert::Created(ct))
    }

    /// Drop both keys if they still point at `ct`
    fn remove(&self, ct: &Arc<Conntrack>) {
        let mut table = self.write();
        for tuple in &ct.tuples {
            if table.get(tuple).is_some_and(|cur| Arc::ptr_eq(cur, ct)) {
                table.remove(tuple);
            }
        }
    }

    fn arm(self: &Arc<Self>, ct: &Arc<Conntrack>, state: &mut CtState, delay: Duration, expiry: Expiry) {
        state.epoch += 1;
        let epoch = state.epoch;
        let zone: Weak<Self> = Arc::downgrade(self);
        let record = Arc::clone(ct);
        state.timer = Some(self.timers.schedule(delay, move || {
            if let Some(zone) = zone.upgrade() {
                zone.expire(&record, epoch, expiry);
            }
        }));
    }

    fn expire(self: &Arc<Self>, ct: &Arc<Conntrack>, epoch: u64, expiry: Expiry) {
        match expiry {
            Expiry::Delete => {
                {
                    let mut state = ct.lock();
                    state.status = CtStatus::Del;
                    state.timer = None;
                    state.finished_at.get_or_insert_with(Utc::now);
                }
                self.remove(ct);
                debug!(zone = self.zone, tuple = %ct.original(), "conntrack entry removed");
            }
            Expiry::Established(seen) => {
                let mut state = ct.lock();
                if state.epoch != epoch {
                    return;
                }
                if state.status == CtStatus::Del {
                    // closed while this check was in flight; nobody armed the grace timer
                    self.arm(ct, &mut state, DEL_TIMEOUT, Expiry::Delete);
                    return;
                }
                let now = ct.bytes();
                if now != seen {
                    let timeout = established_timeout(ct.original().proto);
                    self.arm(ct, &mut state, timeout, Expiry::Established(now));
                    return;
                }
                state.status = CtStatus::Del;
                state.finished_at = Some(Utc::now());
                self.arm(ct, &mut state, DEL_TIMEOUT, Expiry::Delete);
                trace!(zone = self.zone, tuple = %ct.original(), "idle connection closing");
            }
        }
    }

    // ========================================================================
    // UDP
    // ========================================================================

    /// Track one UDP datagram of `len` bytes.
    ///
    /// Returns the record and the packet's direction, or `None` when the
    /// flow cannot be tracked. Fails only when SNAT runs out of tuples.
    pub fn track_udp(
        self: &Arc<Self>,
        tuple: Tuple,
        len: usize,
        outbound: bool,
    ) -> Result<Option<(Arc<Conntrack>, Direction)>> {
        let ct = match self.find(&tuple) {
            Some(ct) => ct,
            None => {
                let snat = self.snat.filter(|_| outbound);
                match self.insert(tuple, outbound, snat)? {
                    Insert::Created(ct) => {
                        ct.account(Direction::Origin, len);
                        let mut state = ct.lock();
                        self.arm(&ct, &mut state, UDP_NEW_TIMEOUT, Expiry::Delete);
                        drop(state);
                        debug!(zone = self.zone, tuple = %tuple, reply = %ct.reply(), "new udp flow");
                        return Ok(Some((ct, Direction::Origin)));
                    }
                    Insert::Exists(ct) => ct,
                    Insert::Conflict => {
                        debug!(zone = self.zone, tuple = %tuple, "reply tuple in use, flow untracked");
                        return Ok(None);
                    }
                }
            }
        };
        let dir = ct.direction(&tuple);
        self.udp_update(&ct, dir, len);
        Ok(Some((ct, dir)))
    }

    fn udp_update(self: &Arc<Self>, ct: &Arc<Conntrack>, dir: Direction, len: usize) {
        let mut state = ct.lock();
        if state.status == CtStatus::Del {
            return;
        }
        ct.account(dir, len);
        if state.status == CtStatus::Established || dir != Direction::Reply {
            return;
        }
        if let Some(timer) = state.timer {
            if self.timers.cancel(timer) {
                state.status = CtStatus::Established;
                self.arm(ct, &mut state, UDP_ESTABLISHED_TIMEOUT, Expiry::Established(ct.bytes()));
            }
        }
    }

    // ========================================================================
    // TCP
    // ========================================================================

    /// Track one TCP segment. Only outbound SYNs open a record.
    pub fn track_tcp(
        self: &Arc<Self>,
        tuple: Tuple,
        flags: TcpFlags,
        len: usize,
        outbound: bool,
    ) -> Option<Arc<Conntrack>> {
        let found = self.find(&tuple);

        if flags.is_syn() {
            if let Some(ct) = found {
                let state = ct.lock();
                if state.status == CtStatus::New {
                    if let Some(timer) = state.timer {
                        self.timers.reset(timer, TCP_SYN_TIMEOUT);
                    }
                }
                drop(state);
                return Some(ct);
            }
            if !outbound {
                return None;
            }
            return match self.insert(tuple, true, None) {
                Ok(Insert::Created(ct)) => {
                    ct.account(Direction::Origin, len);
                    let mut state = ct.lock();
                    self.arm(&ct, &mut state, TCP_SYN_TIMEOUT, Expiry::Delete);
                    drop(state);
                    debug!(zone = self.zone, tuple = %tuple, "new tcp flow");
                    Some(ct)
                }
                Ok(Insert::Exists(ct)) => Some(ct),
                Ok(Insert::Conflict) | Err(_) => None,
            };
        }

        let ct = found?;
        self.tcp_update(&ct, &tuple, flags, len);
        Some(ct)
    }

    fn tcp_update(self: &Arc<Self>, ct: &Arc<Conntrack>, tuple: &Tuple, flags: TcpFlags, len: usize) {
        let mut state = ct.lock();
        if state.status == CtStatus::Del {
            return;
        }
        let dir = ct.direction(tuple);
        ct.account(dir, len);

        if flags.is_rst() || flags.is_fin() {
            state.status = CtStatus::Del;
            state.finished_at = Some(Utc::now());
            if let Some(timer) = state.timer {
                if self.timers.cancel(timer) {
                    self.arm(ct, &mut state, DEL_TIMEOUT, Expiry::Delete);
                }
            }
            return;
        }

        if state.status == CtStatus::Established {
            return;
        }

        if flags.is_syn_ack() {
            if dir != Direction::Reply {
                debug!(zone = self.zone, tuple = %tuple, "SYN+ACK in origin direction ignored");
                return;
            }
            if let Some(timer) = state.timer {
                if self.timers.reset(timer, TCP_SYN_RCVD_TIMEOUT) {
                    state.status = CtStatus::Reply;
                }
            }
            return;
        }

        if flags.is_ack() && state.status == CtStatus::Reply {
            if let Some(timer) = state.timer {
                if self.timers.cancel(timer) {
                    state.status = CtStatus::Established;
                    self.arm(ct, &mut state, TCP_ESTABLISHED_TIMEOUT, Expiry::Established(ct.bytes()));
                }
            }
        }
    }

    // ========================================================================
    // Packet path
    // ========================================================================

    /// Run one Ethernet frame through reassembly, tracking and NAT.
    pub fn process(self: &Arc<Self>, mut buf: PacketBuf) -> Verdict {
        let is_ipv4 = match Frame::parse(buf.data()) {
            Ok(frame) => frame.is_ipv4(),
            Err(err) => {
                debug!(zone = self.zone, %err, "unparseable frame");
                return Verdict::Drop;
            }
        };
        if !is_ipv4 {
            return Verdict::Accept(vec![buf]);
        }
        buf.set_mac_offset(0);
        buf.set_network_offset(ethernet::HEADER_SIZE);

        let (key, header_len, total, offset, more, fragment) = match Ipv4Header::parse(buf.network_data()) {
            Ok(ip) => (
                FragKey {
                    proto: ip.protocol(),
                    id: ip.identification(),
                    src: ip.src_addr(),
                    dst: ip.dst_addr(),
                },
                ip.header_len(),
                ip.total_length() as usize,
                ip.fragment_byte_offset(),
                ip.more_fragments(),
                ip.is_fragment(),
            ),
            Err(err) => {
                debug!(zone = self.zone, %err, "bad IPv4 header");
                return Verdict::Drop;
            }
        };

        let available = buf.network_data().len();
        if total < header_len || available < total {
            debug!(zone = self.zone, total, available, "IPv4 total length disagrees with frame");
            return Verdict::Drop;
        }
        if available > total {
            let end = buf.network_offset() + total;
            if let Err(err) = buf.set_len(end) {
                debug!(zone = self.zone, %err, "cannot trim padding");
                return Verdict::Drop;
            }
        }
        buf.set_transport_offset(header_len);

        let bufs = if fragment {
            let len = (total - header_len) as u16;
            match self.fragments.process(key, offset, len, more, buf) {
                Reassembly::Pending => return Verdict::Stolen,
                Reassembly::Rejected => return Verdict::Drop,
                Reassembly::Complete(bufs) => bufs,
            }
        } else {
            vec![buf]
        };
        self.inspect(key, bufs)
    }

    fn inspect(self: &Arc<Self>, key: FragKey, mut bufs: Vec<PacketBuf>) -> Verdict {
        let Some(head) = bufs.first() else {
            return Verdict::Drop;
        };
        let outbound = head.is_outbound();
        let len: usize = bufs.iter().map(PacketBuf::len).sum();

        match Protocol::from_u8(key.proto) {
            Some(Protocol::Tcp) => {
                let (tuple, flags) = match TcpHeader::parse(head.transport_data()) {
                    Ok(tcp) => (
                        Tuple::new(key.src, key.dst, tcp.src_port(), tcp.dst_port(), key.proto),
                        tcp.flags(),
                    ),
                    Err(err) => {
                        debug!(zone = self.zone, %err, "bad TCP header");
                        return Verdict::Drop;
                    }
                };
                self.track_tcp(tuple, flags, len, outbound);
            }
            Some(Protocol::Udp) => {
                let tuple = match UdpHeader::parse(head.transport_data()) {
                    Ok(udp) => Tuple::new(key.src, key.dst, udp.src_port(), udp.dst_port(), key.proto),
                    Err(err) => {
                        debug!(zone = self.zone, %err, "bad UDP header");
                        return Verdict::Drop;
                    }
                };
                match self.track_udp(tuple, len, outbound) {
                    Ok(Some((ct, dir))) if ct.is_nat() => {
                        if let Err(err) = nat::rewrite_udp(&ct, dir, &mut bufs) {
                            debug!(zone = self.zone, %err, "NAT rewrite failed");
                            return Verdict::Drop;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(zone = self.zone, tuple = %tuple, %err, "cannot track flow");
                        return Verdict::Drop;
                    }
                }
            }
            _ => {}
        }
        Verdict::Accept(bufs)
    }
}

impl fmt::Debug for ZoneConntrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneConntrack")
            .field("zone", &self.zone)
            .field("snat", &self.snat)
            .field("records", &self.len())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Conntrack tables of all zones that have tracking enabled
#[derive(Debug)]
pub struct ConntrackRegistry {
    zones: RwLock<BTreeMap<ZoneId, Arc<ZoneConntrack>>>,
    timers: Arc<TimerWheel>,
}

impl ConntrackRegistry {
    pub fn new(timers: Arc<TimerWheel>) -> Self {
        Self {
            zones: RwLock::new(BTreeMap::new()),
            timers,
        }
    }

    fn zones(&self) -> RwLockReadGuard<'_, BTreeMap<ZoneId, Arc<ZoneConntrack>>> {
        self.zones.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `zone`. An existing table is kept as is.
    pub fn enable_zone(&self, zone: ZoneId, snat: Option<Ipv4Addr>) -> Arc<ZoneConntrack> {
        let mut zones = self.zones.write().unwrap_or_else(PoisonError::into_inner);
        zones
            .entry(zone)
            .or_insert_with(|| {
                debug!(zone, ?snat, "conntrack enabled");
                Arc::new(ZoneConntrack::new(zone, snat, self.timers.clone()))
            })
            .clone()
    }

    /// Stop tracking `zone`; pending timers of its records become no-ops.
    pub fn disable_zone(&self, zone: ZoneId) -> bool {
        let mut zones = self.zones.write().unwrap_or_else(PoisonError::into_inner);
        zones.remove(&zone).is_some()
    }

    pub fn get(&self, zone: ZoneId) -> Option<Arc<ZoneConntrack>> {
        self.zones().get(&zone).cloned()
    }

    pub fn ids(&self) -> Vec<ZoneId> {
        self.zones().keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<ConntrackSnapshot> {
        self.zones()
            .values()
            .flat_map(|zone| zone.snapshot())
            .collect()
    }

    /// Frames of zones without tracking pass untouched.
    pub fn process(&self, buf: PacketBuf) -> Verdict {
        match self.get(buf.zone()) {
            Some(zone) => zone.process(buf),
            None => Verdict::Accept(vec![buf]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ethernet::FrameBuilder;
    use crate::protocol::ipv4::Ipv4Builder;
    use crate::protocol::tcp::flags;
    use crate::protocol::udp::{build_datagram, verify_datagram};
    use crate::protocol::{EtherType, MacAddr};
    use crate::timer::DEFAULT_TICK;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
    const PUBLIC: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

    fn zone(snat: Option<Ipv4Addr>) -> (Arc<TimerWheel>, Arc<ZoneConntrack>) {
        let timers = Arc::new(TimerWheel::new(DEFAULT_TICK));
        let ct = Arc::new(ZoneConntrack::new(7, snat, timers.clone()));
        (timers, ct)
    }

    fn advance(timers: &TimerWheel, d: Duration) {
        for _ in 0..d.as_millis() / DEFAULT_TICK.as_millis() {
            timers.advance();
        }
    }

    fn udp_tuple(sport: u16) -> Tuple {
        Tuple::new(CLIENT, SERVER, sport, 53, 17)
    }

    fn tcp_tuple() -> Tuple {
        Tuple::new(CLIENT, SERVER, 40000, 80, 6)
    }

    fn ip_frame(ip: Vec<u8>) -> Vec<u8> {
        FrameBuilder::new()
            .dst_mac(MacAddr([2, 0, 0, 0, 0, 2]))
            .src_mac(MacAddr([2, 0, 0, 0, 0, 1]))
            .ethertype(EtherType::Ipv4)
            .payload(&ip)
            .build()
    }

    fn udp_frame(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> PacketBuf {
        let datagram = build_datagram(src, dst, sport, dport, payload);
        let ip = Ipv4Builder::new()
            .protocol(Protocol::Udp)
            .src_addr(src)
            .dst_addr(dst)
            .payload(&datagram)
            .build();
        let mut buf = PacketBuf::from_bytes(&ip_frame(ip));
        buf.set_zone(7);
        buf
    }

    fn accepted(verdict: Verdict) -> Vec<PacketBuf> {
        match verdict {
            Verdict::Accept(bufs) => bufs,
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[test]
    fn test_tuple_invert() {
        let t = udp_tuple(5000);
        let r = t.invert();
        assert_eq!(r.src, SERVER);
        assert_eq!(r.dst, CLIENT);
        assert_eq!(r.sport, 53);
        assert_eq!(r.dport, 5000);
        assert_eq!(r.invert(), t);
    }

    #[test]
    fn test_udp_new_flow_indexed_both_ways() {
        let (_timers, ct) = zone(None);
        let (record, dir) = ct.track_udp(udp_tuple(5000), 100, true).unwrap().unwrap();
        assert_eq!(dir, Direction::Origin);
        assert_eq!(record.status(), CtStatus::New);
        assert!(!record.is_nat());
        let by_reply = ct.find(&udp_tuple(5000).invert()).unwrap();
        assert!(Arc::ptr_eq(&record, &by_reply));
        assert_eq!(ct.len(), 1);
        assert_eq!(record.bytes(), [100, 0]);
    }

    #[test]
    fn test_udp_reply_establishes() {
        let (_timers, ct) = zone(None);
        ct.track_udp(udp_tuple(5000), 100, true).unwrap();
        let (record, dir) = ct
            .track_udp(udp_tuple(5000).invert(), 60, false)
            .unwrap()
            .unwrap();
        assert_eq!(dir, Direction::Reply);
        assert_eq!(record.status(), CtStatus::Established);
        assert_eq!(record.bytes(), [100, 60]);
    }

    #[test]
    fn test_udp_unanswered_flow_expires() {
        let (timers, ct) = zone(None);
        ct.track_udp(udp_tuple(5000), 100, true).unwrap();
        advance(&timers, UDP_NEW_TIMEOUT - DEFAULT_TICK);
        assert!(ct.find(&udp_tuple(5000)).is_some());
        timers.advance();
        assert!(ct.find(&udp_tuple(5000)).is_none());
        assert!(ct.is_empty());
    }

    #[test]
    fn test_udp_idle_established_goes_del_then_removed() {
        let (timers, ct) = zone(None);
        ct.track_udp(udp_tuple(5000), 100, true).unwrap();
        ct.track_udp(udp_tuple(5000).invert(), 60, false).unwrap();
        advance(&timers, UDP_ESTABLISHED_TIMEOUT);
        let record = ct.find(&udp_tuple(5000)).unwrap();
        assert_eq!(record.status(), CtStatus::Del);
        assert!(record.snapshot().finished_at.is_some());
        advance(&timers, DEL_TIMEOUT);
        assert!(ct.find(&udp_tuple(5000)).is_none());
    }

    #[test]
    fn test_udp_active_established_rearms() {
        let (timers, ct) = zone(None);
        ct.track_udp(udp_tuple(5000), 100, true).unwrap();
        ct.track_udp(udp_tuple(5000).invert(), 60, false).unwrap();
        advance(&timers, Duration::from_secs(60));
        ct.track_udp(udp_tuple(5000), 10, true).unwrap();
        advance(&timers, Duration::from_secs(60));
        let record = ct.find(&udp_tuple(5000)).unwrap();
        assert_eq!(record.status(), CtStatus::Established);
        advance(&timers, UDP_ESTABLISHED_TIMEOUT);
        assert_eq!(record.status(), CtStatus::Del);
    }

    #[test]
    fn test_tcp_handshake_establishes() {
        let (_timers, ct) = zone(None);
        let t = tcp_tuple();
        let record = ct.track_tcp(t, TcpFlags(flags::SYN), 60, true).unwrap();
        assert_eq!(record.status(), CtStatus::New);
        ct.track_tcp(t.invert(), TcpFlags(flags::SYN | flags::ACK), 60, false);
        assert_eq!(record.status(), CtStatus::Reply);
        ct.track_tcp(t, TcpFlags(flags::ACK), 54, true);
        assert_eq!(record.status(), CtStatus::Established);
        assert_eq!(record.bytes(), [114, 60]);
    }

    #[test]
    fn test_tcp_inbound_syn_untracked() {
        let (_timers, ct) = zone(None);
        assert!(ct.track_tcp(tcp_tuple(), TcpFlags(flags::SYN), 60, false).is_none());
        assert!(ct.is_empty());
    }

    #[test]
    fn test_tcp_unknown_segment_ignored() {
        let (_timers, ct) = zone(None);
        assert!(ct.track_tcp(tcp_tuple(), TcpFlags(flags::ACK), 60, true).is_none());
        assert!(ct.is_empty());
    }

    #[test]
    fn test_tcp_syn_ack_from_origin_ignored() {
        let (_timers, ct) = zone(None);
        let record = ct.track_tcp(tcp_tuple(), TcpFlags(flags::SYN), 60, true).unwrap();
        ct.track_tcp(tcp_tuple(), TcpFlags(flags::SYN | flags::ACK), 60, true);
        assert_eq!(record.status(), CtStatus::New);
    }

    #[test]
    fn test_tcp_unanswered_syn_expires() {
        let (timers, ct) = zone(None);
        ct.track_tcp(tcp_tuple(), TcpFlags(flags::SYN), 60, true);
        advance(&timers, TCP_SYN_TIMEOUT);
        assert!(ct.is_empty());
    }

    #[test]
    fn test_tcp_repeated_syn_extends_timer() {
        let (timers, ct) = zone(None);
        ct.track_tcp(tcp_tuple(), TcpFlags(flags::SYN), 60, true);
        advance(&timers, Duration::from_secs(2));
        ct.track_tcp(tcp_tuple(), TcpFlags(flags::SYN), 60, true);
        advance(&timers, Duration::from_secs(2));
        assert_eq!(ct.len(), 1);
        advance(&timers, Duration::from_secs(1));
        assert!(ct.is_empty());
    }

    #[test]
    fn test_tcp_fin_deletes_after_grace() {
        let (timers, ct) = zone(None);
        let t = tcp_tuple();
        let record = ct.track_tcp(t, TcpFlags(flags::SYN), 60, true).unwrap();
        ct.track_tcp(t.invert(), TcpFlags(flags::SYN | flags::ACK), 60, false);
        ct.track_tcp(t, TcpFlags(flags::ACK), 54, true);
        ct.track_tcp(t, TcpFlags(flags::FIN | flags::ACK), 54, true);
        assert_eq!(record.status(), CtStatus::Del);

        // DEL ignores further traffic
        ct.track_tcp(t.invert(), TcpFlags(flags::ACK), 54, false);
        assert_eq!(record.bytes(), [168, 60]);

        advance(&timers, DEL_TIMEOUT - DEFAULT_TICK);
        assert_eq!(ct.len(), 1);
        timers.advance();
        assert!(ct.is_empty());
    }

    #[test]
    fn test_tcp_rst_closes_connection() {
        let (timers, ct) = zone(None);
        let record = ct.track_tcp(tcp_tuple(), TcpFlags(flags::SYN), 60, true).unwrap();
        ct.track_tcp(tcp_tuple().invert(), TcpFlags(flags::RST), 54, false);
        assert_eq!(record.status(), CtStatus::Del);
        advance(&timers, DEL_TIMEOUT);
        assert!(ct.is_empty());
    }

    #[test]
    fn test_tcp_idle_established_closes() {
        let (timers, ct) = zone(None);
        let t = tcp_tuple();
        let record = ct.track_tcp(t, TcpFlags(flags::SYN), 60, true).unwrap();
        ct.track_tcp(t.invert(), TcpFlags(flags::SYN | flags::ACK), 60, false);
        ct.track_tcp(t, TcpFlags(flags::ACK), 54, true);
        advance(&timers, TCP_ESTABLISHED_TIMEOUT);
        assert_eq!(record.status(), CtStatus::Del);
        advance(&timers, DEL_TIMEOUT);
        assert!(ct.is_empty());
    }

    #[test]
    fn test_unique_reply_tuple_skips_used_ports() {
        let mut table: HashMap<Tuple, ()> = HashMap::new();
        let origin = udp_tuple(5000);
        let first = unique_reply_tuple(&table, &origin, PUBLIC).unwrap();
        assert_eq!(first.dst, PUBLIC);
        assert_eq!(first.dport, 5000);
        table.insert(first, ());
        let second = unique_reply_tuple(&table, &origin, PUBLIC).unwrap();
        assert_eq!(second.dport, 5001);
    }

    #[test]
    fn test_unique_reply_tuple_exhausted() {
        let origin = udp_tuple(5000);
        let mut table = HashMap::new();
        let mut candidate = origin.invert();
        candidate.dst = PUBLIC;
        for port in 0..=u16::MAX {
            candidate.dport = port;
            table.insert(candidate, ());
        }
        assert!(unique_reply_tuple(&table, &origin, PUBLIC).is_none());
    }

    #[test]
    fn test_snat_flows_get_distinct_reply_tuples() {
        let (_timers, ct) = zone(Some(PUBLIC));
        let (a, _) = ct.track_udp(udp_tuple(5000), 100, true).unwrap().unwrap();
        let other = Tuple::new(Ipv4Addr::new(10, 0, 0, 2), SERVER, 5000, 53, 17);
        let (b, _) = ct.track_udp(other, 100, true).unwrap().unwrap();
        assert!(a.is_nat() && b.is_nat());
        assert_eq!(a.reply().dst, PUBLIC);
        assert_eq!(b.reply().dst, PUBLIC);
        assert_ne!(a.reply(), b.reply());
        assert_eq!(ct.len(), 2);
    }

    #[test]
    fn test_inbound_first_flow_not_natted() {
        let (_timers, ct) = zone(Some(PUBLIC));
        let (record, _) = ct.track_udp(udp_tuple(5000), 100, false).unwrap().unwrap();
        assert!(!record.is_nat());
        assert_eq!(*record.reply(), udp_tuple(5000).invert());
    }

    #[test]
    fn test_process_snat_round_trip() {
        let (_timers, ct) = zone(Some(PUBLIC));

        let mut out = udp_frame(CLIENT, SERVER, 5000, 53, b"query");
        out.set_outbound(true);
        let bufs = accepted(ct.process(out));
        let ip = Ipv4Header::parse(bufs[0].network_data()).unwrap();
        assert_eq!(ip.src_addr(), PUBLIC);
        assert!(ip.validate_checksum());
        let udp = UdpHeader::parse(bufs[0].transport_data()).unwrap();
        let public_port = udp.src_port();
        assert!(verify_datagram(PUBLIC, SERVER, bufs[0].transport_data()));

        let back = udp_frame(SERVER, PUBLIC, 53, public_port, b"answer");
        let bufs = accepted(ct.process(back));
        let ip = Ipv4Header::parse(bufs[0].network_data()).unwrap();
        assert_eq!(ip.dst_addr(), CLIENT);
        let udp = UdpHeader::parse(bufs[0].transport_data()).unwrap();
        assert_eq!(udp.dst_port(), 5000);
        assert!(verify_datagram(SERVER, CLIENT, bufs[0].transport_data()));

        let record = ct.find(&udp_tuple(5000)).unwrap();
        assert_eq!(record.status(), CtStatus::Established);
    }

    #[test]
    fn test_process_trims_ethernet_padding() {
        let (_timers, ct) = zone(None);
        let mut buf = udp_frame(CLIENT, SERVER, 5000, 53, b"x");
        let len = buf.len();
        buf.set_len(60.max(len + 4)).unwrap();
        let bufs = accepted(ct.process(buf));
        assert_eq!(bufs[0].len(), len);
    }

    #[test]
    fn test_process_truncated_ip_dropped() {
        let (_timers, ct) = zone(None);
        let mut buf = udp_frame(CLIENT, SERVER, 5000, 53, b"payload");
        let len = buf.len();
        buf.set_len(len - 3).unwrap();
        assert!(matches!(ct.process(buf), Verdict::Drop));
        assert!(ct.is_empty());
    }

    #[test]
    fn test_process_non_ipv4_accepted() {
        let (_timers, ct) = zone(None);
        let frame = FrameBuilder::new()
            .dst_mac(MacAddr::BROADCAST)
            .src_mac(MacAddr([2, 0, 0, 0, 0, 1]))
            .ethertype(EtherType::Arp)
            .payload(&[0u8; 28])
            .build();
        let bufs = accepted(ct.process(PacketBuf::from_bytes(&frame)));
        assert_eq!(bufs.len(), 1);
        assert!(ct.is_empty());
    }

    #[test]
    fn test_process_fragmented_datagram_tracked_once_complete() {
        let (_timers, ct) = zone(None);
        let payload: Vec<u8> = (0..40u8).collect();
        let datagram = build_datagram(CLIENT, SERVER, 5000, 53, &payload);
        let (first, second) = datagram.split_at(24);

        let frag = |offset: u16, more: bool, data: &[u8]| {
            let ip = Ipv4Builder::new()
                .identification(99)
                .protocol(Protocol::Udp)
                .src_addr(CLIENT)
                .dst_addr(SERVER)
                .more_fragments(more)
                .fragment_byte_offset(offset)
                .payload(data)
                .build();
            let mut buf = PacketBuf::from_bytes(&ip_frame(ip));
            buf.set_zone(7);
            buf.set_outbound(true);
            buf
        };

        assert!(matches!(ct.process(frag(24, false, second)), Verdict::Stolen));
        assert!(ct.is_empty());
        let bufs = accepted(ct.process(frag(0, true, first)));
        assert_eq!(bufs.len(), 2);
        assert!(ct.find(&udp_tuple(5000)).is_some());
        assert!(ct.fragments().is_empty());
    }

    #[test]
    fn test_snapshot_lists_each_record_once() {
        let (_timers, ct) = zone(Some(PUBLIC));
        ct.track_udp(udp_tuple(5000), 100, true).unwrap();
        ct.track_tcp(tcp_tuple(), TcpFlags(flags::SYN), 60, true);
        let snapshot = ct.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|r| r.nat && r.reply.dst == PUBLIC));
    }

    #[test]
    fn test_registry_untracked_zone_passes() {
        let registry = ConntrackRegistry::new(Arc::new(TimerWheel::new(DEFAULT_TICK)));
        registry.enable_zone(7, None);
        let mut buf = udp_frame(CLIENT, SERVER, 5000, 53, b"x");
        buf.set_zone(8);
        assert!(registry.process(buf).is_accept());
        assert!(registry.snapshot().is_empty());

        let buf = udp_frame(CLIENT, SERVER, 5000, 53, b"x");
        assert!(registry.process(buf).is_accept());
        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.disable_zone(7));
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn test_disabled_zone_timers_are_noops() {
        let timers = Arc::new(TimerWheel::new(DEFAULT_TICK));
        let registry = ConntrackRegistry::new(timers.clone());
        let zone = registry.enable_zone(7, None);
        zone.track_udp(udp_tuple(5000), 100, true).unwrap();
        drop(zone);
        registry.disable_zone(7);
        advance(&timers, UDP_NEW_TIMEOUT);
        assert_eq!(timers.pending(), 0);
    }
}
