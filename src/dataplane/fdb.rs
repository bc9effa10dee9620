//! Forwarding Database (MAC address table), one per zone
//!
//! Provides the learning bridge of the overlay:
//! - MAC learning from ARP and IPv4 frames
//! - Loop suspicion when a fresh binding shows up on another port
//! - Unknown unicast / ARP broadcast flooding
//! - Periodic aging of large tables
//!
//! The table only decides; delivery to the chosen ports is done by the
//! caller so that a full egress queue can apply backpressure.

use super::port_pool::{PortId, PortPool};
use crate::packet::SharedPacket;
use crate::protocol::{arp, ethernet::Frame, MacAddr, ZoneId};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A binding idle for longer than this may move to another port
pub const STALE_TICKS: u64 = 3;
/// Entries idle for longer than this are aged out
pub const EXPIRE_TICKS: u64 = 300;
/// Aging runs every this many ticks
pub const AGING_PERIOD_TICKS: u64 = 64;
/// Only tables larger than this are aged
pub const AGING_MIN_ENTRIES: usize = 128;
/// FDB clock resolution
pub const FDB_TICK: Duration = Duration::from_secs(1);

/// Future returned by [`Port::send`]
pub type PortFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Egress endpoint registered with an FDB
pub trait Port: Send + Sync {
    /// Queue a frame for transmission; waits while the egress queue is full.
    fn send(&self, pkt: SharedPacket) -> PortFuture<'_>;

    /// Human readable identity for logs and snapshots
    fn name(&self) -> String;
}

// ============================================================================
// Forwarding decision
// ============================================================================

/// Why a frame was refused by the FDB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropReason {
    /// Neither ARP nor IPv4
    UnsupportedEtherType,
    /// Source MAC is bound to another port and was seen recently
    LoopSuspected,
    /// Too short to carry an Ethernet header
    Malformed,
    /// Ingress port is not registered in this zone
    UnknownPort,
}

/// Result of a L2 forwarding decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2ForwardAction {
    /// Forward to a specific port (unicast hit)
    Forward { port: PortId },
    /// Flood to every port of the zone except the ingress port
    Flood { ports: Vec<PortId> },
    /// Destination sits behind the ingress port; nothing to send
    Filter,
    /// Refused
    Drop(DropReason),
}

impl L2ForwardAction {
    /// Whether the frame counts as forwarded. A filtered frame counts; a
    /// flood with no other port does not.
    pub fn forwarded(&self) -> bool {
        match self {
            L2ForwardAction::Forward { .. } | L2ForwardAction::Filter => true,
            L2ForwardAction::Flood { ports } => !ports.is_empty(),
            L2ForwardAction::Drop(_) => false,
        }
    }

    /// Egress port ids
    pub fn ports(&self) -> Vec<PortId> {
        match self {
            L2ForwardAction::Forward { port } => vec![*port],
            L2ForwardAction::Flood { ports } => ports.clone(),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Coarse clock shared by every zone table, one tick per second
#[derive(Debug, Default)]
pub struct FdbClock(AtomicU64);

impl FdbClock {
    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Advance one tick and return the new value
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ============================================================================
// Zone table
// ============================================================================

/// A learned MAC binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacNode {
    pub mac: MacAddr,
    pub port: PortId,
    pub last_seen: u64,
}

/// Learned addresses behind one port, as exported by snapshots
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    pub id: PortId,
    pub name: String,
    pub macs: Vec<MacAddr>,
}

/// Serializable view of one zone table
#[derive(Debug, Clone, Serialize)]
pub struct FdbSnapshot {
    pub zone: ZoneId,
    pub ports: Vec<PortSnapshot>,
}

/// MAC table of one zone
pub struct ZoneFdb {
    zone: ZoneId,
    macs: RwLock<HashMap<MacAddr, MacNode>>,
    ports: RwLock<BTreeMap<PortId, Arc<dyn Port>>>,
    pool: PortPool,
    clock: Arc<FdbClock>,
}

impl ZoneFdb {
    pub fn new(zone: ZoneId, clock: Arc<FdbClock>) -> Self {
        Self {
            zone,
            macs: RwLock::new(HashMap::new()),
            ports: RwLock::new(BTreeMap::new()),
            pool: PortPool::new(),
            clock,
        }
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    fn macs(&self) -> RwLockReadGuard<'_, HashMap<MacAddr, MacNode>> {
        self.macs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn macs_mut(&self) -> RwLockWriteGuard<'_, HashMap<MacAddr, MacNode>> {
        self.macs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn port_map(&self) -> RwLockReadGuard<'_, BTreeMap<PortId, Arc<dyn Port>>> {
        self.ports.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn port_map_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<PortId, Arc<dyn Port>>> {
        self.ports.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================
    // Ports
    // ========================================

    /// Register `port`; `counted` ports keep the zone alive.
    pub fn join_port(&self, port: Arc<dyn Port>, counted: bool) -> Result<PortId> {
        let id = self.pool.alloc();
        if id == 0 {
            return Err(Error::PortPoolExhausted { zone: self.zone });
        }
        if counted {
            self.pool.inc();
        }
        debug!(zone = self.zone, port = id, name = %port.name(), "port joined");
        self.port_map_mut().insert(id, port);
        Ok(id)
    }

    /// Unregister a port and forget every MAC learned behind it.
    pub fn release_port(&self, id: PortId, counted: bool) {
        let Some(port) = self.port_map_mut().remove(&id) else {
            return;
        };
        self.macs_mut().retain(|_, node| node.port != id);
        self.pool.free(id);
        if counted {
            self.pool.dec();
        }
        debug!(zone = self.zone, port = id, name = %port.name(), "port released");
    }

    pub fn port(&self, id: PortId) -> Option<Arc<dyn Port>> {
        self.port_map().get(&id).cloned()
    }

    pub fn port_ids(&self) -> Vec<PortId> {
        self.port_map().keys().copied().collect()
    }

    /// Ports counted toward the zone's liveness
    pub fn port_count(&self) -> usize {
        self.pool.count()
    }

    // ========================================
    // MAC table
    // ========================================

    pub fn get(&self, mac: &MacAddr) -> Option<MacNode> {
        self.macs().get(mac).cloned()
    }

    /// Bind `mac` to `port` at the current tick. Ignored for unknown ports.
    pub fn add(&self, mac: MacAddr, port: PortId) {
        if !self.port_map().contains_key(&port) {
            return;
        }
        let node = MacNode {
            mac,
            port,
            last_seen: self.clock.now(),
        };
        self.macs_mut().insert(mac, node);
    }

    pub fn remove(&self, mac: &MacAddr) -> Option<MacNode> {
        self.macs_mut().remove(mac)
    }

    pub fn len(&self) -> usize {
        self.macs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.macs().is_empty()
    }

    /// Learn the source and decide where `frame` goes.
    pub fn forward(&self, ingress: PortId, frame: &[u8]) -> L2ForwardAction {
        let Ok(eth) = Frame::parse(frame) else {
            return L2ForwardAction::Drop(DropReason::Malformed);
        };
        if !eth.is_arp() && !eth.is_ipv4() {
            return L2ForwardAction::Drop(DropReason::UnsupportedEtherType);
        }
        if !self.port_map().contains_key(&ingress) {
            return L2ForwardAction::Drop(DropReason::UnknownPort);
        }

        let src = eth.src_mac();
        let now = self.clock.now();
        {
            let mut macs = self.macs_mut();
            match macs.get_mut(&src) {
                Some(node) if node.port == ingress => node.last_seen = now,
                Some(node) => {
                    let stale = now.saturating_sub(node.last_seen) > STALE_TICKS;
                    if stale || arp::is_reply(frame) {
                        info!(zone = self.zone, mac = %src, from = node.port, to = ingress, "MAC moved to another port");
                        node.port = ingress;
                        node.last_seen = now;
                    } else {
                        debug!(zone = self.zone, mac = %src, bound = node.port, ingress, "loop suspected, dropping");
                        return L2ForwardAction::Drop(DropReason::LoopSuspected);
                    }
                }
                None => {
                    macs.insert(
                        src,
                        MacNode {
                            mac: src,
                            port: ingress,
                            last_seen: now,
                        },
                    );
                }
            }
        }

        let dst = eth.dst_mac();
        if eth.is_arp() && dst.is_broadcast() {
            return self.flood(ingress);
        }
        match self.get(&dst) {
            Some(node) if node.port == ingress => L2ForwardAction::Filter,
            Some(node) => L2ForwardAction::Forward { port: node.port },
            None => self.flood(ingress),
        }
    }

    fn flood(&self, ingress: PortId) -> L2ForwardAction {
        let ports = self
            .port_map()
            .keys()
            .copied()
            .filter(|&p| p != ingress)
            .collect();
        L2ForwardAction::Flood { ports }
    }

    // ========================================
    // Aging
    // ========================================

    /// Drop bindings idle for more than `expiry` ticks. Returns the count removed.
    pub fn age_out(&self, now: u64, expiry: u64) -> usize {
        let mut macs = self.macs_mut();
        let before = macs.len();
        macs.retain(|_, node| now.saturating_sub(node.last_seen) <= expiry);
        before - macs.len()
    }

    pub fn snapshot(&self) -> FdbSnapshot {
        let macs = self.macs();
        let ports = self
            .port_map()
            .iter()
            .map(|(&id, port)| {
                let mut bound: Vec<MacAddr> = macs
                    .values()
                    .filter(|node| node.port == id)
                    .map(|node| node.mac)
                    .collect();
                bound.sort();
                PortSnapshot {
                    id,
                    name: port.name(),
                    macs: bound,
                }
            })
            .collect();
        FdbSnapshot {
            zone: self.zone,
            ports,
        }
    }
}

impl std::fmt::Debug for ZoneFdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneFdb")
            .field("zone", &self.zone)
            .field("macs", &self.len())
            .field("ports", &self.port_ids())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Zone id to FDB map.
///
/// The registry lock only guards zone creation, lookup and removal; table
/// contents are guarded by each zone's own locks.
#[derive(Debug, Default)]
pub struct FdbRegistry {
    zones: RwLock<BTreeMap<ZoneId, Arc<ZoneFdb>>>,
    clock: Arc<FdbClock>,
}

impl FdbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> &Arc<FdbClock> {
        &self.clock
    }

    fn zones(&self) -> RwLockReadGuard<'_, BTreeMap<ZoneId, Arc<ZoneFdb>>> {
        self.zones.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn zones_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<ZoneId, Arc<ZoneFdb>>> {
        self.zones.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_or_create(&self, zone: ZoneId) -> Arc<ZoneFdb> {
        if let Some(fdb) = self.get(zone) {
            return fdb;
        }
        self.zones_mut()
            .entry(zone)
            .or_insert_with(|| {
                info!(zone, "zone created");
                Arc::new(ZoneFdb::new(zone, self.clock.clone()))
            })
            .clone()
    }

    pub fn get(&self, zone: ZoneId) -> Option<Arc<ZoneFdb>> {
        self.zones().get(&zone).cloned()
    }

    pub fn ids(&self) -> Vec<ZoneId> {
        self.zones().keys().copied().collect()
    }

    pub fn remove(&self, zone: ZoneId) -> Option<Arc<ZoneFdb>> {
        let removed = self.zones_mut().remove(&zone);
        if removed.is_some() {
            info!(zone, "zone removed");
        }
        removed
    }

    /// Remove the zone when no counted port holds it. Returns whether it went.
    pub fn try_remove(&self, zone: ZoneId) -> bool {
        let mut zones = self.zones_mut();
        match zones.get(&zone) {
            Some(fdb) if fdb.port_count() == 0 => {
                zones.remove(&zone);
                info!(zone, "zone removed, no ports left");
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<FdbSnapshot> {
        let zones: Vec<_> = self.zones().values().cloned().collect();
        zones.iter().map(|fdb| fdb.snapshot()).collect()
    }

    /// Advance the clock one tick; every [`AGING_PERIOD_TICKS`] ticks, age
    /// out the large tables. Returns the number of entries removed.
    pub fn tick(&self) -> usize {
        let now = self.clock.tick();
        if now % AGING_PERIOD_TICKS != 0 {
            return 0;
        }
        let zones: Vec<_> = self.zones().values().cloned().collect();
        let mut removed = 0;
        for fdb in zones.iter().filter(|fdb| fdb.len() > AGING_MIN_ENTRIES) {
            let n = fdb.age_out(now, EXPIRE_TICKS);
            if n > 0 {
                debug!(zone = fdb.zone(), removed = n, "aged out MAC entries");
            }
            removed += n;
        }
        removed
    }

    /// Run [`tick`](Self::tick) once per second.
    pub fn spawn_aging(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FDB_TICK);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.tick();
            }
        })
    }
}
