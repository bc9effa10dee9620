//! Shared node state
//!
//! One [`Overlay`] per node, handed as `Arc<Overlay>` to every link and
//! device. It owns the zone tables, conntrack, the set of master links and
//! the session settings every link reads.

use super::crypto::{BlockCrypt, CipherId, CryptoRegistry};
use super::membership::Memberships;
use crate::config::Config;
use crate::dataplane::{
    ConntrackRegistry, ConntrackSnapshot, FdbRegistry, FdbSnapshot, Port, PortFuture,
};
use crate::packet::{PacketPool, DEFAULT_BUF_SIZE, DEFAULT_MAX_CACHED};
use crate::protocol::ZoneId;
use crate::telemetry::{LinkStatsSnapshot, MetricsRegistry};
use crate::timer::{TimerWheel, DEFAULT_TICK};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub idle: Duration,
    pub count: u32,
    pub interval: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            count: 3,
            interval: Duration::from_secs(5),
        }
    }
}

/// Per-node session parameters
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub node_name: String,
    pub echo: Option<String>,
    pub cipher: CipherId,
    pub key: String,
    pub queue_size: usize,
    pub min_frame: usize,
    pub max_frame: usize,
    pub heartbeat: HeartbeatSettings,
    pub dial_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            node_name: "vnet".to_string(),
            echo: None,
            cipher: CipherId::None,
            key: String::new(),
            queue_size: 1024,
            min_frame: 42,
            max_frame: 1514,
            heartbeat: HeartbeatSettings::default(),
            dial_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let session = &config.session;
        let cipher = CipherId::from_name(&session.crypt)
            .ok_or_else(|| Error::Config(format!("unknown cipher '{}'", session.crypt)))?;
        Ok(Self {
            node_name: config.node.name.clone(),
            echo: config.node.echo.clone(),
            cipher,
            key: session.key.clone(),
            queue_size: session.queue_size.max(1),
            min_frame: session.min_frame,
            max_frame: session.max_frame,
            heartbeat: HeartbeatSettings {
                idle: Duration::from_secs(config.heartbeat.idle),
                count: config.heartbeat.count,
                interval: Duration::from_secs(config.heartbeat.interval),
            },
            dial_timeout: Duration::from_secs(session.dial_timeout),
            reconnect_delay: Duration::from_secs(session.reconnect_delay),
        })
    }
}

// ============================================================================
// Masters
// ============================================================================

/// A link toward the rest of the overlay. Masters follow the local zone
/// set and announce it upstream.
pub trait Uplink: Send + Sync {
    fn uplink_name(&self) -> String;

    fn memberships(&self) -> &Memberships;

    /// A closed uplink must not be joined to any zone again
    fn is_closed(&self) -> bool;

    /// This uplink as the port registered in each joined FDB
    fn as_port(self: Arc<Self>) -> Arc<dyn Port>;

    /// Send the joined zone set upstream
    fn announce(&self) -> PortFuture<'_>;
}

fn same_uplink(a: &Arc<dyn Uplink>, b: &Arc<dyn Uplink>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Currently connected masters
#[derive(Default)]
pub struct MasterSet {
    masters: RwLock<Vec<Arc<dyn Uplink>>>,
}

impl MasterSet {
    pub fn add(&self, master: Arc<dyn Uplink>) {
        let mut masters = self.masters.write().unwrap_or_else(PoisonError::into_inner);
        if !masters.iter().any(|m| same_uplink(m, &master)) {
            info!(master = %master.uplink_name(), "master added");
            masters.push(master);
        }
    }

    pub fn remove(&self, master: &Arc<dyn Uplink>) -> bool {
        let mut masters = self.masters.write().unwrap_or_else(PoisonError::into_inner);
        let before = masters.len();
        masters.retain(|m| !same_uplink(m, master));
        let removed = masters.len() != before;
        if removed {
            info!(master = %master.uplink_name(), "master removed");
        }
        removed
    }

    pub fn list(&self) -> Vec<Arc<dyn Uplink>> {
        self.masters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.masters.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MasterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.list().iter().map(|m| m.uplink_name()))
            .finish()
    }
}

// ============================================================================
// Overlay
// ============================================================================

/// Serializable view of the whole node
#[derive(Debug, Clone, Serialize)]
pub struct OverlaySnapshot {
    pub node: String,
    pub generated_at: DateTime<Utc>,
    pub dynamic: bool,
    pub zones: Vec<FdbSnapshot>,
    pub conntrack: Vec<ConntrackSnapshot>,
    pub links: BTreeMap<String, LinkStatsSnapshot>,
}

pub struct Overlay {
    pub fdbs: Arc<FdbRegistry>,
    pub conntrack: Option<ConntrackRegistry>,
    pub masters: MasterSet,
    pub timers: Arc<TimerWheel>,
    pub pool: PacketPool,
    pub crypto: CryptoRegistry,
    pub settings: SessionSettings,
    pub metrics: MetricsRegistry,
    static_zones: BTreeSet<ZoneId>,
    snat: BTreeMap<ZoneId, Ipv4Addr>,
    outbound: Arc<dyn BlockCrypt>,
}

impl Overlay {
    /// A dynamic-mode node without conntrack. Fails if the configured
    /// cipher is not provided.
    pub fn new(settings: SessionSettings) -> Result<Self> {
        let crypto = CryptoRegistry::new(&settings.key);
        let outbound = crypto.get(settings.cipher)?;
        let buf_size = settings.max_frame.max(DEFAULT_BUF_SIZE);
        Ok(Self {
            fdbs: Arc::new(FdbRegistry::new()),
            conntrack: None,
            masters: MasterSet::default(),
            timers: Arc::new(TimerWheel::new(DEFAULT_TICK)),
            pool: PacketPool::new(buf_size, DEFAULT_MAX_CACHED),
            crypto,
            settings,
            metrics: MetricsRegistry::new(),
            static_zones: BTreeSet::new(),
            snat: BTreeMap::new(),
            outbound,
        })
    }

    /// Fix the zone set; every zone is created up front and never removed.
    pub fn with_static_zones(mut self, zones: impl IntoIterator<Item = ZoneId>) -> Self {
        self.static_zones.extend(zones);
        for &zone in &self.static_zones {
            self.fdbs.get_or_create(zone);
        }
        self.track_static_zones();
        self
    }

    /// Track connections; zones listed in `snat` source-NAT outbound UDP.
    pub fn with_conntrack(mut self, snat: impl IntoIterator<Item = (ZoneId, Ipv4Addr)>) -> Self {
        self.conntrack = Some(ConntrackRegistry::new(Arc::clone(&self.timers)));
        self.snat.extend(snat);
        self.track_static_zones();
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = SessionSettings::from_config(config)?;
        let mut overlay = Self::new(settings)?;
        if config.conntrack.enabled {
            overlay = overlay.with_conntrack(
                config.conntrack.snat.iter().map(|rule| (rule.zone, rule.address)),
            );
        }
        Ok(overlay.with_static_zones(config.node.zones.iter().copied()))
    }

    fn track_static_zones(&self) {
        let zones: Vec<_> = self.static_zones.iter().copied().collect();
        for zone in zones {
            self.track_zone(zone);
        }
    }

    /// Start tracking `zone` if conntrack is on. Returns whether it is.
    pub fn track_zone(&self, zone: ZoneId) -> bool {
        match &self.conntrack {
            Some(conntrack) => {
                conntrack.enable_zone(zone, self.snat.get(&zone).copied());
                true
            }
            None => false,
        }
    }

    /// Without a static zone set, zones follow peer announcements.
    pub fn is_dynamic(&self) -> bool {
        self.static_zones.is_empty()
    }

    pub fn static_zones(&self) -> &BTreeSet<ZoneId> {
        &self.static_zones
    }

    /// Cipher sealing outbound payloads
    pub fn outbound_cipher(&self) -> &Arc<dyn BlockCrypt> {
        &self.outbound
    }

    /// Bring every master's memberships in line with the local zone set and
    /// re-announce the ones that changed.
    pub async fn update_masters(&self) {
        let zones = self.fdbs.ids();
        let dynamic = self.is_dynamic();
        for master in self.masters.list() {
            if master.is_closed() {
                trace!(master = %master.uplink_name(), "closed master skipped");
                continue;
            }
            let port = Arc::clone(&master).as_port();
            let changed = master.memberships().sync(&self.fdbs, &zones, &port, dynamic);
            // the master may have closed while joining
            if master.is_closed() {
                master.memberships().quit_all(&self.fdbs, dynamic);
                continue;
            }
            if changed {
                debug!(master = %master.uplink_name(), ?zones, "master zones updated");
                if let Err(e) = master.announce().await {
                    debug!(master = %master.uplink_name(), error = %e, "announcement not sent");
                }
            }
        }
    }

    /// Start the timer wheel driver and FDB aging.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![self.timers.spawn_driver(), self.fdbs.spawn_aging()]
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        OverlaySnapshot {
            node: self.settings.node_name.clone(),
            generated_at: Utc::now(),
            dynamic: self.is_dynamic(),
            zones: self.fdbs.snapshot(),
            conntrack: self
                .conntrack
                .as_ref()
                .map(ConntrackRegistry::snapshot)
                .unwrap_or_default(),
            links: self.metrics.links(),
        }
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("node", &self.settings.node_name)
            .field("static_zones", &self.static_zones)
            .field("zones", &self.fdbs.ids())
            .field("masters", &self.masters)
            .field("conntrack", &self.conntrack.is_some())
            .finish()
    }
}
