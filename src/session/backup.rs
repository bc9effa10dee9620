//! Backup link: one logical uplink over several slave connections
//!
//! Only one slave, the active one, carries traffic at a time. The
//! supervisor picks the live slave with the lowest average heartbeat delay
//! and picks again whenever the active slave closes or a new slave joins.

use super::link::Link;
use super::membership::Memberships;
use super::overlay::{Overlay, Uplink};
use crate::dataplane::{forward_frame, Port, PortFuture};
use crate::packet::{PacketBuf, SharedPacket};
use crate::telemetry::LinkStats;
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

pub struct BackupLink {
    name: String,
    overlay: Arc<Overlay>,
    memberships: Memberships,
    slaves: Mutex<Vec<Arc<Link>>>,
    active: Mutex<Option<Arc<Link>>>,
    changed: Notify,
    stats: Arc<LinkStats>,
}

impl BackupLink {
    pub fn new(overlay: &Arc<Overlay>, name: impl Into<String>) -> Arc<Self> {
        let backup = Arc::new(Self {
            name: name.into(),
            overlay: Arc::clone(overlay),
            memberships: Memberships::new(false),
            slaves: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            changed: Notify::new(),
            stats: Arc::new(LinkStats::new()),
        });
        overlay
            .metrics
            .register(&backup.name, Arc::clone(&backup.stats));
        backup
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }

    pub fn memberships(&self) -> &Memberships {
        &self.memberships
    }

    fn slaves(&self) -> MutexGuard<'_, Vec<Arc<Link>>> {
        self.slaves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<Arc<Link>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> Option<Arc<Link>> {
        self.active_slot().clone()
    }

    pub fn slave_count(&self) -> usize {
        self.slaves().len()
    }

    /// Join every zone the node has.
    pub fn join_all(self: &Arc<Self>) {
        let fdbs = &self.overlay.fdbs;
        let port: Arc<dyn Port> = Arc::clone(self) as Arc<dyn Port>;
        self.memberships
            .sync(fdbs, &fdbs.ids(), &port, self.overlay.is_dynamic());
    }

    /// Route `slave`'s inbound user data through this link.
    pub fn add_slave(self: &Arc<Self>, slave: &Arc<Link>) {
        slave.set_backup(Some(Arc::downgrade(self)));
        self.slaves().push(Arc::clone(slave));
        info!(backup = %self.name, slave = %slave.name(), "slave added");
        self.changed.notify_one();
    }

    pub fn remove_slave(&self, slave: &Arc<Link>) {
        self.slaves().retain(|s| !Arc::ptr_eq(s, slave));
        {
            let mut active = self.active_slot();
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, slave)) {
                *active = None;
            }
        }
        slave.set_backup(None);
        info!(backup = %self.name, slave = %slave.name(), "slave removed");
        self.changed.notify_one();
    }

    /// The live slave with the lowest nonzero average delay, else the
    /// first live slave.
    pub fn choose(&self) -> Option<Arc<Link>> {
        let slaves = self.slaves();
        let live = || slaves.iter().filter(|s| !s.is_closed());
        let chosen = live()
            .filter(|s| !s.delay_avg().is_zero())
            .min_by_key(|s| s.delay_avg())
            .or_else(|| live().next())
            .cloned();
        chosen
    }

    /// Keep an active slave selected. Runs for the lifetime of the link.
    pub async fn supervise(self: Arc<Self>) {
        loop {
            let Some(slave) = self.choose() else {
                *self.active_slot() = None;
                self.changed.notified().await;
                continue;
            };
            let switched = {
                let mut active = self.active_slot();
                let switched = !active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &slave));
                *active = Some(Arc::clone(&slave));
                switched
            };
            if switched {
                info!(
                    backup = %self.name,
                    slave = %slave.name(),
                    delay_avg = ?slave.delay_avg(),
                    "active slave selected"
                );
            }
            tokio::select! {
                _ = slave.closed() => {}
                _ = self.changed.notified() => {}
            }
        }
    }

    /// Inbound user data read by `slave`; only the active slave's frames
    /// are forwarded.
    pub async fn receive(&self, slave: &Arc<Link>, buf: PacketBuf) {
        let is_active = self
            .active_slot()
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(a, slave));
        if !is_active {
            trace!(backup = %self.name, slave = %slave.name(), "frame from standby slave dropped");
            return;
        }
        self.stats.record_rx(buf.len());
        let zone = buf.zone();
        let Some((fdb, port)) = self.memberships.get(zone) else {
            trace!(backup = %self.name, zone, "frame for a zone not joined");
            return;
        };
        forward_frame(&fdb, port, self.overlay.conntrack.as_ref(), buf).await;
    }

    async fn send_data(&self, pkt: SharedPacket) -> Result<()> {
        let Some(slave) = self.active() else {
            self.stats.record_drop(pkt.len());
            return Ok(());
        };
        let len = pkt.len();
        slave.send_data(pkt).await?;
        self.stats.record_tx(len);
        Ok(())
    }

    async fn report_zones(&self) -> Result<()> {
        let slave = self
            .active()
            .ok_or_else(|| Error::LinkClosed(self.name.clone()))?;
        debug!(backup = %self.name, slave = %slave.name(), "announcing zones");
        slave.report_zones().await
    }
}

impl Port for BackupLink {
    fn send(&self, pkt: SharedPacket) -> PortFuture<'_> {
        Box::pin(self.send_data(pkt))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl Uplink for BackupLink {
    fn uplink_name(&self) -> String {
        self.name.clone()
    }

    fn memberships(&self) -> &Memberships {
        &self.memberships
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn as_port(self: Arc<Self>) -> Arc<dyn Port> {
        self
    }

    fn announce(&self) -> PortFuture<'_> {
        Box::pin(self.report_zones())
    }
}

impl std::fmt::Debug for BackupLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupLink")
            .field("name", &self.name)
            .field("slaves", &self.slave_count())
            .field("active", &self.active().map(|s| s.name().to_string()))
            .finish()
    }
}
