//! Local frame devices bound into a zone
//!
//! A device is the node's own attachment to a zone, the place a tap
//! interface would sit. Frames read from it enter the zone as outbound
//! traffic; frames the zone delivers to it are written back.

use super::membership::Memberships;
use super::overlay::Overlay;
use crate::dataplane::{forward_frame, Port, PortFuture};
use crate::packet::SharedPacket;
use crate::protocol::ethernet::{Frame, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::protocol::ZoneId;
use crate::telemetry::LinkStats;
use crate::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, trace, warn};

/// Ethernet frame source and sink
pub trait Device: Send + Sync + 'static {
    /// Read one frame into `buf`, returning its length.
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Write one frame.
    fn send(&self, frame: &[u8]) -> impl Future<Output = Result<usize>> + Send;

    fn name(&self) -> String;
}

// ============================================================================
// Device link
// ============================================================================

/// A device joined to one zone as a counted port
pub struct DeviceLink<D: Device> {
    name: String,
    zone: ZoneId,
    overlay: Arc<Overlay>,
    device: D,
    memberships: Memberships,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    stats: Arc<LinkStats>,
}

impl<D: Device> DeviceLink<D> {
    /// Join `device` to `zone` and start reading from it. In dynamic mode
    /// the new zone is pushed to the masters.
    pub async fn attach(overlay: &Arc<Overlay>, device: D, zone: ZoneId) -> Result<Arc<Self>> {
        let (shutdown, _) = watch::channel(false);
        let link = Arc::new(Self {
            name: format!("dev:{}", device.name()),
            zone,
            overlay: Arc::clone(overlay),
            device,
            memberships: Memberships::new(true),
            closed: AtomicBool::new(false),
            shutdown,
            stats: Arc::new(LinkStats::new()),
        });
        let port: Arc<dyn Port> = Arc::clone(&link) as Arc<dyn Port>;
        link.memberships.join(&overlay.fdbs, zone, port)?;
        overlay.track_zone(zone);
        overlay.metrics.register(&link.name, Arc::clone(&link.stats));
        info!(device = %link.name, zone, "device attached");

        tokio::spawn(Arc::clone(&link).rx_loop());
        if overlay.is_dynamic() {
            overlay.update_masters().await;
        }
        Ok(link)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }

    /// Devices need no handshake.
    pub fn is_valid(&self) -> bool {
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        let dynamic = self.overlay.is_dynamic();
        self.memberships.quit_all(&self.overlay.fdbs, dynamic);
        self.overlay.metrics.unregister(&self.name, &self.stats);
        info!(device = %self.name, zone = self.zone, "device detached");

        if dynamic {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let overlay = Arc::clone(&self.overlay);
                handle.spawn(async move { overlay.update_masters().await });
            }
        }
    }

    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn rx_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.closed() => break,
                res = self.read_one() => {
                    if let Err(e) = res {
                        warn!(device = %self.name, error = %e, "device read failed");
                        break;
                    }
                }
            }
        }
        self.close();
    }

    async fn read_one(&self) -> Result<()> {
        let mut buf = self.overlay.pool.acquire();
        let capacity = buf.capacity();
        let n = self.device.recv(buf.reserve_tail(capacity)?).await?;
        buf.set_len(n)?;

        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&n) {
            trace!(device = %self.name, len = n, "frame size out of range");
            self.stats.record_drop(n);
            return Ok(());
        }
        let supported = Frame::parse(buf.data()).is_ok_and(|f| f.is_arp() || f.is_ipv4());
        if !supported {
            trace!(device = %self.name, "unsupported ethertype");
            self.stats.record_drop(n);
            return Ok(());
        }
        self.stats.record_rx(n);

        let Some((fdb, port)) = self.memberships.get(self.zone) else {
            return Ok(());
        };
        buf.set_zone(self.zone);
        buf.set_outbound(true);
        forward_frame(&fdb, port, self.overlay.conntrack.as_ref(), buf).await;
        Ok(())
    }

    async fn write(&self, pkt: SharedPacket) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LinkClosed(self.name.clone()));
        }
        let n = self.device.send(pkt.data()).await?;
        self.stats.record_tx(n);
        Ok(())
    }
}

impl<D: Device> Port for DeviceLink<D> {
    fn send(&self, pkt: SharedPacket) -> PortFuture<'_> {
        Box::pin(self.write(pkt))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl<D: Device> std::fmt::Debug for DeviceLink<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("name", &self.name)
            .field("zone", &self.zone)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// In-memory device
// ============================================================================

/// A device backed by a pair of channels
#[derive(Debug)]
pub struct ChannelDevice {
    name: String,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// The far side of a [`ChannelDevice`]
#[derive(Debug)]
pub struct DeviceHandle {
    inject: mpsc::Sender<Vec<u8>>,
    delivered: mpsc::Receiver<Vec<u8>>,
}

impl ChannelDevice {
    pub fn pair(name: impl Into<String>, capacity: usize) -> (Self, DeviceHandle) {
        let (inject, inbound) = mpsc::channel(capacity.max(1));
        let (outbound, delivered) = mpsc::channel(capacity.max(1));
        let device = Self {
            name: name.into(),
            inbound: Mutex::new(inbound),
            outbound,
        };
        (device, DeviceHandle { inject, delivered })
    }
}

impl Device for ChannelDevice {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let frame = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::LinkClosed(self.name.clone()))?;
        if frame.len() > buf.len() {
            return Err(Error::BufferOverflow {
                need: frame.len(),
                avail: buf.len(),
            });
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    async fn send(&self, frame: &[u8]) -> Result<usize> {
        self.outbound
            .send(frame.to_vec())
            .await
            .map_err(|_| Error::LinkClosed(self.name.clone()))?;
        Ok(frame.len())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl DeviceHandle {
    /// Hand a frame to the device as if the host had written it.
    pub async fn inject(&self, frame: Vec<u8>) -> Result<()> {
        self.inject
            .send(frame)
            .await
            .map_err(|_| Error::LinkClosed("device".into()))
    }

    /// Next frame the zone delivered to the device.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.delivered.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.delivered.try_recv().ok()
    }
}
