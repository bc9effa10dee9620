//! One framed connection to another node
//!
//! A link owns four tasks:
//! - inbound pump: reads frames and dispatches them by type
//! - outbound pump: drains the bounded send queue onto the stream
//! - heartbeat: probes a quiet peer and drops it after `count` misses
//! - stats: turns byte counters into per-second rates
//!
//! User data is only accepted and sent once the first heartbeat reply
//! matched (the link is `valid`). Control frames flow from the start.

use super::backup::BackupLink;
use super::crypto::LinkCrypt;
use super::frame::{
    self, FrameHeader, Heartbeat, MsgType, HEADER_SIZE, MAX_ECHO_REPLY, MAX_ECHO_REQUEST,
};
use super::membership::Memberships;
use super::overlay::{Overlay, Uplink};
use crate::dataplane::{forward_frame, Port, PortFuture};
use crate::packet::{PacketBuf, SharedPacket};
use crate::protocol::ZoneId;
use crate::telemetry::{LinkStats, LinkStatsSnapshot};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

/// First heartbeat check after the link comes up
pub const FIRST_CHECK: Duration = Duration::from_secs(5);
/// Delay before the first heartbeat request
pub const FIRST_REQUEST: Duration = Duration::from_millis(10);
/// Rate sampling period
pub const STATS_PERIOD: Duration = Duration::from_secs(1);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// How the link came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    /// Dialed uplink; joins every zone and announces them
    Master,
    /// Accepted connection; joins what the other side announces
    Peer,
    /// Dialed member of a backup link; joins nothing itself
    Slave,
}

impl LinkRole {
    /// Whether this link's ports keep a zone alive
    pub fn counted(self) -> bool {
        self == LinkRole::Peer
    }
}

enum Outbound {
    Data(SharedPacket),
    Control {
        kind: MsgType,
        zone: ZoneId,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct HeartbeatState {
    id: u16,
    sent_at: Option<Instant>,
    delay: Duration,
    delay_sum: Duration,
    delay_avg: Duration,
}

impl HeartbeatState {
    /// Id for the next request; wraps from 0xffff to 1, restarting the
    /// delay average.
    fn next_request(&mut self) -> u16 {
        self.id = self.id.wrapping_add(1);
        if self.id == 0 {
            self.id = 1;
            self.delay_sum = Duration::ZERO;
        }
        self.sent_at = Some(Instant::now());
        self.id
    }
}

/// Serializable view of a link
#[derive(Debug, Clone, Serialize)]
pub struct LinkSnapshot {
    pub name: String,
    pub role: LinkRole,
    pub valid: bool,
    pub closed: bool,
    pub zones: Vec<ZoneId>,
    pub delay_ms: u128,
    pub delay_avg_ms: u128,
    pub stats: LinkStatsSnapshot,
}

pub struct Link {
    id: u64,
    name: String,
    role: LinkRole,
    overlay: Arc<Overlay>,
    queue: Mutex<Option<mpsc::Sender<Outbound>>>,
    crypt: LinkCrypt,
    memberships: Memberships,
    valid: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    stats: Arc<LinkStats>,
    heartbeat: Mutex<HeartbeatState>,
    backup: Mutex<Option<Weak<BackupLink>>>,
}

impl Link {
    /// Wrap `stream` in a link and start its tasks.
    pub fn establish<S>(
        overlay: &Arc<Overlay>,
        stream: S,
        role: LinkRole,
        name: impl Into<String>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let settings = &overlay.settings;
        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let (shutdown, _) = watch::channel(false);
        let crypt = LinkCrypt::new(
            settings.cipher,
            Arc::clone(overlay.outbound_cipher()),
            overlay.crypto.clone(),
        );
        let link = Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            role,
            overlay: Arc::clone(overlay),
            queue: Mutex::new(Some(tx)),
            crypt,
            memberships: Memberships::new(role.counted()),
            valid: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            stats: Arc::new(LinkStats::new()),
            heartbeat: Mutex::new(HeartbeatState::default()),
            backup: Mutex::new(None),
        });
        overlay.metrics.register(&link.name, Arc::clone(&link.stats));
        info!(link = %link.name, role = ?role, "link established");

        if let Some(echo) = &settings.echo {
            let mut payload = echo.as_bytes().to_vec();
            payload.truncate(MAX_ECHO_REQUEST);
            link.try_enqueue_control(MsgType::EchoRequest, 0, payload);
        }

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(Arc::clone(&link).read_loop(reader));
        tokio::spawn(Arc::clone(&link).write_loop(writer, rx));
        tokio::spawn(Arc::clone(&link).heartbeat_loop());
        tokio::spawn(Arc::clone(&link).stats_loop());
        link
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// First heartbeat reply matched
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }

    pub fn memberships(&self) -> &Memberships {
        &self.memberships
    }

    fn heartbeat_state(&self) -> MutexGuard<'_, HeartbeatState> {
        self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Round trip of the last answered heartbeat
    pub fn delay(&self) -> Duration {
        self.heartbeat_state().delay
    }

    /// Mean heartbeat round trip; zero until a reply arrived
    pub fn delay_avg(&self) -> Duration {
        self.heartbeat_state().delay_avg
    }

    pub(crate) fn set_backup(&self, backup: Option<Weak<BackupLink>>) {
        *self.backup.lock().unwrap_or_else(PoisonError::into_inner) = backup;
    }

    fn backup(&self) -> Option<Arc<BackupLink>> {
        self.backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        let (delay, delay_avg) = {
            let hb = self.heartbeat_state();
            (hb.delay, hb.delay_avg)
        };
        LinkSnapshot {
            name: self.name.clone(),
            role: self.role,
            valid: self.is_valid(),
            closed: self.is_closed(),
            zones: self.memberships.ids(),
            delay_ms: delay.as_millis(),
            delay_avg_ms: delay_avg.as_millis(),
            stats: self.stats.snapshot(),
        }
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Tear the link down. Only the first call does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.shutdown.send_replace(true);

        let overlay = &self.overlay;
        let dynamic = overlay.is_dynamic();
        self.memberships.quit_all(&overlay.fdbs, dynamic);
        overlay.metrics.unregister(&self.name, &self.stats);
        info!(link = %self.name, role = ?self.role, valid = self.is_valid(), "link closed");

        if dynamic && self.role != LinkRole::Master {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let overlay = Arc::clone(overlay);
                handle.spawn(async move { overlay.update_masters().await });
            }
        }
    }

    /// Resolves once the link is closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ========================================
    // Zones
    // ========================================

    fn port(self: &Arc<Self>) -> Arc<dyn Port> {
        Arc::clone(self) as Arc<dyn Port>
    }

    /// Join every zone the node has.
    pub fn join_all(self: &Arc<Self>) {
        let zones = self.overlay.fdbs.ids();
        self.sync_zones(&zones);
    }

    fn sync_zones(self: &Arc<Self>, zones: &[ZoneId]) -> bool {
        if self.is_closed() {
            return false;
        }
        let fdbs = &self.overlay.fdbs;
        let dynamic = self.overlay.is_dynamic();
        let changed = self.memberships.sync(fdbs, zones, &self.port(), dynamic);
        // close() may have run between the check and the joins
        if self.is_closed() {
            self.memberships.quit_all(fdbs, dynamic);
        }
        changed
    }

    /// Announce the joined zone set; a slave announces its backup link's.
    pub async fn report_zones(&self) -> Result<()> {
        let zones = match self.backup() {
            Some(backup) => backup.memberships().ids(),
            None => self.memberships.ids(),
        };
        debug!(link = %self.name, ?zones, "announcing zones");
        self.enqueue(Outbound::Control {
            kind: MsgType::ZoneAnnouncement,
            zone: 0,
            payload: frame::encode_zone_ids(&zones),
        })
        .await
    }

    async fn on_announcement(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let announced = match frame::parse_zone_ids(payload) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(link = %self.name, error = %e, "malformed zone announcement dropped");
                return Ok(());
            }
        };
        let overlay = &self.overlay;
        let dynamic = overlay.is_dynamic();
        let wanted: Vec<ZoneId> = if dynamic {
            announced
        } else {
            announced
                .into_iter()
                .filter(|&zone| overlay.fdbs.get(zone).is_some())
                .collect()
        };
        debug!(link = %self.name, zones = ?wanted, "zones announced");
        self.sync_zones(&wanted);
        if dynamic {
            overlay.update_masters().await;
        }
        Ok(())
    }

    // ========================================
    // Sending
    // ========================================

    fn sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn enqueue(&self, item: Outbound) -> Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| Error::LinkClosed(self.name.clone()))?;
        tx.send(item)
            .await
            .map_err(|_| Error::LinkClosed(self.name.clone()))
    }

    fn try_enqueue_control(&self, kind: MsgType, zone: ZoneId, payload: Vec<u8>) {
        if let Some(tx) = self.sender() {
            if tx.try_send(Outbound::Control { kind, zone, payload }).is_err() {
                debug!(link = %self.name, ?kind, "control frame dropped, queue full");
            }
        }
    }

    /// Queue a user frame; waits while the queue is full. Frames offered
    /// before the link is valid are dropped.
    pub async fn send_data(&self, pkt: SharedPacket) -> Result<()> {
        if !self.is_valid() {
            trace!(link = %self.name, "link not valid yet, frame dropped");
            self.stats.record_drop(pkt.len());
            return Ok(());
        }
        self.enqueue(Outbound::Data(pkt)).await
    }

    async fn send_heartbeat_request(&self) {
        let id = self.heartbeat_state().next_request();
        let payload = Heartbeat::Request(id).encode().to_vec();
        let request = Outbound::Control {
            kind: MsgType::HeartbeatRequest,
            zone: 0,
            payload,
        };
        if let Err(e) = self.enqueue(request).await {
            debug!(link = %self.name, error = %e, "heartbeat not sent");
        }
    }

    /// Lay out header and sealed payload of `item` into `out`.
    fn encode(&self, item: &Outbound, out: &mut Vec<u8>) {
        let (kind, zone, payload): (MsgType, ZoneId, &[u8]) = match item {
            Outbound::Data(pkt) => (MsgType::UserData, pkt.zone(), pkt.data()),
            Outbound::Control {
                kind,
                zone,
                payload,
            } => (*kind, *zone, payload.as_slice()),
        };
        out.clear();
        out.extend_from_slice(&[0u8; HEADER_SIZE]);
        out.extend_from_slice(payload);
        let crypt = self.crypt.seal(&mut out[HEADER_SIZE..]);
        let header = FrameHeader::new(kind, payload.len() as u16, zone).with_crypt(crypt);
        out[..HEADER_SIZE].copy_from_slice(&header.encode());
    }

    // ========================================
    // Tasks
    // ========================================

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: R) {
        loop {
            let result = tokio::select! {
                result = self.read_frame(&mut reader) => result,
                _ = self.closed() => break,
            };
            if let Err(e) = result {
                match e {
                    Error::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                        info!(link = %self.name, "peer closed the link")
                    }
                    _ => warn!(link = %self.name, error = %e, "link read failed"),
                }
                break;
            }
        }
        self.close();
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        self: Arc<Self>,
        mut writer: W,
        mut rx: mpsc::Receiver<Outbound>,
    ) {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.overlay.settings.max_frame);
        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = self.closed() => None,
            };
            let Some(item) = item else {
                break;
            };
            self.encode(&item, &mut out);
            if let Err(e) = writer.write_all(&out).await {
                warn!(link = %self.name, error = %e, "link write failed");
                break;
            }
            self.stats.record_tx(out.len());
        }
        let _ = writer.shutdown().await;
        self.close();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let settings = self.overlay.settings.heartbeat;
        let mut deadline = Instant::now() + FIRST_CHECK;
        tokio::select! {
            _ = time::sleep(FIRST_REQUEST) => {}
            _ = self.closed() => return,
        }
        self.send_heartbeat_request().await;

        let mut misses = 0;
        loop {
            let rx = self.stats.rx_bytes.get();
            tokio::select! {
                _ = time::sleep_until(deadline) => {}
                _ = self.closed() => return,
            }
            if !self.is_valid() {
                warn!(link = %self.name, "no heartbeat reply, dropping link");
                break;
            }
            if rx == self.stats.rx_bytes.get() {
                if misses >= settings.count {
                    warn!(link = %self.name, misses, "heartbeat timeout, dropping link");
                    break;
                }
                self.send_heartbeat_request().await;
                deadline = Instant::now() + settings.interval;
                misses += 1;
            } else {
                deadline = Instant::now() + settings.idle;
                misses = 0;
            }
        }
        self.close();
    }

    async fn stats_loop(self: Arc<Self>) {
        let mut interval = time::interval(STATS_PERIOD);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.stats.sample(),
                _ = self.closed() => return,
            }
        }
    }

    // ========================================
    // Receiving
    // ========================================

    async fn read_frame<R: AsyncRead + Unpin>(self: &Arc<Self>, reader: &mut R) -> Result<()> {
        let mut head = [0u8; HEADER_SIZE];
        reader.read_exact(&mut head).await?;
        let header = FrameHeader::parse(&head)?;
        let len = header.len as usize;
        self.stats.record_rx(HEADER_SIZE + len);

        let Some(kind) = header.msg_type() else {
            debug!(link = %self.name, kind = header.kind, len, "unknown frame type skipped");
            return skip(reader, len).await;
        };
        match kind {
            MsgType::UserData => self.on_user_data(reader, &header).await,
            MsgType::HeartbeatRequest | MsgType::HeartbeatReply => {
                if len > self.overlay.settings.max_frame {
                    return Err(Error::Frame(format!("heartbeat of {len} bytes")));
                }
                let Some(payload) = self.read_payload(reader, &header).await? else {
                    return Ok(());
                };
                match Heartbeat::parse(kind, &payload) {
                    Ok(Heartbeat::Request(id)) => {
                        let reply = Heartbeat::Reply(id).encode().to_vec();
                        self.try_enqueue_control(MsgType::HeartbeatReply, 0, reply);
                        Ok(())
                    }
                    Ok(Heartbeat::Reply(id)) => self.on_heartbeat_reply(id),
                    Err(e) => {
                        warn!(link = %self.name, ?kind, error = %e, "malformed heartbeat dropped");
                        Ok(())
                    }
                }
            }
            MsgType::ZoneAnnouncement => {
                let Some(payload) = self.read_payload(reader, &header).await? else {
                    return Ok(());
                };
                self.on_announcement(&payload).await
            }
            MsgType::EchoRequest => {
                if len > MAX_ECHO_REQUEST {
                    return Err(Error::Frame(format!("echo request of {len} bytes")));
                }
                let Some(payload) = self.read_payload(reader, &header).await? else {
                    return Ok(());
                };
                info!(link = %self.name, from = %String::from_utf8_lossy(&payload), "echo request");
                let mut reply = self.overlay.settings.node_name.as_bytes().to_vec();
                reply.truncate(MAX_ECHO_REPLY);
                self.try_enqueue_control(MsgType::EchoReply, 0, reply);
                Ok(())
            }
            MsgType::EchoReply => {
                if len > MAX_ECHO_REPLY {
                    return Err(Error::Frame(format!("echo reply of {len} bytes")));
                }
                let Some(payload) = self.read_payload(reader, &header).await? else {
                    return Ok(());
                };
                info!(link = %self.name, node = %String::from_utf8_lossy(&payload), "echo reply");
                Ok(())
            }
            MsgType::MultiLinkData | MsgType::CryptoData => {
                debug!(link = %self.name, ?kind, len, "reserved frame type skipped");
                skip(reader, len).await
            }
        }
    }

    /// Read and open a control payload. `None` when it cannot be decrypted;
    /// the frame has been consumed either way.
    async fn read_payload<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        header: &FrameHeader,
    ) -> Result<Option<Vec<u8>>> {
        let mut payload = vec![0u8; header.len as usize];
        reader.read_exact(&mut payload).await?;
        if let Err(e) = self.crypt.open(header.crypt, &mut payload) {
            warn!(link = %self.name, kind = header.kind, error = %e, "undecryptable frame dropped");
            return Ok(None);
        }
        Ok(Some(payload))
    }

    async fn on_user_data<R: AsyncRead + Unpin>(
        self: &Arc<Self>,
        reader: &mut R,
        header: &FrameHeader,
    ) -> Result<()> {
        let len = header.len as usize;
        let settings = &self.overlay.settings;
        if len < settings.min_frame || len > settings.max_frame {
            return Err(Error::Frame(format!(
                "user data of {} bytes outside [{}, {}]",
                len, settings.min_frame, settings.max_frame
            )));
        }
        let mut buf = self.overlay.pool.acquire();
        reader.read_exact(buf.reserve_tail(len)?).await?;

        if !self.is_valid() {
            trace!(link = %self.name, "user data before handshake dropped");
            return Ok(());
        }
        if let Err(e) = self.crypt.open(header.crypt, buf.data_mut()) {
            warn!(link = %self.name, error = %e, "undecryptable frame dropped");
            return Ok(());
        }
        buf.set_zone(header.zone);
        self.forward(buf).await;
        Ok(())
    }

    async fn forward(self: &Arc<Self>, buf: PacketBuf) {
        if let Some(backup) = self.backup() {
            backup.receive(self, buf).await;
            return;
        }
        let zone = buf.zone();
        let Some((fdb, port)) = self.memberships.get(zone) else {
            trace!(link = %self.name, zone, "frame for a zone not joined");
            return;
        };
        forward_frame(&fdb, port, self.overlay.conntrack.as_ref(), buf).await;
    }

    fn on_heartbeat_reply(&self, id: u16) -> Result<()> {
        let mut hb = self.heartbeat_state();
        if hb.id != 0 && id == hb.id {
            if let Some(sent_at) = hb.sent_at {
                let delay = sent_at.elapsed();
                hb.delay = delay;
                hb.delay_sum += delay;
                hb.delay_avg = hb.delay_sum / u32::from(id);
            }
            drop(hb);
            if !self.valid.swap(true, Ordering::AcqRel) {
                info!(link = %self.name, "link is up");
            }
            Ok(())
        } else if hb.id == 1 {
            Err(Error::Handshake(format!(
                "first heartbeat answered with id {id}"
            )))
        } else {
            debug!(link = %self.name, id, expected = hb.id, "stale heartbeat reply");
            Ok(())
        }
    }
}

async fn skip<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<()> {
    let copied = tokio::io::copy(&mut reader.take(len as u64), &mut tokio::io::sink()).await?;
    if copied < len as u64 {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

impl Port for Link {
    fn send(&self, pkt: SharedPacket) -> PortFuture<'_> {
        Box::pin(self.send_data(pkt))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl Uplink for Link {
    fn uplink_name(&self) -> String {
        self.name.clone()
    }

    fn memberships(&self) -> &Memberships {
        &self.memberships
    }

    fn is_closed(&self) -> bool {
        Link::is_closed(self)
    }

    fn as_port(self: Arc<Self>) -> Arc<dyn Port> {
        self
    }

    fn announce(&self) -> PortFuture<'_> {
        Box::pin(self.report_zones())
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("valid", &self.is_valid())
            .field("closed", &self.is_closed())
            .finish()
    }
}
