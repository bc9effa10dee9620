//! Shared helpers: test frames, nodes, and a hand-driven wire peer

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{sleep, timeout};
use vnet::protocol::ethernet::FrameBuilder;
use vnet::protocol::{EtherType, MacAddr, ZoneId};
use vnet::session::frame::{FrameHeader, Heartbeat, MsgType, HEADER_SIZE};
use vnet::session::{DeviceHandle, Overlay, SessionSettings};

pub const BROADCAST: [u8; 6] = [0xff; 6];

pub fn mac(host: u8) -> [u8; 6] {
    [0x02, 0, 0, 0, 0, host]
}

/// A 60-byte IPv4 frame from host `src` to `dst`, tagged with `marker`.
pub fn frame(src: u8, dst: [u8; 6], marker: u8) -> Vec<u8> {
    let mut payload = [0u8; 46];
    payload[0] = 0x45;
    payload[45] = marker;
    FrameBuilder::new()
        .src_mac(MacAddr(mac(src)))
        .dst_mac(MacAddr(dst))
        .ethertype(EtherType::Ipv4)
        .payload(&payload)
        .build()
}

pub fn node(name: &str, zones: &[ZoneId]) -> Arc<Overlay> {
    let settings = SessionSettings {
        node_name: name.to_string(),
        ..SessionSettings::default()
    };
    let overlay = Overlay::new(settings).unwrap();
    Arc::new(overlay.with_static_zones(zones.iter().copied()))
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_for(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub async fn recv_within(handle: &mut DeviceHandle, ms: u64) -> Option<Vec<u8>> {
    timeout(Duration::from_millis(ms), handle.recv())
        .await
        .ok()
        .flatten()
}

/// Inject `frame` at `from` until `to` sees a frame. Links drop user data
/// until their handshake completes, so early attempts may be lost.
pub async fn deliver(from: &DeviceHandle, to: &mut DeviceHandle, frame: &[u8]) -> Vec<u8> {
    for _ in 0..50 {
        from.inject(frame.to_vec()).await.unwrap();
        if let Some(got) = recv_within(to, 100).await {
            return got;
        }
    }
    panic!("frame never delivered");
}

/// Let in-flight frames land, then discard them.
pub async fn drain(handles: &mut [&mut DeviceHandle]) {
    sleep(Duration::from_millis(150)).await;
    for handle in handles.iter_mut() {
        while handle.try_recv().is_some() {}
    }
}

/// The far end of a link, speaking the wire format by hand
pub struct RawPeer {
    stream: DuplexStream,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self { stream }
    }

    pub async fn send_raw(&mut self, kind: u8, zone: ZoneId, payload: &[u8]) {
        let header = FrameHeader {
            kind,
            len: payload.len() as u16,
            zone,
            crypt: 0,
        };
        self.stream.write_all(&header.encode()).await.unwrap();
        self.stream.write_all(payload).await.unwrap();
    }

    pub async fn send(&mut self, kind: MsgType, zone: ZoneId, payload: &[u8]) {
        self.send_raw(kind as u8, zone, payload).await;
    }

    pub async fn recv(&mut self) -> (FrameHeader, Vec<u8>) {
        let mut head = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut head).await.unwrap();
        let header = FrameHeader::parse(&head).unwrap();
        let mut payload = vec![0u8; header.len as usize];
        self.stream.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    /// Next frame of type `kind`, skipping everything else.
    pub async fn recv_kind(&mut self, kind: MsgType) -> (FrameHeader, Vec<u8>) {
        let wait = async {
            loop {
                let (header, payload) = self.recv().await;
                if header.msg_type() == Some(kind) {
                    return (header, payload);
                }
            }
        };
        timeout(Duration::from_secs(10), wait)
            .await
            .expect("expected frame never arrived")
    }

    /// Answer the link's first heartbeat request with `reply_id`, or its own
    /// id when `None`.
    pub async fn answer_heartbeat(&mut self, reply_id: Option<u16>) -> u16 {
        let (_, payload) = self.recv_kind(MsgType::HeartbeatRequest).await;
        let id = Heartbeat::parse(MsgType::HeartbeatRequest, &payload)
            .unwrap()
            .id();
        let reply = Heartbeat::Reply(reply_id.unwrap_or(id)).encode();
        self.send(MsgType::HeartbeatReply, 0, &reply).await;
        id
    }
}
