//! Link behaviour seen from the wire
//!
//! The node under test runs a real link over an in-memory duplex stream;
//! the other end is driven byte by byte.

use super::common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use vnet::session::frame::{Heartbeat, MsgType};
use vnet::session::{ChannelDevice, DeviceHandle, DeviceLink, Link, LinkRole, Overlay};

fn connect(overlay: &Arc<Overlay>) -> (Arc<Link>, RawPeer) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let link = Link::establish(overlay, near, LinkRole::Peer, "peer:raw");
    (link, RawPeer::new(far))
}

async fn attach(overlay: &Arc<Overlay>, zone: u16) -> DeviceHandle {
    let (device, handle) = ChannelDevice::pair("tap0", 16);
    let link = DeviceLink::attach(overlay, device, zone).await.unwrap();
    // the link is kept alive by its rx task and its FDB port
    drop(link);
    handle
}

async fn closes(link: &Link) -> bool {
    timeout(Duration::from_secs(10), link.closed()).await.is_ok()
}

#[tokio::test]
async fn test_handshake_makes_link_valid() {
    let overlay = node("hub", &[7]);
    let (link, mut raw) = connect(&overlay);
    assert!(!link.is_valid());

    let id = raw.answer_heartbeat(None).await;
    assert_eq!(id, 1);
    assert!(wait_for(|| link.is_valid()).await);
    assert!(!link.is_closed());
}

#[tokio::test]
async fn test_wrong_first_heartbeat_closes_link() {
    let overlay = node("hub", &[7]);
    let (link, mut raw) = connect(&overlay);

    raw.answer_heartbeat(Some(9)).await;
    assert!(closes(&link).await);
    assert!(!link.is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_dropped() {
    let overlay = node("hub", &[7]);
    let (link, _raw) = connect(&overlay);
    assert!(closes(&link).await);
    assert!(!link.is_valid());
}

#[tokio::test]
async fn test_peer_heartbeat_request_answered() {
    let overlay = node("hub", &[7]);
    let (_link, mut raw) = connect(&overlay);

    let request = Heartbeat::Request(42).encode();
    raw.send(MsgType::HeartbeatRequest, 0, &request).await;
    let (_, payload) = raw.recv_kind(MsgType::HeartbeatReply).await;
    assert_eq!(
        Heartbeat::parse(MsgType::HeartbeatReply, &payload).unwrap(),
        Heartbeat::Reply(42)
    );
}

#[tokio::test]
async fn test_echo_request_answered_with_node_name() {
    let overlay = node("hub-1", &[7]);
    let (_link, mut raw) = connect(&overlay);

    raw.send(MsgType::EchoRequest, 0, b"edge-1").await;
    let (_, payload) = raw.recv_kind(MsgType::EchoReply).await;
    assert_eq!(payload, b"hub-1");
}

#[tokio::test]
async fn test_unknown_frame_type_skipped() {
    let overlay = node("hub", &[7]);
    let (link, mut raw) = connect(&overlay);

    raw.send_raw(0x42, 0, &[0xaa; 10]).await;
    raw.send(MsgType::MultiLinkData, 0, &[0xbb; 20]).await;
    raw.send(MsgType::EchoRequest, 0, b"still there").await;
    let (_, payload) = raw.recv_kind(MsgType::EchoReply).await;
    assert_eq!(payload, b"hub");
    assert!(!link.is_closed());
}

#[tokio::test]
async fn test_oversized_echo_request_closes_link() {
    let overlay = node("hub", &[7]);
    let (link, mut raw) = connect(&overlay);

    raw.send(MsgType::EchoRequest, 0, &[b'x'; 33]).await;
    assert!(closes(&link).await);
}

#[tokio::test]
async fn test_announcement_joins_zones_dynamically() {
    let overlay = node("hub", &[]);
    let (link, mut raw) = connect(&overlay);

    raw.send(MsgType::ZoneAnnouncement, 0, &[0, 5, 0, 6]).await;
    assert!(wait_for(|| overlay.fdbs.ids() == vec![5, 6]).await);
    assert_eq!(link.memberships().ids(), vec![5, 6]);

    raw.send(MsgType::ZoneAnnouncement, 0, &[0, 6]).await;
    assert!(wait_for(|| overlay.fdbs.ids() == vec![6]).await);

    drop(raw);
    assert!(closes(&link).await);
    assert!(wait_for(|| overlay.fdbs.ids().is_empty()).await);
}

#[tokio::test]
async fn test_announcement_limited_to_static_zones() {
    let overlay = node("hub", &[7, 8]);
    let (link, mut raw) = connect(&overlay);

    raw.send(MsgType::ZoneAnnouncement, 0, &[0, 7, 0, 9]).await;
    assert!(wait_for(|| link.memberships().ids() == vec![7]).await);
    assert_eq!(overlay.fdbs.ids(), vec![7, 8]);

    drop(raw);
    assert!(closes(&link).await);
    assert_eq!(overlay.fdbs.ids(), vec![7, 8]);
    assert_eq!(overlay.fdbs.get(7).unwrap().port_count(), 0);
}

#[tokio::test]
async fn test_odd_announcement_ignored() {
    let overlay = node("hub", &[7]);
    let (link, mut raw) = connect(&overlay);

    raw.send(MsgType::ZoneAnnouncement, 0, &[0, 7, 1]).await;
    raw.send(MsgType::EchoRequest, 0, b"ping").await;
    raw.recv_kind(MsgType::EchoReply).await;
    assert!(link.memberships().is_empty());

    raw.send(MsgType::ZoneAnnouncement, 0, &[0, 7]).await;
    assert!(wait_for(|| link.memberships().contains(7)).await);
    assert!(!link.is_closed());
}

#[tokio::test]
async fn test_bad_heartbeat_after_handshake_keeps_link() {
    let overlay = node("hub", &[7]);
    let (link, mut raw) = connect(&overlay);
    raw.answer_heartbeat(None).await;
    assert!(wait_for(|| link.is_valid()).await);

    let mut garbage = vec![0, 5];
    garbage.extend_from_slice(b"GarbageTag!!");
    raw.send(MsgType::HeartbeatRequest, 0, &garbage).await;
    raw.send(MsgType::EchoRequest, 0, b"still up").await;
    let (_, payload) = raw.recv_kind(MsgType::EchoReply).await;
    assert_eq!(payload, b"hub");
    assert!(!link.is_closed());
}

#[tokio::test]
async fn test_user_data_out_of_bounds_closes_link() {
    let overlay = node("hub", &[7]);
    let (link, mut raw) = connect(&overlay);

    raw.send(MsgType::UserData, 7, &[0u8; 20]).await;
    assert!(closes(&link).await);
}

#[tokio::test]
async fn test_user_data_before_handshake_dropped() {
    let overlay = node("hub", &[7]);
    let mut tap = attach(&overlay, 7).await;
    let (link, mut raw) = connect(&overlay);

    raw.send(MsgType::ZoneAnnouncement, 0, &[0, 7]).await;
    assert!(wait_for(|| link.memberships().contains(7)).await);

    raw.send(MsgType::UserData, 7, &frame(1, BROADCAST, 1)).await;
    assert!(recv_within(&mut tap, 200).await.is_none());

    raw.answer_heartbeat(None).await;
    assert!(wait_for(|| link.is_valid()).await);
    let sent = frame(1, BROADCAST, 2);
    raw.send(MsgType::UserData, 7, &sent).await;
    assert_eq!(recv_within(&mut tap, 1000).await.unwrap(), sent);

    // the tap answers host 1, which was learned behind the link
    let reply = frame(9, mac(1), 3);
    tap.inject(reply.clone()).await.unwrap();
    let (header, payload) = raw.recv_kind(MsgType::UserData).await;
    assert_eq!(header.zone, 7);
    assert_eq!(payload, reply);
}

#[tokio::test]
async fn test_user_data_for_unjoined_zone_ignored() {
    let overlay = node("hub", &[7, 8]);
    let mut tap = attach(&overlay, 8).await;
    let (link, mut raw) = connect(&overlay);

    raw.send(MsgType::ZoneAnnouncement, 0, &[0, 7]).await;
    raw.answer_heartbeat(None).await;
    assert!(wait_for(|| link.is_valid() && link.memberships().contains(7)).await);

    raw.send(MsgType::UserData, 8, &frame(1, BROADCAST, 1)).await;
    assert!(recv_within(&mut tap, 200).await.is_none());
    assert!(!link.is_closed());
}
