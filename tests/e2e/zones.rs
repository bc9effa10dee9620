//! Multi-node zone scenarios over loopback TCP
//!
//! Topology:
//! ```text
//!            ┌───────────────┐
//!            │ hub (dynamic) │
//!            └───────────────┘
//!              ▲     ▲     ▲
//!        master│     │     │master
//!   ┌──────────┴┐ ┌──┴────────┐ ┌┴──────────┐
//!   │ edge-a z7 │ │ edge-b z7 │ │ edge-c z8 │
//!   └───────────┘ └───────────┘ └───────────┘
//! ```

use super::common::*;
use std::sync::Arc;
use tokio::net::TcpListener;
use vnet::session::{run_master, serve, ChannelDevice, DeviceHandle, DeviceLink, Overlay};

async fn hub() -> (Arc<Overlay>, String) {
    let hub = node("hub", &[]);
    hub.spawn_background();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(serve(Arc::clone(&hub), listener));
    (hub, addr)
}

async fn edge(name: &str, zone: u16, hub: &str) -> (Arc<Overlay>, DeviceHandle) {
    let edge = node(name, &[zone]);
    edge.spawn_background();
    let (device, handle) = ChannelDevice::pair(format!("{name}-tap"), 16);
    DeviceLink::attach(&edge, device, zone).await.unwrap();
    tokio::spawn(run_master(Arc::clone(&edge), hub.to_string()));
    (edge, handle)
}

fn zone_ports(overlay: &Overlay, zone: u16) -> usize {
    overlay.fdbs.get(zone).map_or(0, |fdb| fdb.port_count())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_stay_within_zone() {
    let (hub, addr) = hub().await;
    let (_a, mut tap_a) = edge("edge-a", 7, &addr).await;
    let (_b, mut tap_b) = edge("edge-b", 7, &addr).await;
    let (_c, mut tap_c) = edge("edge-c", 8, &addr).await;

    assert!(wait_for(|| zone_ports(&hub, 7) == 2 && zone_ports(&hub, 8) == 1).await);
    assert_eq!(hub.fdbs.ids(), vec![7, 8]);

    // broadcast from a reaches b through the hub
    let hello = frame(1, BROADCAST, 1);
    assert_eq!(deliver(&tap_a, &mut tap_b, &hello).await, hello);
    drain(&mut [&mut tap_a, &mut tap_b, &mut tap_c]).await;

    // b answers a by unicast; c in zone 8 never sees zone 7 traffic
    let reply = frame(2, mac(1), 2);
    assert_eq!(deliver(&tap_b, &mut tap_a, &reply).await, reply);
    let flood = frame(1, BROADCAST, 3);
    tap_a.inject(flood.clone()).await.unwrap();
    assert_eq!(recv_within(&mut tap_b, 1000).await.unwrap(), flood);
    assert!(recv_within(&mut tap_c, 200).await.is_none());

    // the hub learned both hosts of zone 7 on distinct ports
    let snapshot = hub.snapshot();
    let zone7 = snapshot.zones.iter().find(|z| z.zone == 7).unwrap();
    let learned: Vec<_> = zone7.ports.iter().filter(|p| !p.macs.is_empty()).collect();
    assert_eq!(learned.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unicast_not_flooded_once_learned() {
    let (hub, addr) = hub().await;
    let (_a, mut tap_a) = edge("edge-a", 7, &addr).await;
    let (_b, mut tap_b) = edge("edge-b", 7, &addr).await;
    let (_d, mut tap_d) = edge("edge-d", 7, &addr).await;
    assert!(wait_for(|| zone_ports(&hub, 7) == 3).await);

    let hello_b = frame(2, BROADCAST, 1);
    deliver(&tap_b, &mut tap_a, &hello_b).await;
    let hello_d = frame(4, BROADCAST, 1);
    deliver(&tap_d, &mut tap_a, &hello_d).await;
    drain(&mut [&mut tap_a, &mut tap_b, &mut tap_d]).await;

    let to_b = frame(1, mac(2), 2);
    tap_a.inject(to_b.clone()).await.unwrap();
    assert_eq!(recv_within(&mut tap_b, 1000).await.unwrap(), to_b);
    assert!(recv_within(&mut tap_d, 200).await.is_none());
}
