//! Backup uplink failover
//!
//! An edge reaches zone 7 through two hubs; only the active slave carries
//! frames, and losing it moves traffic to the survivor.

use super::common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use vnet::session::{
    serve, BackupLink, ChannelDevice, DeviceHandle, DeviceLink, Link, LinkRole, Overlay, Uplink,
};

async fn hub(name: &str) -> (Arc<Overlay>, String, DeviceHandle) {
    let hub = node(name, &[7]);
    let (device, handle) = ChannelDevice::pair(format!("{name}-tap"), 16);
    DeviceLink::attach(&hub, device, 7).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(serve(Arc::clone(&hub), listener));
    (hub, addr, handle)
}

async fn slave(edge: &Arc<Overlay>, backup: &Arc<BackupLink>, addr: &str) -> Arc<Link> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let link = Link::establish(edge, stream, LinkRole::Slave, format!("slave:{addr}"));
    backup.add_slave(&link);
    link.report_zones().await.unwrap();
    link
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_active_slave_carries_traffic_and_fails_over() {
    let (hub1, addr1, mut tap1) = hub("hub-1").await;
    let (hub2, addr2, mut tap2) = hub("hub-2").await;

    let edge = node("edge", &[7]);
    let (device, mut tap_e) = ChannelDevice::pair("edge-tap", 16);
    DeviceLink::attach(&edge, device, 7).await.unwrap();
    let backup = BackupLink::new(&edge, "backup:hubs");
    edge.masters.add(Arc::clone(&backup) as Arc<dyn Uplink>);
    backup.join_all();
    tokio::spawn(Arc::clone(&backup).supervise());

    let s1 = slave(&edge, &backup, &addr1).await;
    let s2 = slave(&edge, &backup, &addr2).await;
    assert!(wait_for(|| hub1.fdbs.get(7).unwrap().port_count() == 2).await);
    assert!(wait_for(|| hub2.fdbs.get(7).unwrap().port_count() == 2).await);
    assert!(wait_for(|| s1.is_valid() && s2.is_valid() && backup.active().is_some()).await);

    // edge traffic leaves through the active slave only
    let active = backup.active().unwrap();
    let (mut on_active, mut on_standby, standby) = if Arc::ptr_eq(&active, &s1) {
        (tap1, tap2, s2)
    } else {
        (tap2, tap1, s1)
    };
    let hello = frame(1, BROADCAST, 1);
    assert_eq!(deliver(&tap_e, &mut on_active, &hello).await, hello);
    assert!(recv_within(&mut on_standby, 200).await.is_none());

    // user data read by the standby slave is ignored
    on_standby.inject(frame(3, BROADCAST, 2)).await.unwrap();
    assert!(recv_within(&mut tap_e, 300).await.is_none());

    let from_active = frame(2, BROADCAST, 3);
    on_active.inject(from_active.clone()).await.unwrap();
    assert_eq!(recv_within(&mut tap_e, 1000).await.unwrap(), from_active);
    drain(&mut [&mut tap_e, &mut on_active, &mut on_standby]).await;

    // losing the active slave promotes the other one
    active.close();
    backup.remove_slave(&active);
    assert!(wait_for(|| backup.active().is_some_and(|a| Arc::ptr_eq(&a, &standby))).await);
    let again = frame(1, BROADCAST, 4);
    assert_eq!(deliver(&tap_e, &mut on_standby, &again).await, again);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backup.slave_count(), 1);
}

#[tokio::test]
async fn test_no_slave_counts_drops() {
    let edge = node("edge", &[7]);
    let (device, tap_e) = ChannelDevice::pair("edge-tap", 16);
    DeviceLink::attach(&edge, device, 7).await.unwrap();
    let backup = BackupLink::new(&edge, "backup:none");
    backup.join_all();
    assert!(backup.active().is_none());

    tap_e.inject(frame(1, BROADCAST, 1)).await.unwrap();
    assert!(wait_for(|| backup.stats().drop_bytes.get() == 60).await);
    assert_eq!(backup.stats().tx_bytes.get(), 0);
}
