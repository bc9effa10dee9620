//! Outbound dialing, reconnect loops and the peer listener

use super::backup::BackupLink;
use super::link::{Link, LinkRole};
use super::overlay::{Overlay, Uplink};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

/// Dials a fixed target list until one answers.
#[derive(Debug, Clone)]
pub struct Dialer {
    targets: Vec<String>,
    timeout: Duration,
    retry: Duration,
}

impl Dialer {
    pub fn new(targets: Vec<String>, timeout: Duration, retry: Duration) -> Self {
        Self {
            targets,
            timeout,
            retry,
        }
    }

    pub fn from_overlay(overlay: &Overlay, targets: Vec<String>) -> Self {
        let settings = &overlay.settings;
        Self::new(targets, settings.dial_timeout, settings.reconnect_delay)
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Try each target in turn, sleeping `retry` after a full failed round.
    /// Never gives up.
    pub async fn connect(&self) -> (TcpStream, String) {
        loop {
            for target in &self.targets {
                match time::timeout(self.timeout, TcpStream::connect(target.as_str())).await {
                    Ok(Ok(stream)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(target = %target, error = %e, "cannot set TCP_NODELAY");
                        }
                        return (stream, target.clone());
                    }
                    Ok(Err(e)) => warn!(target = %target, error = %e, "dial failed"),
                    Err(_) => warn!(target = %target, timeout = ?self.timeout, "dial timed out"),
                }
            }
            time::sleep(self.retry).await;
        }
    }
}

/// Keep one master link to `addr` up for as long as the task runs.
pub async fn run_master(overlay: Arc<Overlay>, addr: String) {
    let dialer = Dialer::from_overlay(&overlay, vec![addr]);
    loop {
        let (stream, target) = dialer.connect().await;
        let link = Link::establish(&overlay, stream, LinkRole::Master, format!("master:{target}"));
        let uplink: Arc<dyn Uplink> = Arc::clone(&link) as Arc<dyn Uplink>;
        overlay.masters.add(Arc::clone(&uplink));
        link.join_all();
        if let Err(e) = link.report_zones().await {
            debug!(link = %link.name(), error = %e, "initial announcement failed");
        }

        link.closed().await;
        overlay.masters.remove(&uplink);
        info!(link = %link.name(), "master link lost, reconnecting");
        time::sleep(overlay.settings.reconnect_delay).await;
    }
}

/// One aggregated backup uplink over `addrs`, a slave connection per address.
pub async fn run_backup(overlay: Arc<Overlay>, addrs: Vec<String>) {
    let backup = BackupLink::new(&overlay, format!("backup:{}", addrs.join(",")));
    let uplink: Arc<dyn Uplink> = Arc::clone(&backup) as Arc<dyn Uplink>;
    overlay.masters.add(uplink);
    backup.join_all();

    let mut tasks = JoinSet::new();
    tasks.spawn(Arc::clone(&backup).supervise());
    for addr in addrs {
        tasks.spawn(run_slave(Arc::clone(&overlay), Arc::clone(&backup), addr));
    }
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(backup = %backup.name(), error = %e, "backup task failed");
        }
    }
}

async fn run_slave(overlay: Arc<Overlay>, backup: Arc<BackupLink>, addr: String) {
    let dialer = Dialer::from_overlay(&overlay, vec![addr]);
    loop {
        let (stream, target) = dialer.connect().await;
        let slave = Link::establish(&overlay, stream, LinkRole::Slave, format!("slave:{target}"));
        backup.add_slave(&slave);
        if let Err(e) = slave.report_zones().await {
            debug!(link = %slave.name(), error = %e, "initial announcement failed");
        }

        slave.closed().await;
        backup.remove_slave(&slave);
        info!(link = %slave.name(), "slave link lost, reconnecting");
        time::sleep(overlay.settings.reconnect_delay).await;
    }
}

/// Accept peer links on `listener` until it fails.
pub async fn serve(overlay: Arc<Overlay>, listener: TcpListener) -> Result<()> {
    if let Ok(local) = listener.local_addr() {
        info!(listen = %local, "accepting peer links");
    }
    loop {
        let (stream, remote) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %remote, error = %e, "cannot set TCP_NODELAY");
        }
        let link = Link::establish(&overlay, stream, LinkRole::Peer, format!("peer:{remote}"));
        debug!(link = %link.name(), "peer accepted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_skips_dead_target() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap().to_string();

        let dialer = Dialer::new(
            vec![dead_addr, live_addr.clone()],
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        let (_stream, target) = dialer.connect().await;
        assert_eq!(target, live_addr);
        assert!(live.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_retries_until_listener_appears() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let dialer = Dialer::new(
            vec![addr.to_string()],
            Duration::from_secs(1),
            Duration::from_millis(20),
        );
        let dial = tokio::spawn(async move { dialer.connect().await.1 });
        time::sleep(Duration::from_millis(50)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let accepted = tokio::spawn(async move { listener.accept().await.is_ok() });

        assert_eq!(dial.await.unwrap(), addr.to_string());
        assert!(accepted.await.unwrap());
    }
}
