//! Configuration types

use crate::protocol::ZoneId;
use crate::telemetry::LogConfig;
use serde::Deserialize;
use std::net::Ipv4Addr;

/// Node configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub node: NodeConfig,
    pub session: SessionConfig,
    pub heartbeat: HeartbeatConfig,
    pub uplinks: Vec<UplinkConfig>,
    pub conntrack: ConntrackConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Sent back in echo replies and used in link names
    pub name: String,
    /// `host:port` to accept peer links on
    pub listen: Option<String>,
    /// Static zone set; empty means zones follow peer announcements
    pub zones: Vec<ZoneId>,
    /// Identity sent as an echo request when a link comes up
    pub echo: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "vnet".to_string(),
            listen: None,
            zones: Vec::new(),
            echo: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cipher name applied to outbound payloads
    pub crypt: String,
    /// Shared passphrase the cipher keys are derived from
    pub key: String,
    /// Outbound queue depth per link
    pub queue_size: usize,
    /// Smallest user frame accepted from a peer
    pub min_frame: usize,
    /// Largest user frame accepted from a peer
    pub max_frame: usize,
    /// Seconds
    pub dial_timeout: u64,
    /// Seconds between a link dropping and the next dial
    pub reconnect_delay: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            crypt: "none".to_string(),
            key: String::new(),
            queue_size: 1024,
            min_frame: 42,
            max_frame: 1514,
            dial_timeout: 5,
            reconnect_delay: 2,
        }
    }
}

/// Heartbeat timing, in seconds except `count`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Quiet time before probing starts
    pub idle: u64,
    /// Unanswered probes before the link is dropped
    pub count: u32,
    /// Time between probes
    pub interval: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle: 60,
            count: 3,
            interval: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UplinkMode {
    /// An independent master link per address
    #[default]
    Each,
    /// One backup link aggregating every address
    Backup,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    /// `host:port` targets
    pub addrs: Vec<String>,
    #[serde(default)]
    pub mode: UplinkMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConntrackConfig {
    pub enabled: bool,
    pub snat: Vec<SnatConfig>,
}

/// Source address used for outbound UDP flows of a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SnatConfig {
    pub zone: ZoneId,
    pub address: Ipv4Addr,
}

impl ConntrackConfig {
    pub fn snat_for(&self, zone: ZoneId) -> Option<Ipv4Addr> {
        self.snat.iter().find(|s| s.zone == zone).map(|s| s.address)
    }
}
