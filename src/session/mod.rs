//! Session layer: links between overlay nodes
//!
//! Nodes exchange length-prefixed frames over TCP. Each connection is a
//! [`Link`] that pumps user data into the zone FDBs, keeps itself alive with
//! heartbeats and keeps its zone memberships in line with announcements.

pub mod backup;
pub mod crypto;
pub mod device;
pub mod dialer;
pub mod frame;
pub mod link;
pub mod membership;
pub mod overlay;

pub use backup::BackupLink;
pub use crypto::{BlockCrypt, CipherId, CryptoRegistry, LinkCrypt, NoneCrypt, XorCrypt};
pub use device::{ChannelDevice, Device, DeviceHandle, DeviceLink};
pub use dialer::{run_backup, run_master, serve, Dialer};
pub use frame::{FrameHeader, Heartbeat, MsgType};
pub use link::{Link, LinkRole, LinkSnapshot};
pub use membership::Memberships;
pub use overlay::{
    HeartbeatSettings, MasterSet, Overlay, OverlaySnapshot, SessionSettings, Uplink,
};
