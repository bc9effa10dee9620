//! vnet - Layer-2 overlay switch
//!
//! Nodes link up over TCP and bridge Ethernet frames between members of the
//! same zone. Each zone has its own learning FDB; optional connection
//! tracking reassembles IPv4 fragments and source-NATs outbound UDP.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod timer;

pub use error::{Error, Result};
