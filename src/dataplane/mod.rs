//! Data plane components
//!
//! Per-zone learning bridge, IPv4 reassembly, connection tracking with UDP
//! source NAT, and the pipeline that ties them together for each frame.

pub mod conntrack;
pub mod fdb;
pub mod forwarder;
pub mod fragment;
pub mod nat;
pub mod port_pool;

pub use conntrack::{
    Conntrack, ConntrackRegistry, ConntrackSnapshot, CtStatus, Direction, Tuple, Verdict,
    ZoneConntrack,
};
pub use fdb::{
    DropReason, FdbRegistry, FdbSnapshot, L2ForwardAction, Port, PortFuture, ZoneFdb,
};
pub use forwarder::{forward_frame, ForwardOutcome};
pub use fragment::{FragKey, FragmentTable, Reassembly};
pub use port_pool::{PortId, PortPool, MAX_PORTS};
