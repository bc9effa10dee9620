//! Packet buffers shared between links, the FDB and conntrack

mod pool;

pub use pool::{
    ref_count, PacketBuf, PacketPool, SharedPacket, DEFAULT_BUF_SIZE, DEFAULT_MAX_CACHED,
};
