//! Coarse timers for connection tracking and reassembly timeouts

mod wheel;

pub use wheel::{TimerCallback, TimerHandle, TimerWheel, DEFAULT_TICK};
