//! Wire formats the overlay inspects
//!
//! Every accessor reads or writes big-endian fields at fixed offsets of a
//! borrowed byte slice.

pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod ipv4;
pub mod tcp;
pub mod types;
pub mod udp;

pub use types::*;
