//! End-to-end tests: whole nodes wired together in one process
//!
//! Run with: cargo test --test e2e

mod backup;
mod common;
mod session;
mod zones;
