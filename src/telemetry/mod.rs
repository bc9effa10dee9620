//! Telemetry module for logging and metrics.
//!
//! Provides:
//! - Logging configuration and initialization
//! - Per-link traffic statistics

mod logging;
mod metrics;

pub use logging::{init_logging, is_valid_level, LogConfig, LogFormat};
pub use metrics::{Counter, LinkStats, LinkStatsSnapshot, MetricsRegistry};
