//! Metrics collection for link statistics.
//!
//! Provides thread-safe counters for tracking per-link traffic, and a
//! registry that names every live link's statistics for export.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }
}

/// Per-link traffic statistics.
///
/// Byte counters include the 6-byte frame header. Rates are refreshed by
/// [`sample`](Self::sample), which the link calls once per second.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Bytes received.
    pub rx_bytes: Counter,
    /// Bytes transmitted.
    pub tx_bytes: Counter,
    /// Frames received.
    pub rx_frames: Counter,
    /// Frames transmitted.
    pub tx_frames: Counter,
    /// Bytes dropped on the way out.
    pub drop_bytes: Counter,
    last_rx: Counter,
    last_tx: Counter,
    rx_rate: Counter,
    tx_rate: Counter,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received frame of `bytes` bytes.
    pub fn record_rx(&self, bytes: usize) {
        self.rx_frames.inc();
        self.rx_bytes.add(bytes as u64);
    }

    /// Records a transmitted frame of `bytes` bytes.
    pub fn record_tx(&self, bytes: usize) {
        self.tx_frames.inc();
        self.tx_bytes.add(bytes as u64);
    }

    /// Records an outbound frame that had nowhere to go.
    pub fn record_drop(&self, bytes: usize) {
        self.drop_bytes.add(bytes as u64);
    }

    /// Turn the byte counts since the previous call into rates.
    pub fn sample(&self) {
        let rx = self.rx_bytes.get();
        let tx = self.tx_bytes.get();
        self.rx_rate.set(rx.saturating_sub(self.last_rx.get()));
        self.tx_rate.set(tx.saturating_sub(self.last_tx.get()));
        self.last_rx.set(rx);
        self.last_tx.set(tx);
    }

    /// Receive rate in bytes per second, as of the last sample
    pub fn rx_rate(&self) -> u64 {
        self.rx_rate.get()
    }

    /// Send rate in bytes per second, as of the last sample
    pub fn tx_rate(&self) -> u64 {
        self.tx_rate.get()
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            rx_bytes: self.rx_bytes.get(),
            tx_bytes: self.tx_bytes.get(),
            rx_frames: self.rx_frames.get(),
            tx_frames: self.tx_frames.get(),
            drop_bytes: self.drop_bytes.get(),
            rx_rate: self.rx_rate(),
            tx_rate: self.tx_rate(),
        }
    }
}

/// Point-in-time view of [`LinkStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatsSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub drop_bytes: u64,
    pub rx_rate: u64,
    pub tx_rate: u64,
}

/// Statistics of every live link, by name.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    links: RwLock<BTreeMap<String, Arc<LinkStats>>>,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a link's statistics. A link registered under the same name
    /// earlier is replaced.
    pub fn register(&self, name: &str, stats: Arc<LinkStats>) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), stats);
    }

    /// Removes a link; only if `stats` is still the registered instance.
    pub fn unregister(&self, name: &str, stats: &Arc<LinkStats>) {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        if links.get(name).is_some_and(|s| Arc::ptr_eq(s, stats)) {
            links.remove(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<LinkStats>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered link.
    pub fn links(&self) -> BTreeMap<String, LinkStatsSnapshot> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect()
    }

    /// Exports all metrics as key-value pairs.
    ///
    /// This format is designed to be easily convertible to Prometheus format
    /// in the future.
    pub fn export(&self) -> Vec<(String, u64)> {
        let links = self.links();
        let mut result = vec![("links".to_string(), links.len() as u64)];
        for (name, stats) in links {
            result.extend([
                (format!("{}_rx_bytes", name), stats.rx_bytes),
                (format!("{}_tx_bytes", name), stats.tx_bytes),
                (format!("{}_rx_frames", name), stats.rx_frames),
                (format!("{}_tx_frames", name), stats.tx_frames),
                (format!("{}_drop_bytes", name), stats.drop_bytes),
                (format!("{}_rx_rate", name), stats.rx_rate),
                (format!("{}_tx_rate", name), stats.tx_rate),
            ]);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(10);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_link_stats_record() {
        let stats = LinkStats::new();
        stats.record_rx(100);
        stats.record_rx(50);
        stats.record_tx(200);
        stats.record_drop(60);

        assert_eq!(stats.rx_frames.get(), 2);
        assert_eq!(stats.rx_bytes.get(), 150);
        assert_eq!(stats.tx_frames.get(), 1);
        assert_eq!(stats.tx_bytes.get(), 200);
        assert_eq!(stats.drop_bytes.get(), 60);
    }

    #[test]
    fn test_sample_computes_deltas() {
        let stats = LinkStats::new();
        stats.record_rx(1000);
        stats.record_tx(300);
        stats.sample();
        assert_eq!(stats.rx_rate(), 1000);
        assert_eq!(stats.tx_rate(), 300);

        stats.record_rx(250);
        stats.sample();
        assert_eq!(stats.rx_rate(), 250);
        assert_eq!(stats.tx_rate(), 0);
    }

    #[test]
    fn test_registry_register_and_export() {
        let registry = MetricsRegistry::new();
        let stats = Arc::new(LinkStats::new());
        registry.register("uplink0", stats.clone());
        stats.record_rx(64);

        let exported = registry.export();
        assert!(exported.contains(&("links".to_string(), 1)));
        assert!(exported.contains(&("uplink0_rx_bytes".to_string(), 64)));
        assert!(exported.contains(&("uplink0_rx_frames".to_string(), 1)));
    }

    #[test]
    fn test_unregister_ignores_replaced_stats() {
        let registry = MetricsRegistry::new();
        let old = Arc::new(LinkStats::new());
        let new = Arc::new(LinkStats::new());
        registry.register("peer", old.clone());
        registry.register("peer", new.clone());

        registry.unregister("peer", &old);
        assert_eq!(registry.len(), 1);
        registry.unregister("peer", &new);
        assert!(registry.is_empty());
    }
}
