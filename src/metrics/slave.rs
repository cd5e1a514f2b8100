//! Slave cache metrics.

use std::collections::BTreeMap;

use super::{CacheMetrics, CoreCacheMetrics};

/// Counters kept by one [`SlaveCache`](crate::slave::SlaveCache).
#[derive(Debug, Default, Clone)]
pub struct SlaveCacheMetrics {
    /// Lookup counters.
    pub core: CoreCacheMetrics,

    /// Lookups that found an entry still waiting for the coordinator.
    pub pending_hits: u64,

    /// `Release` messages sent to the coordinator.
    pub releases_sent: u64,

    /// `Fulfilled` messages applied to a pending entry.
    pub fulfilled: u64,

    /// `Fulfilled` messages whose entry no longer existed.
    pub stale_fulfilled: u64,

    /// Current number of entries.
    pub entries: u64,
}

impl SlaveCacheMetrics {
    /// Converts the counters to a report map.
    pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
        let mut metrics = self.core.to_btreemap();
        metrics.insert("pending_hits".to_string(), self.pending_hits as f64);
        metrics.insert("releases_sent".to_string(), self.releases_sent as f64);
        metrics.insert("fulfilled".to_string(), self.fulfilled as f64);
        metrics.insert("stale_fulfilled".to_string(), self.stale_fulfilled as f64);
        metrics.insert("entries".to_string(), self.entries as f64);
        metrics
    }
}

impl CacheMetrics for SlaveCacheMetrics {
    fn metrics(&self) -> BTreeMap<String, f64> {
        self.to_btreemap()
    }

    fn component_name(&self) -> &'static str {
        "slave"
    }
}
