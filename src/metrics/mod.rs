//! Cache Metrics System
//!
//! Every long-lived component of the cache (slave caches, the coordinator,
//! the background job pool) keeps its own counters and reports them through
//! the common [`CacheMetrics`] trait.
//!
//! Reports are `BTreeMap`s so that keys always come out in the same order,
//! which keeps log lines and test assertions stable.

use std::collections::BTreeMap;

pub mod master;
pub mod pool;
pub mod slave;

pub use master::{CoordinatorMetrics, CoordinatorReport};
pub use pool::{PoolCounters, PoolMetrics};
pub use slave::SlaveCacheMetrics;

/// Counters shared by every lookup-style component.
#[derive(Debug, Default, Clone)]
pub struct CoreCacheMetrics {
    /// Total number of lookups.
    pub requests: u64,

    /// Lookups answered from a filled entry.
    pub cache_hits: u64,

    /// Bytes handed out on hits.
    pub bytes_served_from_cache: u64,

    /// Entries removed to shed memory.
    pub evictions: u64,
}

impl CoreCacheMetrics {
    /// Records a hit serving `object_size` bytes.
    pub fn record_hit(&mut self, object_size: u64) {
        self.requests += 1;
        self.cache_hits += 1;
        self.bytes_served_from_cache += object_size;
    }

    /// Records a lookup that could not be answered locally.
    pub fn record_miss(&mut self) {
        self.requests += 1;
    }

    /// Records one eviction.
    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    /// Ratio of hits to lookups, or 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        if self.requests > 0 {
            self.cache_hits as f64 / self.requests as f64
        } else {
            0.0
        }
    }

    /// Converts the counters to a report map.
    pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("cache_hits".to_string(), self.cache_hits as f64);
        metrics.insert(
            "cache_misses".to_string(),
            (self.requests - self.cache_hits) as f64,
        );
        metrics.insert("evictions".to_string(), self.evictions as f64);
        metrics.insert("requests".to_string(), self.requests as f64);
        metrics.insert("hit_rate".to_string(), self.hit_rate());
        metrics.insert(
            "bytes_served_from_cache".to_string(),
            self.bytes_served_from_cache as f64,
        );
        metrics
    }
}

/// Uniform metrics reporting for cache components.
pub trait CacheMetrics {
    /// Returns all metrics as key-value pairs in deterministic order.
    fn metrics(&self) -> BTreeMap<String, f64>;

    /// Short name of the reporting component, e.g. `"slave"`.
    fn component_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_metrics_rates() {
        let mut core = CoreCacheMetrics::default();
        assert_eq!(core.hit_rate(), 0.0);
        core.record_hit(10);
        core.record_miss();
        core.record_miss();
        core.record_hit(5);
        core.record_eviction();

        let map = core.to_btreemap();
        assert_eq!(map["requests"], 4.0);
        assert_eq!(map["cache_hits"], 2.0);
        assert_eq!(map["cache_misses"], 2.0);
        assert_eq!(map["bytes_served_from_cache"], 15.0);
        assert_eq!(map["evictions"], 1.0);
        assert_eq!(map["hit_rate"], 0.5);
    }
}
