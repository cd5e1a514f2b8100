//! Background job pool metrics.
//!
//! Pool threads update these concurrently, so the live counters are
//! atomics and reports are taken as snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::CacheMetrics;

/// Live counters shared by all pool threads.
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub(crate) jobs_submitted: AtomicU64,
    pub(crate) jobs_completed: AtomicU64,
    pub(crate) files_read: AtomicU64,
    pub(crate) files_written: AtomicU64,
    pub(crate) files_removed: AtomicU64,
    pub(crate) images_zoomed: AtomicU64,
    pub(crate) unsafe_paths: AtomicU64,
    pub(crate) not_found: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a consistent-enough snapshot of the counters.
    pub fn snapshot(&self) -> PoolMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolMetrics {
            jobs_submitted: load(&self.jobs_submitted),
            jobs_completed: load(&self.jobs_completed),
            files_read: load(&self.files_read),
            files_written: load(&self.files_written),
            files_removed: load(&self.files_removed),
            images_zoomed: load(&self.images_zoomed),
            unsafe_paths: load(&self.unsafe_paths),
            not_found: load(&self.not_found),
        }
    }
}

/// A snapshot of [`PoolCounters`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Jobs handed to the pool.
    pub jobs_submitted: u64,
    /// Jobs fully processed, including removals.
    pub jobs_completed: u64,
    /// Files served from disk (static files and existing zoom variants).
    pub files_read: u64,
    /// Zoom variants written to disk.
    pub files_written: u64,
    /// Variants removed to honour the disk quota.
    pub files_removed: u64,
    /// Images resized.
    pub images_zoomed: u64,
    /// Jobs rejected because of an unsafe path.
    pub unsafe_paths: u64,
    /// Read jobs that produced no payload.
    pub not_found: u64,
}

impl CacheMetrics for PoolMetrics {
    fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("jobs_submitted".to_string(), self.jobs_submitted as f64);
        metrics.insert("jobs_completed".to_string(), self.jobs_completed as f64);
        metrics.insert("files_read".to_string(), self.files_read as f64);
        metrics.insert("files_written".to_string(), self.files_written as f64);
        metrics.insert("files_removed".to_string(), self.files_removed as f64);
        metrics.insert("images_zoomed".to_string(), self.images_zoomed as f64);
        metrics.insert("unsafe_paths".to_string(), self.unsafe_paths as f64);
        metrics.insert("not_found".to_string(), self.not_found as f64);
        metrics
    }

    fn component_name(&self) -> &'static str {
        "bio"
    }
}
