//! Coordinator metrics.

use std::collections::BTreeMap;

use super::CacheMetrics;

/// Counters kept by the [`Coordinator`](crate::master::Coordinator).
#[derive(Debug, Default, Clone)]
pub struct CoordinatorMetrics {
    /// `Request` messages processed.
    pub requests: u64,

    /// Requests answered immediately from an `Ok` object.
    pub instant_hits: u64,

    /// Requests attached to an object that was already `Waiting`.
    pub coalesced_requests: u64,

    /// Background jobs submitted.
    pub jobs_submitted: u64,

    /// Job results consumed.
    pub results_processed: u64,

    /// Job results that carried no payload.
    pub not_found_results: u64,

    /// `Release` messages processed.
    pub releases: u64,

    /// Objects removed after their last slave reference went away.
    pub objects_destroyed: u64,

    /// Zoom variants written to disk by background jobs.
    pub files_written: u64,
}

impl CoordinatorMetrics {
    /// Converts the counters to a report map, adding the gauges passed in.
    pub fn to_btreemap(&self, objects: usize, memory_used: usize) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("requests".to_string(), self.requests as f64);
        metrics.insert("instant_hits".to_string(), self.instant_hits as f64);
        metrics.insert(
            "coalesced_requests".to_string(),
            self.coalesced_requests as f64,
        );
        metrics.insert("jobs_submitted".to_string(), self.jobs_submitted as f64);
        metrics.insert(
            "results_processed".to_string(),
            self.results_processed as f64,
        );
        metrics.insert(
            "not_found_results".to_string(),
            self.not_found_results as f64,
        );
        metrics.insert("releases".to_string(), self.releases as f64);
        metrics.insert(
            "objects_destroyed".to_string(),
            self.objects_destroyed as f64,
        );
        metrics.insert("files_written".to_string(), self.files_written as f64);
        metrics.insert("objects".to_string(), objects as f64);
        metrics.insert("memory_used".to_string(), memory_used as f64);
        metrics
    }
}

/// A point-in-time coordinator report.
#[derive(Debug, Clone)]
pub struct CoordinatorReport {
    pub(crate) counters: CoordinatorMetrics,
    pub(crate) objects: usize,
    pub(crate) memory_used: usize,
}

impl CacheMetrics for CoordinatorReport {
    fn metrics(&self) -> BTreeMap<String, f64> {
        self.counters.to_btreemap(self.objects, self.memory_used)
    }

    fn component_name(&self) -> &'static str {
        "master"
    }
}
