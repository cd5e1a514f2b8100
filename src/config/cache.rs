//! Coordinator, background pool and zoom settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::deserialize_size;

/// Coordinator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// Payload bytes above which workers are asked to evict.
    #[serde(default = "default_memory_limit", deserialize_with = "deserialize_size")]
    pub memory_limit: u64,
    /// Seconds between refreshes of the `/status` report.
    #[serde(default = "default_status_refresh_secs")]
    pub status_refresh_secs: u64,
    /// Sleep after a pass that found no work.
    #[serde(default = "default_idle_sleep_micros")]
    pub idle_sleep_micros: u64,
    /// List every cached key in the status report.
    #[serde(default = "default_status_detail")]
    pub status_detail: bool,
}

impl MasterConfig {
    /// Status refresh interval.
    pub fn status_refresh(&self) -> Duration {
        Duration::from_secs(self.status_refresh_secs)
    }

    /// Idle sleep.
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_micros)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            memory_limit: default_memory_limit(),
            status_refresh_secs: default_status_refresh_secs(),
            idle_sleep_micros: default_idle_sleep_micros(),
            status_detail: default_status_detail(),
        }
    }
}

fn default_memory_limit() -> u64 {
    50 * 1024 * 1024
}

fn default_status_refresh_secs() -> u64 {
    5
}

fn default_idle_sleep_micros() -> u64 {
    1000
}

fn default_status_detail() -> bool {
    cfg!(debug_assertions)
}

/// Background job pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BioConfig {
    /// Number of pool threads.
    #[serde(default = "default_bio_threads")]
    pub threads: usize,
}

impl Default for BioConfig {
    fn default() -> Self {
        Self {
            threads: default_bio_threads(),
        }
    }
}

fn default_bio_threads() -> usize {
    4
}

/// Zoom service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ZoomConfig {
    /// Bytes of generated variants kept on disk.
    #[serde(default = "default_disk_limit", deserialize_with = "deserialize_size")]
    pub disk_limit: u64,
    /// Largest width a request may ask for.
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    /// Largest height a request may ask for.
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
}

impl Default for ZoomConfig {
    fn default() -> Self {
        Self {
            disk_limit: default_disk_limit(),
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
        }
    }
}

fn default_disk_limit() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_max_dimension() -> u32 {
    1000
}
