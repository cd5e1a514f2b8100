//! Front-end, storage and logging settings.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Network front end.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Number of network worker threads, each with its own slave cache.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds a client may stay idle or blocked before it is dropped.
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,
    /// Entries a worker evicts per tick while memory is over the limit.
    #[serde(default = "default_stale_batch")]
    pub stale_batch: usize,
}

impl ServerConfig {
    /// Client timeout as a `Duration`.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            client_timeout_secs: default_client_timeout_secs(),
            stale_batch: default_stale_batch(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6379))
}

fn default_workers() -> usize {
    4
}

fn default_client_timeout_secs() -> u64 {
    5
}

fn default_stale_batch() -> usize {
    16
}

/// Where files come from and where generated files go.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root for `/static/...` and for zoom source images.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    /// Scratch directory; zoom variants live in `<tmp_dir>/zoom`.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            tmp_dir: default_tmp_dir(),
        }
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output.
    #[default]
    Pretty,
    /// Single-line human readable output.
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `ccache=debug`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Prefix lines with a timestamp.
    #[serde(default = "default_true")]
    pub timestamps: bool,
    /// Include the event target (module path).
    #[serde(default)]
    pub target: bool,
    /// Include the thread name.
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
