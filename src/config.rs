//! Configuration
//!
//! Every component takes its settings from a plain struct with public
//! fields. The structs are grouped into one [`Config`] that is read from a
//! TOML file; every field has a default, so an empty file (or no file at
//! all) yields a working server.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:6379"
//! workers = 4
//!
//! [storage]
//! source_dir = "/srv/images"
//! tmp_dir = "/var/tmp/ccache"
//!
//! [master]
//! memory_limit = "50MB"
//!
//! [zoom]
//! disk_limit = "10GB"
//! ```
//!
//! Sizes accept a plain byte count or a string with a `K`, `M`, `G` or `T`
//! suffix (binary multiples).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod cache;
pub mod server;

pub use cache::{BioConfig, MasterConfig, ZoomConfig};
pub use server::{LogFormat, LoggingConfig, ServerConfig, StorageConfig};

/// Complete server configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Network front end.
    #[serde(default)]
    pub server: ServerConfig,
    /// Source and scratch directories.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Coordinator.
    #[serde(default)]
    pub master: MasterConfig,
    /// Background job pool.
    #[serde(default)]
    pub bio: BioConfig,
    /// Zoom service.
    #[serde(default)]
    pub zoom: ZoomConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            return Err(Error::Config("server.workers must be at least 1".into()));
        }
        if self.bio.threads == 0 {
            return Err(Error::Config("bio.threads must be at least 1".into()));
        }
        if self.master.memory_limit == 0 {
            return Err(Error::Config("master.memory_limit must be non-zero".into()));
        }
        if self.zoom.max_width == 0 || self.zoom.max_height == 0 {
            return Err(Error::Config(
                "zoom.max_width and zoom.max_height must be non-zero".into(),
            ));
        }
        if self.server.stale_batch == 0 {
            return Err(Error::Config("server.stale_batch must be at least 1".into()));
        }
        Ok(())
    }
}

/// Deserializes a size given as a number or a string like `"64MB"`.
pub(crate) fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(u64),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parses a size string like `"64MB"`, `"4GB"` or `"1TB"` into bytes.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {num_str}"))?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(format!("unknown size suffix: {suffix}")),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("4k"), Ok(4096));
        assert_eq!(parse_size("50MB"), Ok(50 * 1024 * 1024));
        assert_eq!(parse_size(" 10 GiB "), Ok(10 << 30));
        assert_eq!(parse_size("1TB"), Ok(1 << 40));
        assert!(parse_size("").is_err());
        assert!(parse_size("12XB").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.listen.port(), 6379);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.client_timeout_secs, 5);
        assert_eq!(config.server.stale_batch, 16);
        assert_eq!(config.master.memory_limit, 50 * 1024 * 1024);
        assert_eq!(config.master.status_refresh_secs, 5);
        assert_eq!(config.master.idle_sleep_micros, 1000);
        assert_eq!(config.bio.threads, 4);
        assert_eq!(config.zoom.disk_limit, 10 << 30);
        assert_eq!(config.zoom.max_width, 1000);
        assert_eq!(config.zoom.max_height, 1000);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_sizes_as_strings_and_numbers() {
        let config = Config::from_toml(
            r#"
            [master]
            memory_limit = "1MB"

            [zoom]
            disk_limit = 2048
            "#,
        )
        .unwrap();
        assert_eq!(config.master.memory_limit, 1 << 20);
        assert_eq!(config.zoom.disk_limit, 2048);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Config::from_toml("[server]\nthreads = 3\n").unwrap_err();
        assert!(matches!(err, Error::TomlParse(_)));
    }

    #[test]
    fn test_validation() {
        let err = Config::from_toml("[bio]\nthreads = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = Config::from_toml("[server]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_serializes_back_to_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.server.listen, config.server.listen);
        assert_eq!(parsed.master.memory_limit, config.master.memory_limit);
    }
}
