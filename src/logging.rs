//! Structured logging initialization.
//!
//! `RUST_LOG`, when set, takes precedence over the configured level.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::Result;

/// Installs the global tracing subscriber described by `config`.
///
/// Fails if a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    tracing_subscriber::registry()
        .with(fmt_layer(config))
        .with(filter)
        .try_init()?;
    Ok(())
}

fn fmt_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => base.with_ansi(true).boxed(),
        (LogFormat::Pretty, false) => base.with_ansi(true).without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
    }
}
