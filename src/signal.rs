//! Signal handling for graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Installs a SIGINT/SIGTERM handler and returns the flag it raises.
///
/// A second signal while shutdown is already in progress exits the
/// process immediately.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, exiting immediately");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, shutting down");
    })?;

    Ok(shutdown)
}
