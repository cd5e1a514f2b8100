//! # ccache
//!
//! A caching HTTP server for static files and resized images.
//!
//! Every network worker thread owns a private [`SlaveCache`]. A miss in a
//! slave is forwarded to the single [`Coordinator`], which keeps one
//! reference-counted [`SharedObject`] per key and makes sure at most one
//! background job is in flight for it, however many workers ask at once.
//! Disk reads, image resizing and file removal run on the
//! [`BackgroundJobPool`] so no network thread ever blocks on I/O.
//!
//! ```text
//!  ┌──────────┐   Request    ┌─────────────┐   BackgroundJob   ┌──────────────┐
//!  │ worker 0 │ ───────────▶ │             │ ────────────────▶ │  bio thread  │
//!  │  slave   │ ◀─────────── │ coordinator │ ◀──────────────── │  (per-thread │
//!  └──────────┘  Fulfilled   │  (objects,  │     result        │ job + result │
//!  ┌──────────┐   Release    │  refcounts) │                   │    queues)   │
//!  │ worker N │ ───────────▶ │             │                   └──────────────┘
//!  └──────────┘              └─────────────┘
//! ```
//!
//! Every arrow is a single-producer single-consumer [`safe_queue`]; the
//! coordinator's table is touched by the coordinator thread only.
//!
//! ## Keys
//!
//! Keys are request URIs. `/static/<path>` serves `<source_dir>/<path>`,
//! `/zoom/<file>?w=..&h=..&c=..&q=..` serves a resized JPEG of
//! `<source_dir>/<file>` (generated once, then kept on disk), `/status`
//! serves a text report and `/favicon.ico` is an alias of
//! `/static/favicon.ico`. Anything else is answered with a cached 404.
//!
//! ## Example
//!
//! ```no_run
//! use ccache::config::Config;
//! use ccache::server::Server;
//!
//! # fn main() -> ccache::Result<()> {
//! let config = Config::from_toml(
//!     r#"
//!     [server]
//!     listen = "127.0.0.1:8080"
//!
//!     [storage]
//!     source_dir = "/srv/images"
//!     "#,
//! )?;
//! let shutdown = ccache::signal::install_signal_handler()?;
//! Server::bind(&config)?.run(shutdown)?;
//! # Ok(())
//! # }
//! ```

#[cfg(test)]
extern crate scoped_threadpool;

/// Doubly linked list used for the slave access order.
///
/// **Note**: internal infrastructure. It exposes raw node pointers whose
/// validity is maintained by the owning cache.
pub(crate) mod list;

/// Lock-free single-producer single-consumer queue.
pub mod safe_queue;

/// Byte-string cache keys.
pub mod key;

/// Slave cache entries and the identifiers they carry.
pub mod entry;

/// Messages exchanged between slaves and the coordinator.
pub mod message;

/// Reference-counted objects owned by the coordinator.
pub mod object;

/// Per-worker LRU cache.
pub mod slave;

/// The coordinator thread and its object table.
pub mod master;

/// Background I/O job pool.
pub mod bio;

/// Image resizing and the on-disk variant store.
pub mod zoom;

/// File helpers for background jobs.
pub mod ufile;

/// HTTP framing.
pub mod http;

/// Per-connection blocking state.
pub mod client;

/// TCP front end.
pub mod server;

/// Configuration structures.
pub mod config;

/// Counters and the reporting trait shared by all components.
pub mod metrics;

/// Tracing subscriber setup.
pub mod logging;

/// Crate error type.
pub mod error;

/// SIGINT/SIGTERM handling.
pub mod signal;

pub use bio::{BackgroundJob, BackgroundJobPool, JobKind, JobOutcome, JobSubmitter};
pub use entry::{CacheEntry, ClientId, EntryId};
pub use error::{Error, Result};
pub use key::Key;
pub use master::{Coordinator, CoordinatorHandle, CoordinatorThread};
pub use object::{ObjectState, SharedObject};
pub use slave::{SlaveCache, SlaveWaker};
