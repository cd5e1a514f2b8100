//! Messages exchanged between slave caches and the coordinator.
//!
//! ```text
//!   SlaveCache --Request--> Coordinator      (NEW queue)
//!   SlaveCache --Release--> Coordinator      (OLD queue)
//!   Coordinator --Fulfilled--> SlaveCache    (inbox)
//! ```

use bytes::Bytes;

use crate::entry::EntryId;
use crate::key::Key;

/// A slave asks for `key` on behalf of its pending entry `entry`.
///
/// Every request takes one reference on the coordinator's object; it is
/// returned by exactly one [`Release`].
#[derive(Debug, Clone)]
pub struct Request {
    /// Key as the slave knows it.
    pub key: Key,
    /// Entry to fill once the payload is known.
    pub entry: EntryId,
}

/// A slave gives back the reference its filled entry held.
#[derive(Debug, Clone)]
pub struct Release {
    /// Key as the slave knows it.
    pub key: Key,
}

/// The coordinator answers a [`Request`].
#[derive(Debug, Clone)]
pub struct Fulfilled {
    /// Key as the slave sent it.
    pub key: Key,
    /// Entry named by the request.
    pub entry: EntryId,
    /// Complete HTTP reply.
    pub payload: Bytes,
}
