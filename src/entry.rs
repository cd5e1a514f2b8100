//! Per-worker cache entries and the identifiers they carry.

use std::fmt;

use bytes::Bytes;

use crate::key::Key;

/// Identity of one [`CacheEntry`] inside one slave cache.
///
/// Messages from the coordinator name the entry they target by id, so a
/// reply that arrives after the entry was dropped can be recognized.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    pub(crate) const fn new(raw: u64) -> Self {
        EntryId(raw)
    }

    /// Raw id value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

/// Opaque handle of a blocked client, chosen by the worker that owns it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ClientId(u64);

impl ClientId {
    /// Wraps a raw handle.
    pub const fn new(raw: u64) -> Self {
        ClientId(raw)
    }

    /// Raw handle value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A worker's local view of one cached object.
///
/// An entry is *pending* until the coordinator fulfils it and *filled*
/// afterwards. The payload is set exactly once and never changes; the bytes
/// are shared with the coordinator's object and with every other worker
/// that holds the same key.
#[derive(Debug)]
pub struct CacheEntry {
    key: Key,
    id: EntryId,
    value: Option<Bytes>,
    waiting_clients: Vec<ClientId>,
}

impl CacheEntry {
    pub(crate) fn new(key: Key, id: EntryId) -> Self {
        CacheEntry {
            key,
            id,
            value: None,
            waiting_clients: Vec::new(),
        }
    }

    /// The entry's key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The entry's id.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// The full HTTP reply, once the entry is filled.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Returns true while the coordinator has not answered yet.
    pub fn is_pending(&self) -> bool {
        self.value.is_none()
    }

    /// Clients blocked on this entry, in registration order.
    pub fn waiting_clients(&self) -> &[ClientId] {
        &self.waiting_clients
    }

    pub(crate) fn add_watcher(&mut self, client: ClientId) {
        self.waiting_clients.push(client);
    }

    pub(crate) fn remove_watcher(&mut self, client: ClientId) -> bool {
        match self.waiting_clients.iter().position(|c| *c == client) {
            Some(idx) => {
                self.waiting_clients.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Sets the payload and hands back the clients that were waiting for it.
    pub(crate) fn fill(&mut self, payload: Bytes) -> Vec<ClientId> {
        debug_assert!(self.value.is_none(), "entry {:?} filled twice", self.key);
        self.value = Some(payload);
        std::mem::take(&mut self.waiting_clients)
    }
}
