//! Per-worker slave cache.
//!
//! Each network worker owns one [`SlaveCache`]: a map from key to
//! [`CacheEntry`] plus an access-order list. It is touched by its worker
//! thread only, so none of its operations lock.
//!
//! A slave never produces payloads. On a miss it inserts a *pending* entry
//! and sends a [`Request`] to the coordinator; the coordinator answers with
//! a [`Fulfilled`] message in the slave's inbox, which the worker applies
//! with [`SlaveCache::process_inbox`]. Evicting a filled entry sends a
//! [`Release`] so the coordinator can drop its reference.
//!
//! ```text
//!   worker thread                         coordinator thread
//!   -------------                         ------------------
//!   find(k)  miss --- Request(k, id) --->  NEW queue
//!   process_inbox <-- Fulfilled(k, id) --  inbox
//!   delete(k)     --- Release(k) ------->  OLD queue
//! ```
//!
//! # Eviction
//!
//! A slave has no capacity of its own. The worker calls
//! [`SlaveCache::delete_stale_entries`] while the coordinator reports memory
//! pressure; entries are taken from the least recently used end. Pending
//! entries are never evicted because the coordinator still owes them a
//! reply.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use tracing::trace;

use crate::entry::{CacheEntry, ClientId, EntryId};
use crate::key::Key;
use crate::list::{Entry, List};
use crate::message::{Fulfilled, Release, Request};
use crate::metrics::{CacheMetrics, SlaveCacheMetrics};
use crate::safe_queue::{self, Consumer, Producer};

/// Wakes a worker after the coordinator pushed into its inbox.
pub trait SlaveWaker: Send + Sync {
    /// Interrupts the worker's event loop.
    fn wake(&self);
}

/// The coordinator's end of the three queues tied to one slave.
pub(crate) struct MasterLink {
    pub(crate) id: usize,
    pub(crate) requests: Consumer<Request>,
    pub(crate) releases: Consumer<Release>,
    pub(crate) inbox: Producer<Fulfilled>,
    waker: Option<Arc<dyn SlaveWaker>>,
    needs_wake: bool,
}

impl MasterLink {
    /// Queues a reply. The worker is woken later by [`MasterLink::flush`].
    pub(crate) fn deliver(&mut self, msg: Fulfilled) {
        self.inbox.push(msg);
        self.needs_wake = true;
    }

    /// Wakes the worker if anything was delivered since the last flush.
    pub(crate) fn flush(&mut self) {
        if std::mem::take(&mut self.needs_wake) {
            if let Some(waker) = &self.waker {
                waker.wake();
            }
        }
    }
}

impl fmt::Debug for MasterLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterLink")
            .field("id", &self.id)
            .field("requests", &self.requests)
            .field("releases", &self.releases)
            .field("inbox", &self.inbox)
            .finish_non_exhaustive()
    }
}

/// Creates a slave cache and the coordinator-side link to it.
pub(crate) fn link(id: usize, waker: Option<Arc<dyn SlaveWaker>>) -> (SlaveCache, MasterLink) {
    let (new_tx, new_rx) = safe_queue::channel();
    let (old_tx, old_rx) = safe_queue::channel();
    let (inbox_tx, inbox_rx) = safe_queue::channel();
    let slave = SlaveCache {
        id,
        list: List::new(),
        map: HashMap::new(),
        outbox_new: new_tx,
        outbox_old: old_tx,
        inbox: inbox_rx,
        next_entry: 0,
        metrics: SlaveCacheMetrics::default(),
    };
    let link = MasterLink {
        id,
        requests: new_rx,
        releases: old_rx,
        inbox: inbox_tx,
        waker,
        needs_wake: false,
    };
    (slave, link)
}

/// A worker-local cache of HTTP replies.
///
/// # Safety
///
/// `map` holds raw pointers into nodes owned by `list`. A pointer is valid
/// from the `add()` that produced it until the matching `remove()`, and
/// both happen together in this module.
pub struct SlaveCache {
    id: usize,
    list: List<CacheEntry>,
    map: HashMap<Key, *mut Entry<CacheEntry>>,
    outbox_new: Producer<Request>,
    outbox_old: Producer<Release>,
    inbox: Consumer<Fulfilled>,
    next_entry: u64,
    metrics: SlaveCacheMetrics,
}

// SAFETY: the cache owns every node its pointers refer to, and all access
// goes through `&mut self`. Moving it to the worker thread is sound.
unsafe impl Send for SlaveCache {}

impl SlaveCache {
    /// Index of this slave at the coordinator.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of entries, pending or filled.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns true if an entry for `key` exists.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Looks at an entry without promoting it.
    pub fn peek(&self, key: &[u8]) -> Option<&CacheEntry> {
        let node = self.map.get(key).copied()?;
        // SAFETY: node comes from the map and is therefore live.
        Some(unsafe { (*node).get_value() })
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        self.list.iter().map(CacheEntry::key)
    }

    /// Counters for this slave.
    pub fn metrics(&self) -> &SlaveCacheMetrics {
        &self.metrics
    }

    /// Returns the entry for `key`, creating a pending one on a miss.
    ///
    /// A hit (filled or pending) promotes the entry to most recently used.
    /// A miss inserts a pending entry at the front and sends one
    /// [`Request`] to the coordinator; repeated lookups of the same key
    /// while it is pending send nothing.
    pub fn find(&mut self, key: &Key) -> &CacheEntry {
        if let Some(node) = self.map.get(key.as_bytes()).copied() {
            // SAFETY: node comes from the map and is therefore live.
            let entry = unsafe {
                self.list.move_to_front(node);
                (*node).get_value()
            };
            match entry.value() {
                Some(value) => self.metrics.core.record_hit(value.len() as u64),
                None => {
                    self.metrics.core.record_miss();
                    self.metrics.pending_hits += 1;
                }
            }
            return entry;
        }

        self.metrics.core.record_miss();
        let id = EntryId::new(self.next_entry);
        self.next_entry += 1;

        let node = self.list.add(CacheEntry::new(key.clone(), id));
        self.map.insert(key.clone(), node);
        self.metrics.entries = self.map.len() as u64;
        self.outbox_new.push(Request {
            key: key.clone(),
            entry: id,
        });
        trace!(slave = self.id, key = %key, entry = id.get(), "requested from master");

        // SAFETY: node was just added to the list.
        unsafe { (*node).get_value() }
    }

    /// Returns the payload for `key` if it is cached and filled.
    ///
    /// Never contacts the coordinator. A present entry is promoted.
    pub fn fetch(&mut self, key: &[u8]) -> Option<Bytes> {
        let node = self.map.get(key).copied()?;
        // SAFETY: node comes from the map and is therefore live.
        let entry = unsafe {
            self.list.move_to_front(node);
            (*node).get_value()
        };
        entry.value().cloned()
    }

    /// Removes the filled entry for `key` and releases it at the
    /// coordinator. Pending or missing entries are left alone.
    ///
    /// Returns true if an entry was removed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let Some(node) = self.map.get(key).copied() else {
            return false;
        };
        // SAFETY: node comes from the map and is therefore live.
        if unsafe { (*node).get_value().is_pending() } {
            return false;
        }

        self.map.remove(key);
        // SAFETY: node was in the map, so it is a live node of the list.
        let Some(entry) = (unsafe { self.list.remove(node) }) else {
            return false;
        };
        self.outbox_old.push(Release {
            key: entry.key().clone(),
        });
        self.metrics.releases_sent += 1;
        self.metrics.entries = self.map.len() as u64;
        true
    }

    /// Evicts up to `n` filled entries, least recently used first.
    ///
    /// Pending entries are skipped. Returns how many entries were removed.
    pub fn delete_stale_entries(&mut self, n: usize) -> usize {
        let mut evicted = 0;
        let mut cursor = self.list.last();
        while evicted < n {
            let Some(node) = cursor else { break };
            // SAFETY: cursor always points at a live node; its predecessor
            // is read before the node may be freed by `delete`.
            let key = unsafe {
                cursor = self.list.prev(node);
                (*node).get_value().key().clone()
            };
            if self.delete(key.as_bytes()) {
                self.metrics.core.record_eviction();
                evicted += 1;
            }
        }
        if evicted > 0 {
            trace!(slave = self.id, evicted, "evicted stale entries");
        }
        evicted
    }

    /// Registers `client` as waiting for the pending entry of `key`.
    ///
    /// Returns false if there is no pending entry for `key`; the caller
    /// should then answer the client directly.
    pub fn add_watcher(&mut self, key: &[u8], client: ClientId) -> bool {
        match self.pending_entry_mut(key) {
            Some(entry) => {
                entry.add_watcher(client);
                true
            }
            None => false,
        }
    }

    /// Unregisters `client` from the pending entry of `key`.
    ///
    /// Used when a blocked client times out or disconnects before the
    /// reply arrives. Returns true if the client was registered.
    pub fn remove_watcher(&mut self, key: &[u8], client: ClientId) -> bool {
        self.pending_entry_mut(key)
            .is_some_and(|entry| entry.remove_watcher(client))
    }

    fn pending_entry_mut(&mut self, key: &[u8]) -> Option<&mut CacheEntry> {
        let node = self.map.get(key).copied()?;
        // SAFETY: node comes from the map and is therefore live.
        let entry = unsafe { (*node).get_value_mut() };
        entry.is_pending().then_some(entry)
    }

    /// Applies every reply the coordinator has delivered so far.
    ///
    /// Fills the matching pending entries and returns the clients to
    /// unblock, each with the reply to send, in registration order. A
    /// reply whose entry no longer exists is released straight away so
    /// the coordinator's refcount stays balanced.
    pub fn process_inbox(&mut self) -> Vec<(ClientId, Bytes)> {
        let mut unblocked = Vec::new();
        while let Some(msg) = self.inbox.pop() {
            let node = self.map.get(msg.key.as_bytes()).copied();
            // SAFETY: node comes from the map and is therefore live.
            let entry = node.map(|node| unsafe { (*node).get_value_mut() });
            match entry {
                Some(entry) if entry.id() == msg.entry && entry.is_pending() => {
                    let clients = entry.fill(msg.payload.clone());
                    self.metrics.fulfilled += 1;
                    unblocked.extend(clients.into_iter().map(|c| (c, msg.payload.clone())));
                }
                _ => {
                    trace!(slave = self.id, key = %msg.key, "stale fulfilment released");
                    self.metrics.stale_fulfilled += 1;
                    self.metrics.releases_sent += 1;
                    self.outbox_old.push(Release { key: msg.key });
                }
            }
        }
        unblocked
    }
}

impl Drop for SlaveCache {
    fn drop(&mut self) {
        // Hand every reference held by a filled entry back to the coordinator.
        for entry in self.list.iter() {
            if !entry.is_pending() {
                self.outbox_old.push(Release {
                    key: entry.key().clone(),
                });
            }
        }
    }
}

impl CacheMetrics for SlaveCache {
    fn metrics(&self) -> std::collections::BTreeMap<String, f64> {
        self.metrics.to_btreemap()
    }

    fn component_name(&self) -> &'static str {
        "slave"
    }
}

impl fmt::Debug for SlaveCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveCache")
            .field("id", &self.id)
            .field("len", &self.map.len())
            .field("next_entry", &self.next_entry)
            .finish()
    }
}
