//! Coordinator-side cached objects.

use bytes::Bytes;

use crate::entry::EntryId;
use crate::key::Key;

/// Lifecycle of a [`SharedObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// A background job has been submitted and has not reported back.
    Waiting,
    /// The payload is known. It never changes after this point.
    Ok,
}

/// A pending entry of some slave waiting on an object.
#[derive(Debug, Clone)]
pub struct Waiter {
    /// Index of the slave that owns the entry.
    pub slave: usize,
    /// Key as the slave sent it (before alias resolution).
    pub key: Key,
    /// The pending entry.
    pub entry: EntryId,
}

/// The authoritative, deduplicated copy of one cached response.
///
/// The refcount starts at one, the reference held by the coordinator's own
/// table. Each outstanding [`Request`](crate::message::Request) adds one.
/// Pinned objects carry one more permanent reference so they never reach
/// the baseline and are never destroyed.
#[derive(Debug)]
pub struct SharedObject {
    state: ObjectState,
    payload: Option<Bytes>,
    refcount: usize,
    pinned: bool,
    waiting_entries: Vec<Waiter>,
    /// Bytes charged against the memory ceiling for this object.
    charged: usize,
}

impl SharedObject {
    /// Creates a `Waiting` object owned by the table.
    pub(crate) fn waiting() -> Self {
        SharedObject {
            state: ObjectState::Waiting,
            payload: None,
            refcount: 1,
            pinned: false,
            waiting_entries: Vec::new(),
            charged: 0,
        }
    }

    /// Creates a pinned object in state `Ok`.
    pub(crate) fn pinned_ok(payload: Bytes) -> Self {
        SharedObject {
            state: ObjectState::Ok,
            payload: Some(payload),
            refcount: 2,
            pinned: true,
            waiting_entries: Vec::new(),
            charged: 0,
        }
    }

    /// Creates a pinned object in state `Waiting`.
    pub(crate) fn pinned_waiting() -> Self {
        SharedObject {
            refcount: 2,
            pinned: true,
            ..SharedObject::waiting()
        }
    }

    /// Current state.
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// The payload, once known.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Current reference count, including the table's own reference.
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    /// Returns true for objects that are never destroyed.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Entries waiting for the payload.
    pub fn waiting_entries(&self) -> &[Waiter] {
        &self.waiting_entries
    }

    /// Bytes this object counts toward the coordinator's memory total.
    pub fn charged(&self) -> usize {
        self.charged
    }

    /// Refcount at which an unpinned object is destroyed.
    pub(crate) fn baseline(&self) -> usize {
        if self.pinned {
            2
        } else {
            1
        }
    }

    pub(crate) fn acquire(&mut self) {
        self.refcount += 1;
    }

    /// Drops one reference and returns true if the object is back at its
    /// baseline.
    ///
    /// # Panics
    ///
    /// Panics if the release would take the refcount below the baseline.
    /// That can only happen when a slave releases a reference it never
    /// acquired.
    pub(crate) fn release(&mut self) -> bool {
        assert!(
            self.refcount > self.baseline(),
            "refcount underflow: release at refcount {} (baseline {})",
            self.refcount,
            self.baseline()
        );
        self.refcount -= 1;
        self.refcount == self.baseline()
    }

    pub(crate) fn add_waiter(&mut self, waiter: Waiter) {
        debug_assert_eq!(self.state, ObjectState::Waiting);
        self.waiting_entries.push(waiter);
    }

    /// Stores the payload, moves to `Ok` and returns the waiters to notify.
    pub(crate) fn fulfil(&mut self, payload: Bytes, charged: usize) -> Vec<Waiter> {
        self.payload = Some(payload);
        self.charged = charged;
        self.state = ObjectState::Ok;
        std::mem::take(&mut self.waiting_entries)
    }

    /// Replaces the payload of a pinned object in place.
    pub(crate) fn replace_pinned_payload(&mut self, payload: Bytes) {
        debug_assert!(self.pinned);
        self.payload = Some(payload);
        self.state = ObjectState::Ok;
    }
}
