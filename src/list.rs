//! Intrusive doubly linked list used as the access-order list of a
//! [`SlaveCache`](crate::slave::SlaveCache).
//!
//! The list owns its nodes. Callers keep raw node pointers in a side map
//! so that promotion and removal are O(1). The front of the list is the
//! most recently used entry, the back is the least recently used one.
//!
//! ```text
//!   head sigil <-> [MRU] <-> ... <-> [LRU] <-> tail sigil
//! ```

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

/// A node in the doubly linked list.
///
/// Contains a value and pointers to the previous and next entries.
pub struct Entry<T> {
    /// The stored value. Uninitialized only for the two sigil nodes.
    val: mem::MaybeUninit<T>,
    prev: *mut Entry<T>,
    next: *mut Entry<T>,
}

impl<T> Entry<T> {
    fn new(val: T) -> Self {
        Entry {
            val: mem::MaybeUninit::new(val),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    /// Creates a sentinel entry without initializing the value.
    fn new_sigil() -> Self {
        Entry {
            val: mem::MaybeUninit::uninit(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    /// Returns a reference to the stored value.
    ///
    /// # Safety
    ///
    /// Must only be called on non-sigil nodes.
    pub unsafe fn get_value(&self) -> &T {
        // SAFETY: caller guarantees this is not a sigil, so `val` is initialized.
        unsafe { self.val.assume_init_ref() }
    }

    /// Returns a mutable reference to the stored value.
    ///
    /// # Safety
    ///
    /// Must only be called on non-sigil nodes.
    pub unsafe fn get_value_mut(&mut self) -> &mut T {
        // SAFETY: caller guarantees this is not a sigil, so `val` is initialized.
        unsafe { self.val.assume_init_mut() }
    }
}

/// An unbounded doubly linked list with sentinel head and tail nodes.
///
/// Entries are bounded by the owner, not by the list: a slave cache sheds
/// entries under memory pressure rather than at a fixed count.
pub struct List<T> {
    len: usize,
    head: *mut Entry<T>,
    tail: *mut Entry<T>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> List<T> {
    /// Creates an empty list.
    pub fn new() -> List<T> {
        let head = Box::into_raw(Box::new(Entry::new_sigil()));
        let tail = Box::into_raw(Box::new(Entry::new_sigil()));

        // SAFETY: head and tail are freshly allocated and valid.
        unsafe {
            (*head).next = tail;
            (*tail).prev = head;
        }

        List { len: 0, head, tail }
    }

    /// Returns the number of entries in the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes the front (most recently used) entry and returns its value.
    pub fn remove_first(&mut self) -> Option<T> {
        // SAFETY: head is a valid sigil for the lifetime of the list.
        let first = unsafe { (*self.head).next };
        // SAFETY: `first` is either the tail sigil (rejected by `remove`) or a live node.
        unsafe { self.remove(first) }
    }

    /// Removes the back (least recently used) entry and returns its value.
    pub fn remove_last(&mut self) -> Option<T> {
        // SAFETY: tail is a valid sigil for the lifetime of the list.
        let last = unsafe { (*self.tail).prev };
        // SAFETY: `last` is either the head sigil (rejected by `remove`) or a live node.
        unsafe { self.remove(last) }
    }

    /// Unlinks `node`, frees it and returns the value it held.
    ///
    /// # Safety
    ///
    /// `node` must be null, one of the sigils, or a live node of this list.
    pub unsafe fn remove(&mut self, node: *mut Entry<T>) -> Option<T> {
        if node.is_null() || node == self.head || node == self.tail {
            return None;
        }

        // SAFETY: caller guarantees node is a live node of this list, which
        // makes it a uniquely owned heap allocation once detached.
        unsafe {
            self.detach(node);
            self.len -= 1;
            let boxed = Box::from_raw(node);
            Some(boxed.val.assume_init())
        }
    }

    /// # Safety
    ///
    /// `node` must be a live node of this list.
    unsafe fn detach(&mut self, node: *mut Entry<T>) {
        // SAFETY: a live node always has valid neighbours (possibly sigils).
        unsafe {
            (*(*node).prev).next = (*node).next;
            (*(*node).next).prev = (*node).prev;
        }
    }

    /// Links `node` directly after the head sigil.
    ///
    /// # Safety
    ///
    /// `node` must be valid and not currently linked into any list.
    unsafe fn attach(&mut self, node: *mut Entry<T>) {
        // SAFETY: head is valid; the caller guarantees node is unlinked.
        unsafe {
            (*node).next = (*self.head).next;
            (*node).prev = self.head;
            (*self.head).next = node;
            (*(*node).next).prev = node;
        }
    }

    /// Moves `node` to the front of the list.
    ///
    /// # Safety
    ///
    /// `node` must be a live node of this list.
    pub unsafe fn move_to_front(&mut self, node: *mut Entry<T>) {
        if node.is_null() || node == self.head || node == self.tail {
            return;
        }
        // SAFETY: caller guarantees node belongs to this list.
        unsafe {
            if (*self.head).next == node {
                return;
            }
            self.detach(node);
            self.attach(node);
        }
    }

    /// Adds a value at the front of the list and returns its node.
    pub fn add(&mut self, v: T) -> *mut Entry<T> {
        // SAFETY: Box::into_raw never returns null.
        let node = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(Entry::new(v)))) };
        // SAFETY: the node is freshly allocated and unlinked.
        unsafe { self.attach(node.as_ptr()) };
        self.len += 1;
        node.as_ptr()
    }

    /// Returns the back (least recently used) node, if any.
    pub fn last(&self) -> Option<*mut Entry<T>> {
        // SAFETY: tail is a valid sigil for the lifetime of the list.
        let last = unsafe { (*self.tail).prev };
        (last != self.head).then_some(last)
    }

    /// Returns the node in front of `node`, walking towards the most
    /// recently used end.
    ///
    /// # Safety
    ///
    /// `node` must be a live node of this list.
    pub unsafe fn prev(&self, node: *mut Entry<T>) -> Option<*mut Entry<T>> {
        // SAFETY: caller guarantees node is live, so `prev` is valid.
        let prev = unsafe { (*node).prev };
        (prev != self.head).then_some(prev)
    }

    /// Iterates the values from most to least recently used.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            // SAFETY: head is a valid sigil.
            next: unsafe { (*self.head).next },
            tail: self.tail,
            _list: self,
        }
    }

    /// Removes every entry, dropping the values.
    pub fn clear(&mut self) {
        while self.remove_first().is_some() {}
    }
}

impl<T> Drop for List<T> {
    fn drop(&mut self) {
        self.clear();

        // SAFETY: the sigils were allocated in `new` and are freed exactly once here.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}

impl<T> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List").field("length", &self.len).finish()
    }
}

/// Front-to-back iterator over a [`List`].
pub struct Iter<'a, T> {
    next: *mut Entry<T>,
    tail: *mut Entry<T>,
    _list: &'a List<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.next == self.tail {
            return None;
        }
        // SAFETY: every node between the sigils is live while the list is borrowed.
        unsafe {
            let node = self.next;
            self.next = (*node).next;
            Some((*node).get_value())
        }
    }
}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}
