//! Lock-free single-producer single-consumer queue.
//!
//! Every pair of threads that talk to each other in the cache (a worker and
//! the coordinator, a background thread and the coordinator) is connected by
//! one of these queues, so the hot path never takes a lock.
//!
//! ## Layout
//!
//! The queue is a singly linked list that always holds a sentinel node.
//! The consumer owns the sentinel (`head`); the producer owns the last node
//! (`tail`).
//!
//! ```text
//!   head (sentinel) -> n1 -> n2 -> ... -> tail -> null
//! ```
//!
//! `push` links a new node behind `tail` with a `Release` store of the
//! `next` pointer. `pop` reads `head.next` with an `Acquire` load; if it is
//! non-null the value is moved out of it, it becomes the new sentinel and
//! the old sentinel is freed. The producer never touches a node again once
//! it has published its successor, so freeing the old sentinel is safe.
//!
//! The two halves are separate types, [`Producer`] and [`Consumer`], and
//! both methods take `&mut self`: the single-producer/single-consumer
//! contract is enforced by the type system instead of by convention.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn alloc(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

struct Shared<T> {
    /// Current sentinel. Only the consumer reads or writes this while both
    /// halves are alive; `Drop` has exclusive access.
    head: UnsafeCell<*mut Node<T>>,
    pushed: AtomicUsize,
    popped: AtomicUsize,
}

// SAFETY: values only ever move from the producer thread to the consumer
// thread, and `head` is touched by the consumer alone.
unsafe impl<T: Send> Send for Shared<T> {}
// SAFETY: see above; the counters are atomics.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // SAFETY: both halves are gone, so the chain from head is complete
        // and exclusively owned here.
        unsafe {
            let mut node = *self.head.get();
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Acquire);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}

/// The sending half of a queue created by [`channel`].
pub struct Producer<T> {
    tail: *mut Node<T>,
    shared: Arc<Shared<T>>,
}

/// The receiving half of a queue created by [`channel`].
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

// SAFETY: a producer can be moved to another thread as long as the values can.
unsafe impl<T: Send> Send for Producer<T> {}
// SAFETY: as above for the consumer.
unsafe impl<T: Send> Send for Consumer<T> {}

/// Creates a new empty queue and returns its two halves.
pub fn channel<T>() -> (Producer<T>, Consumer<T>) {
    let sentinel = Node::alloc(None);
    let shared = Arc::new(Shared {
        head: UnsafeCell::new(sentinel),
        pushed: AtomicUsize::new(0),
        popped: AtomicUsize::new(0),
    });
    (
        Producer {
            tail: sentinel,
            shared: Arc::clone(&shared),
        },
        Consumer { shared },
    )
}

impl<T> Producer<T> {
    /// Appends `value` to the queue. Never blocks.
    pub fn push(&mut self, value: T) {
        let node = Node::alloc(Some(value));
        // SAFETY: tail is owned by the producer and stays alive until the
        // consumer observes its successor, which happens after this store.
        unsafe { (*self.tail).next.store(node, Ordering::Release) };
        self.tail = node;
        self.shared.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true once the consumer has been dropped.
    pub fn is_closed(&self) -> bool {
        Arc::strong_count(&self.shared) < 2
    }

    /// Approximate number of queued values.
    pub fn len(&self) -> usize {
        approx_len(&self.shared)
    }

    /// Returns true if the queue looks empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Consumer<T> {
    /// Removes the oldest value, or returns `None` if the queue is empty.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: head is owned by the consumer. A non-null `next` was fully
        // initialized before the producer's release store.
        unsafe {
            let head = *self.shared.head.get();
            let next = (*head).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            let value = (*next).value.take();
            *self.shared.head.get() = next;
            drop(Box::from_raw(head));
            self.shared.popped.fetch_add(1, Ordering::Relaxed);
            value
        }
    }

    /// Pops every value currently visible to the consumer.
    pub fn drain(&mut self) -> Drain<'_, T> {
        Drain { consumer: self }
    }

    /// Returns true once the producer has been dropped.
    pub fn is_closed(&self) -> bool {
        Arc::strong_count(&self.shared) < 2
    }

    /// Approximate number of queued values.
    pub fn len(&self) -> usize {
        approx_len(&self.shared)
    }

    /// Returns true if the queue looks empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn approx_len<T>(shared: &Shared<T>) -> usize {
    let popped = shared.popped.load(Ordering::Relaxed);
    let pushed = shared.pushed.load(Ordering::Relaxed);
    pushed.saturating_sub(popped)
}

/// Iterator returned by [`Consumer::drain`].
pub struct Drain<'a, T> {
    consumer: &'a mut Consumer<T>,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.consumer.pop()
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> fmt::Debug for Drain<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drain").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn test_pop_empty() {
        let (_tx, mut rx) = channel::<u32>();
        assert_eq!(rx.pop(), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let (mut tx, mut rx) = channel();
        tx.push(1);
        tx.push(2);
        tx.push(3);
        assert_eq!(tx.len(), 3);
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        tx.push(4);
        let rest: Vec<_> = rx.drain().collect();
        assert_eq!(rest, vec![3, 4]);
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_is_closed() {
        let (tx, rx) = channel::<u8>();
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());

        let (tx, rx) = channel::<u8>();
        drop(tx);
        assert!(rx.is_closed());
    }

    #[test]
    fn test_drop_releases_unconsumed_values() {
        let tracker = Rc::new(());
        {
            let (mut tx, mut rx) = channel();
            for _ in 0..4 {
                tx.push(Rc::clone(&tracker));
            }
            drop(rx.pop());
            assert_eq!(Rc::strong_count(&tracker), 4);
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_cross_thread_order() {
        const COUNT: u64 = 100_000;
        let (mut tx, mut rx) = channel();

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                tx.push(i);
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            if let Some(v) = rx.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_consumer_dropped_while_producer_pushes() {
        let log = Arc::new(Mutex::new(0u32));
        let (mut tx, rx) = channel();
        drop(rx);
        for _ in 0..10 {
            tx.push(Arc::clone(&log));
        }
        assert!(tx.is_closed());
        drop(tx);
        assert_eq!(Arc::strong_count(&log), 1);
    }
}
