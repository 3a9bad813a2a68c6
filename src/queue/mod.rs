//! Lock-free multi-producer queue with a detach-everything consumer side.
//!
//! Producers link a heap node onto an atomic head pointer with a CAS loop.
//! The consumer swaps the head for null, which detaches every node pushed so
//! far in one atomic step, then reverses the detached chain so items come out
//! oldest first.
//!
//! Because the consumer never unlinks single nodes there is no ABA hazard:
//! a node is only reachable from the head until the swap that detaches it.
//! Two concurrent drains would simply split the items between them, so
//! `drain_all` is memory safe from any thread; the worker still keeps a
//! single consumer so that per-producer ordering holds end to end.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

pub struct LocklessQueue<T> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: nodes are owned by the queue between push and drain and are only
// dereferenced by the thread that allocated them (before publication) or the
// thread that detached them (after the Acquire swap).
unsafe impl<T: Send> Send for LocklessQueue<T> {}
unsafe impl<T: Send> Sync for LocklessQueue<T> {}

impl<T> LocklessQueue<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Links `value` onto the queue. Never blocks and never fails.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not yet published, so this thread has exclusive access.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detaches everything pushed so far and returns it oldest first.
    pub fn drain_all(&self) -> Vec<T> {
        let mut current = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut items = Vec::new();

        while !current.is_null() {
            // SAFETY: the swap above made this chain unreachable for everyone else,
            // and each node was allocated by `Box::into_raw` in `push`.
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
            items.push(node.value);
        }

        items.reverse();
        items
    }

    /// Observational only; the answer may be stale by the time it is used.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for LocklessQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LocklessQueue<T> {
    fn drop(&mut self) {
        drop(self.drain_all());
    }
}
