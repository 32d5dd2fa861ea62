//! A generic Lock-Free LIFO-Stack of owned Values
//!
//! The Stack is used internally as the owner of the memory Chunks backing
//! the Pools, but is generally useable on its own. Pushing is lock-free and
//! can be done concurrently from any number of Threads, popping requires
//! exclusive access as it also releases the Node owning the Value.

use crate::sync::atomic;

struct Node<T> {
    data: T,
    next: atomic::AtomicPtr<Self>,
}

/// A Lock-Free Stack of owned Values
///
/// This structure only garantues LIFO ordering for Values pushed by a
/// single Thread, concurrent pushes may interleave in any order.
pub struct LockFreeStack<T> {
    head: atomic::AtomicPtr<Node<T>>,
}

impl<T> LockFreeStack<T> {
    /// Creates a new empty Stack
    pub fn new() -> Self {
        Self {
            head: atomic::AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Pushes the given Value on Top of the Stack
    pub fn push(&self, data: T) {
        let node_ptr = Box::into_raw(Box::new(Node {
            data,
            next: atomic::AtomicPtr::new(std::ptr::null_mut()),
        }));

        let mut old_head = self.head.load(atomic::Ordering::Relaxed);
        loop {
            // The Node is not yet shared, so its next-Ptr can be set without
            // any synchronization, the publishing CAS is the release point
            unsafe { &*node_ptr }
                .next
                .store(old_head, atomic::Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                old_head,
                node_ptr,
                atomic::Ordering::Release,
                atomic::Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(other) => {
                    old_head = other;
                }
            };
        }
    }

    /// Attempts to pop the Top-Value from the Stack, returns None if the
    /// Stack is empty
    ///
    /// # Note
    /// Popping moves the Value out of its Node and releases the Node itself,
    /// which is why this requires exclusive access to the Stack
    pub fn try_pop(&mut self) -> Option<T> {
        let mut old_head = self.head.load(atomic::Ordering::Acquire);
        loop {
            if old_head.is_null() {
                return None;
            }

            let next = unsafe { &*old_head }.next.load(atomic::Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                old_head,
                next,
                atomic::Ordering::Acquire,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => {
                    let node = unsafe { Box::from_raw(old_head) };
                    return Some(node.data);
                }
                Err(other) => {
                    old_head = other;
                }
            };
        }
    }

    /// Checks if the Stack is currently empty
    pub fn is_empty(&self) -> bool {
        self.head.load(atomic::Ordering::Relaxed).is_null()
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

impl<T> std::fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockFreeStack<{}>", std::any::type_name::<T>())
    }
}

unsafe impl<T> Send for LockFreeStack<T> where T: Send {}
unsafe impl<T> Sync for LockFreeStack<T> where T: Send {}
