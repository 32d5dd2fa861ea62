//! Lock-Free Per-Thread Storage
//!
//! Every Pool owns one of these Tables to hold the Thread-Local Caches of
//! all the Threads that ever touched it, keyed by the Thread-Id on first
//! touch. Keeping the Caches inside the Pool instead of raw Thread-Local
//! Storage ties every Cache to exactly one Pool-Instance, so two Pools of
//! the same Type can never mix up each others Blocks.

mod id;
pub use id::current_thread_id;

use crate::sync::atomic;

struct Entry<T> {
    id: u64,
    data: T,
    next: atomic::AtomicPtr<Self>,
}

/// An append-only List of Per-Thread Entries
///
/// Entries are only ever inserted, never removed, so a once returned
/// Reference stays valid for the lifetime of the Storage. The Data of an
/// Entry is only ever accessed by the Thread whose Id it carries (plus the
/// single Thread running the Pool-Destructor once all users are gone),
/// which is what justifies the Sync-Impl below.
pub struct ThreadStorage<T> {
    entries: atomic::AtomicPtr<Entry<T>>,
}

impl<T> ThreadStorage<T> {
    /// Creates a new empty Storage
    pub fn new() -> Self {
        Self {
            entries: atomic::AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Attempts to load the Entry stored for the given Thread-Id
    pub fn get(&self, id: u64) -> Option<&T> {
        let head_ptr = self.entries.load(atomic::Ordering::Acquire);
        if head_ptr.is_null() {
            return None;
        }

        let mut current = unsafe { &*head_ptr };
        loop {
            if current.id == id {
                return Some(&current.data);
            }

            let next_ptr = current.next.load(atomic::Ordering::Acquire);
            if next_ptr.is_null() {
                return None;
            }

            current = unsafe { &*next_ptr };
        }
    }

    /// Loads the Data stored for the current Thread or creates + stores new
    /// Data if this Thread has not touched the Storage before
    pub fn get_or<F>(&self, create: F) -> &T
    where
        F: FnOnce() -> T,
    {
        let id = current_thread_id();
        match self.get(id) {
            Some(data) => data,
            None => self.insert(id, create()),
        }
    }

    /// Creates a new Entry for the given Id
    ///
    /// # Note
    /// Only the Thread owning the Id ever inserts it, so there can never be
    /// two Entries for the same Id
    fn insert(&self, id: u64, data: T) -> &T {
        let new_entry_ptr = Box::into_raw(Box::new(Entry {
            id,
            data,
            next: atomic::AtomicPtr::new(std::ptr::null_mut()),
        }));
        let new_entry = unsafe { &*new_entry_ptr };

        let mut head_ptr = self.entries.load(atomic::Ordering::Acquire);
        if head_ptr.is_null() {
            match self.entries.compare_exchange(
                std::ptr::null_mut(),
                new_entry_ptr,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => return &new_entry.data,
                Err(other_ptr) => {
                    head_ptr = other_ptr;
                }
            };
        }

        let mut current = unsafe { &*head_ptr };
        loop {
            let next_ptr = current.next.load(atomic::Ordering::Acquire);

            if next_ptr.is_null() {
                match current.next.compare_exchange(
                    std::ptr::null_mut(),
                    new_entry_ptr,
                    atomic::Ordering::AcqRel,
                    atomic::Ordering::Acquire,
                ) {
                    Ok(_) => return &new_entry.data,
                    Err(ptr) => {
                        current = unsafe { &*ptr };
                    }
                };
            } else {
                current = unsafe { &*next_ptr };
            }
        }
    }
}

impl<T> Default for ThreadStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ThreadStorage<T> {
    fn drop(&mut self) {
        let head_ptr = self.entries.load(atomic::Ordering::Acquire);
        if head_ptr.is_null() {
            return;
        }

        let mut current = unsafe { Box::from_raw(head_ptr) };
        loop {
            let next_ptr = current.next.load(atomic::Ordering::Acquire);
            if next_ptr.is_null() {
                break;
            }

            current = unsafe { Box::from_raw(next_ptr) };
        }
    }
}

impl<T> std::fmt::Debug for ThreadStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThreadStorage<{}>", std::any::type_name::<T>())
    }
}

unsafe impl<T> Sync for ThreadStorage<T> where T: Send {}
unsafe impl<T> Send for ThreadStorage<T> where T: Send {}
