//! The Thread-Exit Handoff
//!
//! When a Thread terminates, every Block still sitting in one of its
//! Caches has to be returned to the global Free-List of the owning Pool,
//! otherwise those Blocks would be unreachable until the Pool itself is
//! destroyed. Each Thread keeps a small registration List in its
//! Thread-Local Storage, the List-Destructor runs during Thread-Teardown
//! and flushes every registered Pool once.
//!
//! Pools are held as Weak-Refs: a Pool that was already destroyed fails
//! the upgrade and is skipped, so the Handoff can never touch freed
//! memory even if the Pool dies before one of its user Threads.

use std::cell::RefCell;
use std::sync::Weak;

/// Implemented by the shared state of every Pool, pushes all the Blocks
/// still cached for the given Thread back onto the Pool's global
/// Free-Lists
pub trait FlushCaches {
    /// Flushes every Cache-Slot the given Thread holds in this Pool
    fn flush_thread(&self, thread_id: u64);
}

struct Registration {
    /// Captured at registration time, the Id must not be re-queried during
    /// Thread-Teardown
    thread_id: u64,
    pool: Weak<dyn FlushCaches>,
}

struct HandoffList {
    registrations: Vec<Registration>,
}

impl Drop for HandoffList {
    fn drop(&mut self) {
        for registration in self.registrations.drain(..) {
            if let Some(pool) = registration.pool.upgrade() {
                pool.flush_thread(registration.thread_id);
            }
        }
    }
}

thread_local! {
    static HANDOFF: RefCell<HandoffList> = RefCell::new(HandoffList {
        registrations: Vec::new(),
    });
}

/// Registers the given Pool for the Termination-Handoff of the current
/// Thread
///
/// # Note
/// Callers must register at most once per (Thread, Pool) pair, which the
/// Pools garantue by registering only when the Thread's Cache-Entry is
/// first created
pub fn register_current_thread(pool: Weak<dyn FlushCaches>) {
    let thread_id = crate::thread_storage::current_thread_id();

    HANDOFF.with(|handoff| {
        handoff
            .borrow_mut()
            .registrations
            .push(Registration { thread_id, pool });
    });
}
