//! The bounded per-Thread Block-Cache used by both Pools
//!
//! A Cache is a plain fixed-size Array of Block-Ptrs owned by a single
//! Thread, all the synchronization happens when a Batch of Blocks is moved
//! between the Cache and the global Free-List.

use crate::freelist::Link;
use crate::sync::atomic;
use std::ptr::NonNull;

/// A fixed-capacity Stack of Block-Ptrs for a single Size-Class
pub struct CacheSlots<L, const N: usize> {
    /// The Backing storage for the cached Block-Ptrs
    buffer: [*mut L; N],
    /// The Number of Blocks currently in the Cache
    used: usize,
}

impl<L, const N: usize> CacheSlots<L, N> {
    /// The Fill-Level at which a Deallocation drains the older half of the
    /// Cache back to the global Free-List
    pub const HIGH_WATER: usize = (N * 4) / 5;

    /// Creates a new empty Cache
    pub const fn new() -> Self {
        Self {
            buffer: [std::ptr::null_mut(); N],
            used: 0,
        }
    }

    /// The Number of Blocks currently in the Cache
    pub fn len(&self) -> usize {
        self.used
    }

    /// Checks if the Cache holds no Blocks
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Attempts to pop the most recently pushed Block, returns None if the
    /// Cache is empty
    pub fn try_pop(&mut self) -> Option<NonNull<L>> {
        let location = self.used.checked_sub(1)?;

        self.used = location;
        NonNull::new(self.buffer[location])
    }

    /// Attempts to push the Block onto the Cache, returns an Error with the
    /// given Block if the Cache is full
    pub fn try_push(&mut self, block: NonNull<L>) -> Result<(), NonNull<L>> {
        if self.used >= N {
            return Err(block);
        }

        let location = self.used;
        self.buffer[location] = block.as_ptr();
        self.used = location + 1;

        Ok(())
    }
}

impl<L, const N: usize> CacheSlots<L, N>
where
    L: Link,
{
    /// Links the older half of the Cache into a Segment and compacts the
    /// remaining Blocks down to Index 0, returns the (Head, Tail) pair of
    /// the Segment or None if there are fewer than two Blocks
    ///
    /// The Segment is linked in Cache-Order, the oldest Block becomes the
    /// Head. The Links are written without synchronization as all the
    /// Blocks are still owned by this Thread, the publishing happens in the
    /// splice-CAS of the Free-List afterwards.
    pub fn drain_lower_half(&mut self) -> Option<(NonNull<L>, NonNull<L>)> {
        let half = self.used / 2;
        if half == 0 {
            return None;
        }

        let segment = self.link_run(0, half)?;

        // Compact the newer half down to the start of the Buffer
        for i in 0..self.used - half {
            self.buffer[i] = self.buffer[i + half];
        }
        self.used -= half;

        Some(segment)
    }

    /// Links every cached Block into a single Segment and empties the
    /// Cache, returns None if the Cache is already empty
    ///
    /// This is the Termination-Handoff: when a Thread exits, the Blocks it
    /// still caches are returned to the owning Pool in one splice per
    /// Size-Class.
    pub fn take_all(&mut self) -> Option<(NonNull<L>, NonNull<L>)> {
        let segment = self.link_run(0, self.used)?;
        self.used = 0;

        Some(segment)
    }

    fn link_run(&mut self, from: usize, to: usize) -> Option<(NonNull<L>, NonNull<L>)> {
        if from >= to {
            return None;
        }

        for i in from..to - 1 {
            let next = self.buffer[i + 1];
            unsafe { &*self.buffer[i] }
                .next()
                .store(next, atomic::Ordering::Relaxed);
        }

        let head = NonNull::new(self.buffer[from])?;
        let tail = NonNull::new(self.buffer[to - 1])?;
        Some((head, tail))
    }
}

// The raw Ptrs stored in the Cache keep their Send-ness tied to the Block
// Type they reference
unsafe impl<L, const N: usize> Send for CacheSlots<L, N> where L: Send {}
