//! A Lock-Free fixed-size Object-Pool
//!
//! The Pool hands out fully constructed Objects of a single Type. All the
//! Objects live inside large Chunks owned by the Pool, a global Free-List
//! tracks the available Blocks and every Thread keeps a small Cache of
//! Blocks that is refilled from and drained back to the global List in
//! Batches.
//!
//! # Example
//! ```
//! use blockpool::object_pool::ObjectPool;
//!
//! let pool = ObjectPool::new();
//!
//! let value = pool.allocate(13_u64).unwrap();
//! assert_eq!(13, *value);
//!
//! drop(value);
//! assert_eq!(0, pool.active_count());
//! ```

mod owned;
pub use owned::PoolBox;

use crate::align::MaxAligned;
use crate::cache::CacheSlots;
use crate::chunk::Chunk;
use crate::freelist::{FreeList, Link};
use crate::handoff::{self, FlushCaches};
use crate::stack::LockFreeStack;
use crate::sync::atomic;
use crate::thread_storage::ThreadStorage;

use crossbeam_utils::CachePadded;

use std::alloc::Layout;
use std::cell::RefCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

/// The target Byte-Size of a single Chunk
const CHUNK_SIZE: usize = 64 * 1024;
/// The Capacity of the per-Thread Cache
const CACHE_CAPACITY: usize = 32;
/// The Number of Blocks moved from the global Free-List in one Refill
const REFILL_BATCH: usize = 16;

/// A single Slot of the Pool
///
/// The Payload sits at Offset 0, so the Ptr handed to the user is the
/// Block-Ptr itself and deallocation recovers the Block with a plain cast.
/// The next-Link is a separate Field after the Payload and is only live
/// while the Block is free.
#[repr(C)]
struct Block<T> {
    value: MaybeUninit<T>,
    next: atomic::AtomicPtr<Block<T>>,
    _align: [MaxAligned; 0],
}

impl<T> Block<T> {
    /// # Safety
    /// The Block must be backed by live Pool-Memory
    unsafe fn payload(block: NonNull<Self>) -> NonNull<T> {
        let value = unsafe { std::ptr::addr_of_mut!((*block.as_ptr()).value) };
        unsafe { NonNull::new_unchecked(value as *mut T) }
    }

    /// # Safety
    /// The Ptr must have been produced by [`Block::payload`] for a Block of
    /// this Pool
    unsafe fn from_payload(ptr: NonNull<T>) -> NonNull<Self> {
        ptr.cast()
    }
}

impl<T> Link for Block<T> {
    fn next(&self) -> &atomic::AtomicPtr<Self> {
        &self.next
    }
}

type Cache<T> = CacheSlots<Block<T>, CACHE_CAPACITY>;

struct Shared<T> {
    free_list: CachePadded<FreeList<Block<T>>>,
    chunks: LockFreeStack<Chunk>,
    caches: ThreadStorage<RefCell<Cache<T>>>,
    allocated: atomic::AtomicUsize,
    deallocated: atomic::AtomicUsize,
}

impl<T> Shared<T> {
    /// Allocates a new Chunk, carves it into Blocks and splices all of them
    /// onto the global Free-List, returns false if the System-Allocator
    /// refused the request
    fn grow(&self) -> bool {
        let stride = std::mem::size_of::<Block<T>>();
        let count = std::cmp::max(1, CHUNK_SIZE / stride);

        let layout =
            match Layout::from_size_align(stride * count, std::mem::align_of::<Block<T>>()) {
                Ok(layout) => layout,
                Err(_) => return false,
            };
        let chunk = match Chunk::new(layout) {
            Some(chunk) => chunk,
            None => return false,
        };

        let first = chunk.as_ptr() as *mut Block<T>;

        // Thread all the Blocks together while they are still private to
        // this call, the splice-CAS below is the single release point that
        // makes them reachable
        for i in 0..count {
            let next = if i + 1 < count {
                unsafe { first.add(i + 1) }
            } else {
                std::ptr::null_mut()
            };
            unsafe {
                std::ptr::addr_of_mut!((*first.add(i)).next).write(atomic::AtomicPtr::new(next));
            }
        }

        let head = unsafe { NonNull::new_unchecked(first) };
        let tail = unsafe { NonNull::new_unchecked(first.add(count - 1)) };
        unsafe { self.free_list.push_segment(head, tail) };

        self.chunks.push(chunk);

        log::debug!(
            "allocated a new Chunk with {} Blocks of {} Bytes each",
            count,
            stride
        );
        true
    }

    /// Moves a Batch of Blocks from the global Free-List into the given
    /// Cache, allocating a new Chunk once if the List is empty
    fn refill(&self, cache: &mut Cache<T>) {
        let segment = match self.free_list.pop_batch(REFILL_BATCH) {
            Some(segment) => segment,
            None => {
                if !self.grow() {
                    return;
                }
                match self.free_list.pop_batch(REFILL_BATCH) {
                    Some(segment) => segment,
                    None => return,
                }
            }
        };

        for block in segment.iter() {
            cache.try_push(block).expect(
                "the Cache is empty before a Refill and a Batch never exceeds the Cache-Capacity",
            );
        }
    }
}

impl<T> FlushCaches for Shared<T>
where
    T: Send,
{
    fn flush_thread(&self, thread_id: u64) {
        let cache_cell = match self.caches.get(thread_id) {
            Some(cell) => cell,
            None => return,
        };

        let mut cache = cache_cell.borrow_mut();
        if let Some((head, tail)) = cache.take_all() {
            unsafe { self.free_list.push_segment(head, tail) };
        }
    }
}

/// A Lock-Free Pool of Objects of a single Type
///
/// The Pool never blocks on contention, all the synchronization on the hot
/// path is a handful of CAS-Loops. Memory grows in Chunks of roughly 64 KiB
/// and is only returned to the System when the last Handle to the Pool is
/// dropped.
///
/// Cloning a Pool is cheap and yields a second Handle to the same Pool.
pub struct ObjectPool<T>
where
    T: Send + 'static,
{
    shared: Arc<Shared<T>>,
}

impl<T> ObjectPool<T>
where
    T: Send + 'static,
{
    /// Creates a new Pool and pre-allocates its first Chunk
    ///
    /// # Note
    /// A failed pre-allocation is not an Error, the first `allocate` call
    /// simply retries and surfaces None if the System is still out of
    /// memory
    pub fn new() -> Self {
        let pool = Self {
            shared: Arc::new(Shared {
                free_list: CachePadded::new(FreeList::new()),
                chunks: LockFreeStack::new(),
                caches: ThreadStorage::new(),
                allocated: atomic::AtomicUsize::new(0),
                deallocated: atomic::AtomicUsize::new(0),
            }),
        };

        pool.shared.grow();
        pool
    }

    /// Moves the given Value into the Pool and returns an owning Handle to
    /// it, returns None only if the System-Allocator refused a new Chunk
    pub fn allocate(&self, value: T) -> Option<PoolBox<'_, T>> {
        let ptr = self.allocate_ptr(value)?;
        Some(PoolBox::new(ptr, self))
    }

    /// Moves the given Value into the Pool and returns the raw Payload-Ptr,
    /// returns a Null-Ptr only if the System-Allocator refused a new Chunk
    ///
    /// The returned Object must be released with [`deallocate_raw`] on the
    /// same Pool, [`allocate`] is the recommended interface for everything
    /// that does not need raw Ptrs.
    ///
    /// [`deallocate_raw`]: Self::deallocate_raw
    /// [`allocate`]: Self::allocate
    pub fn allocate_raw(&self, value: T) -> *mut T {
        match self.allocate_ptr(value) {
            Some(ptr) => ptr.as_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    /// Destroys the Object behind the Ptr and returns its Block to the Pool
    ///
    /// A Null-Ptr is ignored.
    ///
    /// # Safety
    /// The Ptr must have been returned by [`allocate_raw`] or
    /// [`PoolBox::into_raw`] on this Pool and must not be used afterwards
    ///
    /// [`allocate_raw`]: Self::allocate_raw
    pub unsafe fn deallocate_raw(&self, ptr: *mut T) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.release(ptr) };
        }
    }

    /// The total Number of Allocations served by this Pool
    ///
    /// The Counter is maintained with relaxed increments and may briefly
    /// disagree with the true count under contention.
    pub fn allocated_count(&self) -> usize {
        self.shared.allocated.load(atomic::Ordering::Relaxed)
    }

    /// The total Number of Deallocations handled by this Pool
    pub fn deallocated_count(&self) -> usize {
        self.shared.deallocated.load(atomic::Ordering::Relaxed)
    }

    /// The Number of Objects currently handed out
    pub fn active_count(&self) -> usize {
        self.allocated_count()
            .saturating_sub(self.deallocated_count())
    }

    fn allocate_ptr(&self, value: T) -> Option<NonNull<T>> {
        let block = self.acquire_block()?;

        let payload = unsafe { Block::payload(block) };
        unsafe { payload.as_ptr().write(value) };

        self.shared
            .allocated
            .fetch_add(1, atomic::Ordering::Relaxed);
        Some(payload)
    }

    fn acquire_block(&self) -> Option<NonNull<Block<T>>> {
        {
            let mut cache = self.cache_cell().borrow_mut();
            if let Some(block) = cache.try_pop() {
                return Some(block);
            }

            self.shared.refill(&mut cache);
            if let Some(block) = cache.try_pop() {
                return Some(block);
            }
        }

        // The Refill failed, try single Blocks straight from the global
        // List before giving up
        if let Some(block) = self.shared.free_list.pop() {
            return Some(block);
        }

        self.shared.grow();
        self.shared.free_list.pop()
    }

    unsafe fn release(&self, ptr: NonNull<T>) {
        unsafe { std::ptr::drop_in_place(ptr.as_ptr()) };

        let block = unsafe { Block::from_payload(ptr) };
        self.return_block(block);

        self.shared
            .deallocated
            .fetch_add(1, atomic::Ordering::Relaxed);
    }

    fn return_block(&self, block: NonNull<Block<T>>) {
        let mut cache = self.cache_cell().borrow_mut();

        if cache.len() >= Cache::<T>::HIGH_WATER {
            if let Some((head, tail)) = cache.drain_lower_half() {
                unsafe { self.shared.free_list.push_segment(head, tail) };
            }
        }

        // The freshly freed Block always goes to the residual Cache, never
        // into the spliced Segment
        if let Err(block) = cache.try_push(block) {
            unsafe { self.shared.free_list.push(block) };
        }
    }

    fn cache_cell(&self) -> &RefCell<Cache<T>> {
        self.shared.caches.get_or(|| {
            let shared_dyn: Arc<dyn FlushCaches> = self.shared.clone();
            let weak: Weak<dyn FlushCaches> = Arc::downgrade(&shared_dyn);
            handoff::register_current_thread(weak);

            RefCell::new(CacheSlots::new())
        })
    }
}

impl<T> Clone for ObjectPool<T>
where
    T: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for ObjectPool<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ObjectPool<T>
where
    T: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ObjectPool<{}> ( allocated = {}, deallocated = {} )",
            std::any::type_name::<T>(),
            self.allocated_count(),
            self.deallocated_count()
        )
    }
}
