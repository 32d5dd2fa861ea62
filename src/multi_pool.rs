//! A Lock-Free Multi-Size Pool-Allocator
//!
//! The Pool segregates raw byte requests into a fixed set of Size-Classes.
//! Every Class owns its own global Free-List and grows in 64 KiB Chunks,
//! every Thread keeps one small Cache per Class. Requests above the largest
//! Class are delegated to the System-Allocator.
//!
//! # Example
//! ```
//! use blockpool::multi_pool::MultiPool;
//!
//! let pool = MultiPool::new();
//!
//! let ptr = pool.allocate(100);
//! assert!(!ptr.is_null());
//!
//! unsafe { pool.deallocate(ptr, 100) };
//! ```

mod size_classes;
use size_classes::{block_size, class_count, class_index};

use crate::align::{align_up, MaxAligned, MAX_ALIGN};
use crate::cache::CacheSlots;
use crate::chunk::Chunk;
use crate::freelist::{FreeList, Link};
use crate::handoff::{self, FlushCaches};
use crate::stack::LockFreeStack;
use crate::sync::atomic;
use crate::thread_storage::ThreadStorage;

use crossbeam_utils::CachePadded;

use std::alloc::{GlobalAlloc, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

/// The target Byte-Size of a single Chunk
const CHUNK_SIZE: usize = 64 * 1024;
/// The Capacity of one per-Thread Class-Cache
const CACHE_CAPACITY: usize = 16;
/// The Number of Blocks moved from a global Free-List in one Refill
const REFILL_BATCH: usize = 8;

/// The Header sitting in front of every Payload handed out by the Pool
///
/// While the Block is free, the Header links it into a Cache or the global
/// Free-List of its Class. The Class of a Block never changes.
#[repr(C)]
struct BlockHeader {
    /// The Byte-Size of the Class this Block belongs to
    size: usize,
    next: atomic::AtomicPtr<BlockHeader>,
    _align: [MaxAligned; 0],
}

const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

impl BlockHeader {
    /// # Safety
    /// The Block must be backed by at least `HEADER_SIZE + size` Bytes
    unsafe fn payload(block: NonNull<Self>) -> *mut u8 {
        unsafe { (block.as_ptr() as *mut u8).add(HEADER_SIZE) }
    }

    /// # Safety
    /// The Ptr must have been produced by [`BlockHeader::payload`]
    unsafe fn from_payload(ptr: *mut u8) -> NonNull<Self> {
        unsafe { NonNull::new_unchecked(ptr.sub(HEADER_SIZE) as *mut Self) }
    }
}

impl Link for BlockHeader {
    fn next(&self) -> &atomic::AtomicPtr<Self> {
        &self.next
    }
}

type Cache = CacheSlots<BlockHeader, CACHE_CAPACITY>;
type ClassCaches = [Cache; class_count()];

/// The global state of one Size-Class
struct SizeClass {
    free_list: FreeList<BlockHeader>,
    block_size: usize,
    allocated: atomic::AtomicUsize,
    deallocated: atomic::AtomicUsize,
}

impl SizeClass {
    fn new(block_size: usize) -> Self {
        Self {
            free_list: FreeList::new(),
            block_size,
            allocated: atomic::AtomicUsize::new(0),
            deallocated: atomic::AtomicUsize::new(0),
        }
    }
}

struct Shared {
    classes: [CachePadded<SizeClass>; class_count()],
    chunks: LockFreeStack<Chunk>,
    caches: ThreadStorage<RefCell<ClassCaches>>,
}

impl Shared {
    /// Allocates a new Chunk for the given Class, carves it into Blocks and
    /// splices all of them onto the Class's Free-List, returns false if the
    /// System-Allocator refused the request
    fn grow_class(&self, index: usize) -> bool {
        let block_size = self.classes[index].block_size;
        let stride = align_up(HEADER_SIZE + block_size, MAX_ALIGN);
        let count = std::cmp::max(1, CHUNK_SIZE / stride);

        let layout = match Layout::from_size_align(stride * count, MAX_ALIGN) {
            Ok(layout) => layout,
            Err(_) => return false,
        };
        let chunk = match Chunk::new(layout) {
            Some(chunk) => chunk,
            None => return false,
        };

        let base = chunk.as_ptr();

        // Thread all the Blocks together while they are still private to
        // this call, the splice-CAS below is the single release point that
        // makes them reachable
        for i in 0..count {
            let header = unsafe { base.add(i * stride) } as *mut BlockHeader;
            let next = if i + 1 < count {
                (unsafe { base.add((i + 1) * stride) }) as *mut BlockHeader
            } else {
                std::ptr::null_mut()
            };

            unsafe {
                std::ptr::addr_of_mut!((*header).size).write(block_size);
                std::ptr::addr_of_mut!((*header).next).write(atomic::AtomicPtr::new(next));
            }
        }

        let head = unsafe { NonNull::new_unchecked(base as *mut BlockHeader) };
        let tail = unsafe { NonNull::new_unchecked(base.add((count - 1) * stride) as *mut BlockHeader) };
        unsafe { self.classes[index].free_list.push_segment(head, tail) };

        self.chunks.push(chunk);

        log::debug!(
            "allocated a new Chunk with {} Blocks for Size-Class {}",
            count,
            block_size
        );
        true
    }

    /// Moves a Batch of Blocks from the Class's Free-List into the given
    /// Cache, allocating a new Chunk once if the List is empty
    fn fill_class_cache(&self, index: usize, cache: &mut Cache) -> bool {
        let class = &self.classes[index];

        let segment = match class.free_list.pop_batch(REFILL_BATCH) {
            Some(segment) => segment,
            None => {
                if !self.grow_class(index) {
                    return false;
                }
                match class.free_list.pop_batch(REFILL_BATCH) {
                    Some(segment) => segment,
                    None => return false,
                }
            }
        };

        for block in segment.iter() {
            cache.try_push(block).expect(
                "the Cache is empty before a Refill and a Batch never exceeds the Cache-Capacity",
            );
        }
        true
    }
}

impl FlushCaches for Shared {
    fn flush_thread(&self, thread_id: u64) {
        let caches = match self.caches.get(thread_id) {
            Some(cell) => cell,
            None => return,
        };

        let mut caches = caches.borrow_mut();
        for (index, cache) in caches.iter_mut().enumerate() {
            if let Some((head, tail)) = cache.take_all() {
                unsafe { self.classes[index].free_list.push_segment(head, tail) };
            }
        }
    }
}

/// The per-Class Counters reported by [`MultiPool::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    /// The Byte-Size of the Class
    pub block_size: usize,
    /// The Number of Allocations served from this Class
    pub allocated: usize,
    /// The Number of Deallocations handled by this Class
    pub deallocated: usize,
}

/// A Lock-Free Pool-Allocator segregating requests into fixed Size-Classes
///
/// Requests are rounded up to the Alignment-Unit and mapped to the smallest
/// Class that fits, requests above the largest Class (2 KiB) are served by
/// the System-Allocator directly. The Pool never blocks on contention.
///
/// Cloning a Pool is cheap and yields a second Handle to the same Pool.
///
/// # Note
/// The Pool does not satisfy the general Allocator contract of the
/// platform: a Deallocation must go back through the Pool that produced the
/// Ptr and must pass the allocated (or a Class-compatible) Size.
pub struct MultiPool {
    shared: Arc<Shared>,
}

impl MultiPool {
    /// Creates a new Pool, Chunks are only allocated once a Class is first
    /// used
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                classes: std::array::from_fn(|index| {
                    CachePadded::new(SizeClass::new(block_size(index)))
                }),
                chunks: LockFreeStack::new(),
                caches: ThreadStorage::new(),
            }),
        }
    }

    /// Allocates `size` Bytes and returns the Payload-Ptr, aligned to the
    /// maximum scalar Alignment (16 Bytes)
    ///
    /// Returns a Null-Ptr if `size` is zero or the System-Allocator refused
    /// the request.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 || size > usize::MAX - MAX_ALIGN {
            return std::ptr::null_mut();
        }

        let aligned = align_up(size, MAX_ALIGN);
        match class_index(aligned) {
            Some(index) => self.allocate_class(index),
            None => {
                let layout = match Layout::from_size_align(aligned, MAX_ALIGN) {
                    Ok(layout) => layout,
                    Err(_) => return std::ptr::null_mut(),
                };
                unsafe { std::alloc::System.alloc(layout) }
            }
        }
    }

    /// Returns an Allocation to the Pool
    ///
    /// A Null-Ptr is ignored.
    ///
    /// # Safety
    /// The Ptr must have been returned by [`allocate`] on this Pool with
    /// the same `size` (or any Size mapping to the same Class) and must not
    /// be used afterwards
    ///
    /// [`allocate`]: Self::allocate
    pub unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }

        let aligned = align_up(size, MAX_ALIGN);
        match class_index(aligned) {
            Some(index) => self.deallocate_class(index, ptr),
            None => {
                let layout = Layout::from_size_align(aligned, MAX_ALIGN)
                    .expect("the Layout was already validated when the Allocation was made");
                unsafe { std::alloc::System.dealloc(ptr, layout) };
            }
        }
    }

    /// Moves the given Value into the Pool and returns the typed Ptr to it,
    /// returns None if the Allocation failed or `T` is zero-sized
    ///
    /// # Panics
    /// Panics if the Alignment of `T` exceeds the maximum scalar Alignment
    /// (16 Bytes)
    pub fn create<T>(&self, value: T) -> Option<NonNull<T>>
    where
        T: Send,
    {
        assert!(
            std::mem::align_of::<T>() <= MAX_ALIGN,
            "the Pool only hands out Payloads aligned to {} Bytes",
            MAX_ALIGN
        );

        let ptr = NonNull::new(self.allocate(std::mem::size_of::<T>()) as *mut T)?;
        unsafe { ptr.as_ptr().write(value) };

        Some(ptr)
    }

    /// Destroys the Object behind the Ptr and returns its Block to the Pool
    ///
    /// # Safety
    /// The Ptr must have been returned by [`create`] on this Pool and must
    /// not be used afterwards
    ///
    /// [`create`]: Self::create
    pub unsafe fn destroy<T>(&self, ptr: NonNull<T>)
    where
        T: Send,
    {
        unsafe { std::ptr::drop_in_place(ptr.as_ptr()) };
        unsafe { self.deallocate(ptr.as_ptr() as *mut u8, std::mem::size_of::<T>()) };
    }

    /// A Snapshot of the per-Class Allocation-Counters
    ///
    /// The Counters are maintained with relaxed increments and may briefly
    /// disagree with the true counts under contention.
    pub fn stats(&self) -> Vec<ClassStats> {
        self.shared
            .classes
            .iter()
            .map(|class| ClassStats {
                block_size: class.block_size,
                allocated: class.allocated.load(atomic::Ordering::Relaxed),
                deallocated: class.deallocated.load(atomic::Ordering::Relaxed),
            })
            .collect()
    }

    /// Emits the per-Class Counters through the `log` Facade, one Line per
    /// Class
    ///
    /// Nothing is written unless the embedding Program installed a Logger.
    pub fn print_stats(&self) {
        log::info!("=== Memory Pool Statistics ===");
        for stats in self.stats() {
            log::info!(
                "Size class {}: allocated: {}, deallocated: {}",
                stats.block_size,
                stats.allocated,
                stats.deallocated
            );
        }
    }

    fn allocate_class(&self, index: usize) -> *mut u8 {
        let class = &self.shared.classes[index];

        let block = {
            let mut caches = self.cache_cell().borrow_mut();
            let cache = &mut caches[index];

            match cache.try_pop() {
                Some(block) => Some(block),
                None => {
                    if self.shared.fill_class_cache(index, cache) {
                        cache.try_pop()
                    } else {
                        None
                    }
                }
            }
        };

        // The Cache could not be filled, try single Blocks straight from
        // the global List before giving up
        let block = block.or_else(|| {
            class.free_list.pop().or_else(|| {
                self.shared.grow_class(index);
                class.free_list.pop()
            })
        });

        match block {
            Some(block) => {
                class.allocated.fetch_add(1, atomic::Ordering::Relaxed);
                unsafe { BlockHeader::payload(block) }
            }
            None => std::ptr::null_mut(),
        }
    }

    fn deallocate_class(&self, index: usize, ptr: *mut u8) {
        let class = &self.shared.classes[index];
        let block = unsafe { BlockHeader::from_payload(ptr) };
        debug_assert_eq!(class.block_size, unsafe { block.as_ref() }.size);

        {
            let mut caches = self.cache_cell().borrow_mut();
            let cache = &mut caches[index];

            if cache.len() >= Cache::HIGH_WATER {
                if let Some((head, tail)) = cache.drain_lower_half() {
                    unsafe { class.free_list.push_segment(head, tail) };
                }
            }

            // The freshly freed Block always goes to the residual Cache,
            // never into the spliced Segment
            if let Err(block) = cache.try_push(block) {
                unsafe { class.free_list.push(block) };
            }
        }

        class.deallocated.fetch_add(1, atomic::Ordering::Relaxed);
    }

    fn cache_cell(&self) -> &RefCell<ClassCaches> {
        self.shared.caches.get_or(|| {
            let shared_dyn: Arc<dyn FlushCaches> = self.shared.clone();
            let weak: Weak<dyn FlushCaches> = Arc::downgrade(&shared_dyn);
            handoff::register_current_thread(weak);

            RefCell::new(std::array::from_fn(|_| CacheSlots::new()))
        })
    }
}

impl Clone for MultiPool {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Default for MultiPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MultiPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MultiPool ( {} Size-Classes )", class_count())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn new() {
        MultiPool::new();
    }

    #[test]
    fn allocate_zero_is_null() {
        let pool = MultiPool::new();
        assert!(pool.allocate(0).is_null());
    }

    #[test]
    fn allocate_round_trip() {
        let pool = MultiPool::new();

        let ptr = pool.allocate(64);
        assert!(!ptr.is_null());

        unsafe {
            std::ptr::write_bytes(ptr, 0xcd, 64);
            assert_eq!(0xcd, *ptr);
            assert_eq!(0xcd, *ptr.add(63));

            pool.deallocate(ptr, 64);
        }
    }

    #[test]
    fn payloads_are_max_aligned() {
        let pool = MultiPool::new();

        for size in [1, 8, 24, 100, 1024, 2048, 5000] {
            let ptr = pool.allocate(size);
            assert!(!ptr.is_null());
            assert_eq!(0, ptr as usize % MAX_ALIGN, "size {}", size);
            unsafe { pool.deallocate(ptr, size) };
        }
    }

    #[test]
    fn lifo_reuse_within_thread() {
        let pool = MultiPool::new();

        let ptr = pool.allocate(128);
        unsafe { pool.deallocate(ptr, 128) };

        let again = pool.allocate(128);
        assert_eq!(ptr, again);
        unsafe { pool.deallocate(again, 128) };
    }

    #[test]
    fn oversized_goes_to_the_system() {
        let pool = MultiPool::new();

        let ptr = pool.allocate(5000);
        assert!(!ptr.is_null());
        unsafe {
            std::ptr::write_bytes(ptr, 0xee, 5000);
            pool.deallocate(ptr, 5000);
        }

        // Nothing above the largest Class touches the Class-Counters
        assert!(pool.stats().iter().all(|stats| stats.allocated == 0));
    }

    #[test]
    fn create_destroy() {
        let pool = MultiPool::new();

        let value = pool.create(1234_u64).unwrap();
        assert_eq!(1234, unsafe { *value.as_ref() });

        unsafe { pool.destroy(value) };
    }

    #[test]
    fn create_runs_no_drop_twice() {
        let marker = std::sync::Arc::new(0_usize);
        let pool = MultiPool::new();

        let value = pool.create(marker.clone()).unwrap();
        assert_eq!(2, std::sync::Arc::strong_count(&marker));

        unsafe { pool.destroy(value) };
        assert_eq!(1, std::sync::Arc::strong_count(&marker));
    }

    #[test]
    fn create_zero_sized_is_none() {
        let pool = MultiPool::new();
        assert!(pool.create(()).is_none());
    }

    #[test]
    fn stats_track_classes() {
        let pool = MultiPool::new();

        let ptr = pool.allocate(100);
        let stats = pool.stats();

        // 100 Bytes round up to the 128-Byte Class
        let class = stats.iter().find(|s| s.block_size == 128).unwrap();
        assert_eq!(1, class.allocated);
        assert_eq!(0, class.deallocated);

        unsafe { pool.deallocate(ptr, 100) };
        let stats = pool.stats();
        let class = stats.iter().find(|s| s.block_size == 128).unwrap();
        assert_eq!(1, class.deallocated);
    }
}
