//! The global Lock-Free Free-List that every Size-Class is built around
//!
//! The List is an intrusive Treiber-Stack: the Head is a single Atomic-Ptr
//! and every free Block carries the Ptr to its successor inside itself.
//!
//! # ABA
//! The Head is deliberately a plain single-word Ptr without a Tag. This is
//! sound here because of two invariants the Pools uphold:
//! * a Block's next-Ptr is only ever written while the Block sits on a
//!   List (the global Free-List or a Thread-Cache being linked for a
//!   splice), never while it is handed out
//! * Chunk memory is never returned to the System while the Pool is alive
//!
//! A Head-Value that reappears after a concurrent pop/push pair therefore
//! still names the same logical Node with an unchanged next-Ptr, so a CAS
//! that observes it cannot splice the List onto a stale successor.

use crate::sync::atomic;
use std::ptr::NonNull;

/// Implemented by the Block-Header Types that can be linked into a
/// [`FreeList`]
pub trait Link: Sized {
    /// Accessor for the intrusive next-Ptr of this Block
    fn next(&self) -> &atomic::AtomicPtr<Self>;
}

/// The Head of the singly-linked List of free Blocks for one Size-Class
pub struct FreeList<L> {
    head: atomic::AtomicPtr<L>,
}

impl<L> FreeList<L>
where
    L: Link,
{
    /// Creates a new empty Free-List
    pub fn new() -> Self {
        Self {
            head: atomic::AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Attempts to pop a single Block from the List, returns None if the
    /// List is empty
    pub fn pop(&self) -> Option<NonNull<L>> {
        let mut old_head = self.head.load(atomic::Ordering::Acquire);
        loop {
            if old_head.is_null() {
                return None;
            }

            let next = unsafe { &*old_head }.next().load(atomic::Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                old_head,
                next,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => return NonNull::new(old_head),
                Err(other) => {
                    old_head = other;
                }
            };
        }
    }

    /// Attempts to pop a run of up to `max` Blocks from the List in a
    /// single CAS, returns None if the List is empty
    ///
    /// # Behaviour
    /// The Head is walked up to `max - 1` next-Links to find the Tail of
    /// the run, then the Head is swung past the Tail in one CAS. The
    /// returned Segment keeps its internal linkage so the Caller can walk
    /// the Blocks afterwards.
    pub fn pop_batch(&self, max: usize) -> Option<Segment<L>> {
        debug_assert!(max > 0);

        let mut old_head = self.head.load(atomic::Ordering::Acquire);
        loop {
            let head = NonNull::new(old_head)?;

            let mut tail = old_head;
            for _ in 0..max - 1 {
                let next = unsafe { &*tail }.next().load(atomic::Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                tail = next;
            }
            let new_head = unsafe { &*tail }.next().load(atomic::Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                old_head,
                new_head,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Segment {
                        head,
                        end: new_head,
                    })
                }
                Err(other) => {
                    old_head = other;
                }
            };
        }
    }

    /// Pushes a single Block onto the List
    ///
    /// # Safety
    /// The Block must be valid for the lifetime of the List and must not be
    /// reachable from any other List or Cache
    pub unsafe fn push(&self, block: NonNull<L>) {
        // A single Block is a Segment of length one
        unsafe { self.push_segment(block, block) };
    }

    /// Splices an already linked run of Blocks onto the List in a single
    /// CAS, with `head` becoming the new List-Head
    ///
    /// # Safety
    /// The run must be fully linked from `head` to `tail`, every Block in
    /// it must be valid for the lifetime of the List and none of them may
    /// be reachable from any other List or Cache. The CAS installing the
    /// new Head is the release point that publishes all the Links
    pub unsafe fn push_segment(&self, head: NonNull<L>, tail: NonNull<L>) {
        let mut old_head = self.head.load(atomic::Ordering::Relaxed);
        loop {
            unsafe { tail.as_ref() }
                .next()
                .store(old_head, atomic::Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                old_head,
                head.as_ptr(),
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
}

impl<L> std::fmt::Debug for FreeList<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FreeList<{}>", std::any::type_name::<L>())
    }
}

/// A detached run of Blocks popped from a [`FreeList`], spanning from
/// `head` up to but excluding `end`
pub struct Segment<L> {
    head: NonNull<L>,
    end: *mut L,
}

impl<L> Segment<L>
where
    L: Link,
{
    /// Iterates over the Blocks of the Segment in List-Order
    pub fn iter(&self) -> SegmentIter<'_, L> {
        SegmentIter {
            current: self.head.as_ptr(),
            end: self.end,
            _marker: std::marker::PhantomData,
        }
    }
}

/// The Iterator over the Blocks of a [`Segment`]
pub struct SegmentIter<'seg, L> {
    current: *mut L,
    end: *mut L,
    _marker: std::marker::PhantomData<&'seg Segment<L>>,
}

impl<'seg, L> Iterator for SegmentIter<'seg, L>
where
    L: Link,
{
    type Item = NonNull<L>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.end {
            return None;
        }

        let current = NonNull::new(self.current)?;
        // The Segment is owned by us after the pop-CAS and next-Ptrs are
        // only written while a Block is on a List, so this walk observes
        // the linkage exactly as it was popped
        self.current = unsafe { current.as_ref() }
            .next()
            .load(atomic::Ordering::Relaxed);

        Some(current)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    struct TestNode {
        value: usize,
        next: atomic::AtomicPtr<Self>,
    }

    impl TestNode {
        fn alloc(value: usize) -> NonNull<Self> {
            let boxed = Box::new(Self {
                value,
                next: atomic::AtomicPtr::new(std::ptr::null_mut()),
            });
            NonNull::new(Box::into_raw(boxed)).unwrap()
        }

        unsafe fn release(ptr: NonNull<Self>) {
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }

    impl Link for TestNode {
        fn next(&self) -> &atomic::AtomicPtr<Self> {
            &self.next
        }
    }

    #[test]
    fn pop_empty() {
        let list = FreeList::<TestNode>::new();
        assert!(list.pop().is_none());
    }

    #[test]
    fn push_pop() {
        let list = FreeList::new();

        let node = TestNode::alloc(13);
        unsafe { list.push(node) };

        let popped = list.pop().unwrap();
        assert_eq!(node, popped);
        assert_eq!(13, unsafe { popped.as_ref() }.value);
        assert!(list.pop().is_none());

        unsafe { TestNode::release(popped) };
    }

    #[test]
    fn pop_is_lifo() {
        let list = FreeList::new();

        let first = TestNode::alloc(1);
        let second = TestNode::alloc(2);
        unsafe { list.push(first) };
        unsafe { list.push(second) };

        assert_eq!(Some(second), list.pop());
        assert_eq!(Some(first), list.pop());
        assert_eq!(None, list.pop());

        unsafe { TestNode::release(first) };
        unsafe { TestNode::release(second) };
    }

    #[test]
    fn pop_batch_takes_run() {
        let list = FreeList::new();

        let nodes: Vec<_> = (0..6).map(TestNode::alloc).collect();
        for node in nodes.iter() {
            unsafe { list.push(*node) };
        }

        let segment = list.pop_batch(4).unwrap();
        let values: Vec<_> = segment
            .iter()
            .map(|n| unsafe { n.as_ref() }.value)
            .collect();
        assert_eq!(vec![5, 4, 3, 2], values);

        // The remainder is still on the List
        assert_eq!(1, unsafe { list.pop().unwrap().as_ref() }.value);
        assert_eq!(0, unsafe { list.pop().unwrap().as_ref() }.value);
        assert!(list.pop().is_none());

        for node in nodes {
            unsafe { TestNode::release(node) };
        }
    }

    #[test]
    fn pop_batch_short_list() {
        let list = FreeList::new();

        let node = TestNode::alloc(7);
        unsafe { list.push(node) };

        let segment = list.pop_batch(8).unwrap();
        assert_eq!(1, segment.iter().count());
        assert!(list.pop().is_none());

        unsafe { TestNode::release(node) };
    }

    #[test]
    fn push_segment_keeps_order() {
        let list = FreeList::new();

        let first = TestNode::alloc(1);
        let second = TestNode::alloc(2);
        unsafe { first.as_ref() }
            .next
            .store(second.as_ptr(), atomic::Ordering::Relaxed);

        unsafe { list.push_segment(first, second) };

        assert_eq!(Some(first), list.pop());
        assert_eq!(Some(second), list.pop());
        assert_eq!(None, list.pop());

        unsafe { TestNode::release(first) };
        unsafe { TestNode::release(second) };
    }
}
