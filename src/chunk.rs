//! The raw memory Chunks backing the Pools

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

/// An owned contiguous byte Buffer obtained from the System-Allocator
///
/// A Chunk is carved into equally sized Blocks by its Pool right after the
/// allocation and is structurally immutable afterwards, the Blocks inside
/// it never merge, split or move. The backing memory is only returned to
/// the System when the Chunk is dropped, which the owning Pool delays until
/// its own destruction.
pub struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Chunk {
    /// Attempts to allocate a new Chunk for the given Layout, returns None
    /// if the System-Allocator refuses the request
    pub fn new(layout: Layout) -> Option<Self> {
        let raw = unsafe { std::alloc::System.alloc(layout) };

        NonNull::new(raw).map(|ptr| Self { ptr, layout })
    }

    /// The Start-Address of the Buffer
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The Size of the Buffer in Bytes
    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { std::alloc::System.dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chunk ( {:p}, {} bytes )", self.ptr, self.layout.size())
    }
}

unsafe impl Send for Chunk {}
