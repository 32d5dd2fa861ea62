use super::ObjectPool;

use std::ptr::NonNull;

/// An owning Handle to an Object living inside an [`ObjectPool`]
///
/// The Handle behaves like a [`Box`]: it derefs to the Object, moves but
/// never copies and returns the Object to its Pool when dropped. Assigning
/// a new Handle over an old one releases the old Object first.
pub struct PoolBox<'pool, T>
where
    T: Send + 'static,
{
    ptr: NonNull<T>,
    pool: &'pool ObjectPool<T>,
}

impl<'pool, T> PoolBox<'pool, T>
where
    T: Send + 'static,
{
    pub(super) fn new(ptr: NonNull<T>, pool: &'pool ObjectPool<T>) -> Self {
        Self { ptr, pool }
    }

    /// Releases the Ownership of the Object and returns the raw Ptr to it
    ///
    /// The Caller becomes responsible for returning the Object to the Pool
    /// via [`ObjectPool::deallocate_raw`]
    pub fn into_raw(boxed: Self) -> *mut T {
        let ptr = boxed.ptr.as_ptr();
        std::mem::forget(boxed);
        ptr
    }

    /// The Pool this Object lives in
    pub fn pool(boxed: &Self) -> &'pool ObjectPool<T> {
        boxed.pool
    }
}

impl<'pool, T> std::ops::Deref for PoolBox<'pool, T>
where
    T: Send + 'static,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { self.ptr.as_ref() }
    }
}

impl<'pool, T> std::ops::DerefMut for PoolBox<'pool, T>
where
    T: Send + 'static,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_mut() }
    }
}

impl<'pool, T> Drop for PoolBox<'pool, T>
where
    T: Send + 'static,
{
    fn drop(&mut self) {
        unsafe { self.pool.release(self.ptr) };
    }
}

impl<'pool, T> std::fmt::Debug for PoolBox<'pool, T>
where
    T: Send + 'static + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

unsafe impl<'pool, T> Send for PoolBox<'pool, T> where T: Send + 'static {}
unsafe impl<'pool, T> Sync for PoolBox<'pool, T> where T: Send + Sync + 'static {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn deref() {
        let pool = ObjectPool::new();

        let mut value = pool.allocate(3_u64).unwrap();
        assert_eq!(3, *value);

        *value += 1;
        assert_eq!(4, *value);
    }

    #[test]
    fn move_keeps_the_object() {
        let pool = ObjectPool::new();

        let first = pool.allocate(21_u64).unwrap();
        let addr = &*first as *const u64;

        let second = first;
        assert_eq!(addr, &*second as *const u64);
        assert_eq!(21, *second);
        assert_eq!(1, pool.active_count());
    }

    #[test]
    fn into_raw_leaks_to_the_caller() {
        let pool = ObjectPool::new();

        let value = pool.allocate(8_u32).unwrap();
        let raw = PoolBox::into_raw(value);

        assert_eq!(1, pool.active_count());
        unsafe { pool.deallocate_raw(raw) };
        assert_eq!(0, pool.active_count());
    }

    #[test]
    fn pool_accessor() {
        let pool = ObjectPool::new();

        let value = pool.allocate(1_u8).unwrap();
        assert_eq!(1, PoolBox::pool(&value).active_count());
    }
}
