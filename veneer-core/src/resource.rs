//! Reference counting and GPU use tracking.
//!
//! Every resource carries a single 64-bit atomic use counter with three
//! fields: the reference count in bits 0..24, the pending-read count in
//! bits 24..44 and the pending-write count in bits 44..64. One atomic
//! add or sub handles any combination of lifetime and access tracking,
//! and a single load answers "is this resource still in use".

use std::{
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::Access;

const RD_ACCESS_SHIFT: u64 = 24;
const WR_ACCESS_SHIFT: u64 = 44;

const REFCOUNT_INC: u64 = 1;
const RD_ACCESS_INC: u64 = 1 << RD_ACCESS_SHIFT;
const WR_ACCESS_INC: u64 = 1 << WR_ACCESS_SHIFT;

const RD_ACCESS_MASK: u64 = ((1 << (WR_ACCESS_SHIFT - RD_ACCESS_SHIFT)) - 1) << RD_ACCESS_SHIFT;
const WR_ACCESS_MASK: u64 = !((1 << WR_ACCESS_SHIFT) - 1);

const fn increment(access: Access) -> u64 {
    match access {
        Access::None => REFCOUNT_INC,
        Access::Read => REFCOUNT_INC | RD_ACCESS_INC,
        Access::Write => REFCOUNT_INC | WR_ACCESS_INC,
    }
}

/// Combined reference count and GPU use counter.
#[derive(Debug)]
pub struct UseCount(AtomicU64);

impl UseCount {
    /// Creates a counter with an initial reference count of one.
    pub fn new() -> Self {
        Self(AtomicU64::new(REFCOUNT_INC))
    }

    pub fn acquire(&self, access: Access) {
        self.0.fetch_add(increment(access), Ordering::Acquire);
    }

    /// Decrements the counter. Returns `true` if it reached zero, in
    /// which case the caller must free the resource.
    #[must_use]
    pub fn release(&self, access: Access) -> bool {
        let increment = increment(access);
        self.0.fetch_sub(increment, Ordering::Release) == increment
    }

    /// Converts a tracked reference from one access type to another
    /// with a single atomic operation.
    pub fn convert(&self, from: Access, to: Access) {
        let delta = increment(to).wrapping_sub(increment(from));

        if delta != 0 {
            self.0.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Checks for pending GPU accesses. Checking for reads also returns
    /// `true` while a write is pending.
    pub fn is_in_use(&self, access: Access) -> bool {
        let mask = match access {
            Access::None => u64::MAX,
            Access::Read => WR_ACCESS_MASK | RD_ACCESS_MASK,
            Access::Write => WR_ACCESS_MASK,
        };

        self.0.load(Ordering::Acquire) & mask != 0
    }
}

/// Process-unique resource cookie.
///
/// Identifies an object even when its lifetime is unknown and without
/// referencing the object itself.
pub fn new_cookie() -> u64 {
    static COOKIE: AtomicU64 = AtomicU64::new(1);
    COOKIE.fetch_add(1, Ordering::Relaxed)
}

/// A reference-counted resource.
///
/// # Safety
///
/// `free` must release the storage of `this` exactly once and must not
/// access it afterwards. The use counter returned by `use_count` must be
/// owned by the object itself.
pub unsafe trait Resource {
    fn use_count(&self) -> &UseCount;

    /// Called exactly once when the use count reaches zero.
    unsafe fn free(this: NonNull<Self>);
}

/// Intrusive reference-counted handle.
///
/// Cloning and dropping map to `acquire(None)` / `release(None)` on the
/// resource's use counter; the handle that performs the final release
/// frees the resource.
pub struct Ref<T: Resource> {
    ptr: NonNull<T>,
}

unsafe impl<T: Resource + Send + Sync> Send for Ref<T> {}
unsafe impl<T: Resource + Send + Sync> Sync for Ref<T> {}

impl<T: Resource> Ref<T> {
    /// Moves `value` to the heap and returns the initial reference.
    ///
    /// `value`'s use counter must have been created with
    /// [`UseCount::new`], which accounts for this reference.
    pub fn new(value: T) -> Self {
        Self {
            ptr: NonNull::from(Box::leak(Box::new(value))),
        }
    }

    /// Adopts an already-counted pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live resource whose use counter includes
    /// the reference being adopted.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self { ptr }
    }

    /// Clones the handle while also tracking a pending GPU access,
    /// with a single atomic operation.
    pub fn clone_for_access(&self, access: Access) -> TrackedRef<T> {
        self.use_count().acquire(access);
        TrackedRef {
            reference: Self { ptr: self.ptr },
            access,
        }
    }

    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    fn release(ptr: NonNull<T>, access: Access) {
        unsafe {
            if ptr.as_ref().use_count().release(access) {
                T::free(ptr);
            }
        }
    }
}

impl<T: Resource> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Resource> Clone for Ref<T> {
    fn clone(&self) -> Self {
        self.use_count().acquire(Access::None);
        Self { ptr: self.ptr }
    }
}

impl<T: Resource> Drop for Ref<T> {
    fn drop(&mut self) {
        Self::release(self.ptr, Access::None);
    }
}

impl<T: Resource + std::fmt::Debug> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}

/// A reference that additionally tracks a pending GPU access, as stored
/// by command lists. Releasing it undoes both with one atomic operation.
pub struct TrackedRef<T: Resource> {
    reference: Ref<T>,
    access: Access,
}

impl<T: Resource> TrackedRef<T> {
    pub fn access(&self) -> Access {
        self.access
    }

    pub fn resource(&self) -> &T {
        &self.reference
    }

    /// Releases the tracked access together with the reference.
    pub fn release(self) {
        let this = std::mem::ManuallyDrop::new(self);
        Ref::release(this.reference.ptr, this.access);
    }
}

impl<T: Resource> Drop for TrackedRef<T> {
    fn drop(&mut self) {
        // Safety net for dropped tracking entries; the normal path goes
        // through release() which consumes self.
        self.reference.use_count().convert(self.access, Access::None);
        self.access = Access::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct TestResource {
        count: UseCount,
        freed: &'static AtomicBool,
    }

    unsafe impl Resource for TestResource {
        fn use_count(&self) -> &UseCount {
            &self.count
        }

        unsafe fn free(this: NonNull<Self>) {
            let boxed = Box::from_raw(this.as_ptr());
            boxed.freed.store(true, Ordering::Release);
        }
    }

    fn leak_flag() -> &'static AtomicBool {
        Box::leak(Box::new(AtomicBool::new(false)))
    }

    #[test]
    fn acquire_release_is_symmetric() {
        let count = UseCount::new();

        for access in [Access::None, Access::Read, Access::Write] {
            count.acquire(access);
            assert!(!count.release(access));
        }

        assert!(!count.is_in_use(Access::Read));
        assert!(count.release(Access::None));
    }

    #[test]
    fn write_implies_read_in_use() {
        let count = UseCount::new();

        count.acquire(Access::Write);
        assert!(count.is_in_use(Access::Write));
        assert!(count.is_in_use(Access::Read));

        let _ = count.release(Access::Write);
        assert!(!count.is_in_use(Access::Read));
    }

    #[test]
    fn read_does_not_imply_write() {
        let count = UseCount::new();

        count.acquire(Access::Read);
        assert!(count.is_in_use(Access::Read));
        assert!(!count.is_in_use(Access::Write));

        let _ = count.release(Access::Read);
    }

    #[test]
    fn convert_read_to_write() {
        let count = UseCount::new();

        count.acquire(Access::Read);
        count.convert(Access::Read, Access::Write);

        assert!(count.is_in_use(Access::Write));
        assert!(!count.release(Access::Write));
        assert!(count.release(Access::None));
    }

    #[test]
    fn frees_exactly_once_on_last_release() {
        let freed = leak_flag();
        let resource = Ref::new(TestResource {
            count: UseCount::new(),
            freed,
        });

        let clone = resource.clone();
        let tracked = resource.clone_for_access(Access::Write);

        assert!(resource.use_count().is_in_use(Access::Write));

        drop(resource);
        drop(clone);
        assert!(!freed.load(Ordering::Acquire));

        tracked.release();
        assert!(freed.load(Ordering::Acquire));
    }

    #[test]
    fn tracked_release_clears_access() {
        let freed = leak_flag();
        let resource = Ref::new(TestResource {
            count: UseCount::new(),
            freed,
        });

        let tracked = resource.clone_for_access(Access::Read);
        assert!(resource.use_count().is_in_use(Access::Read));

        tracked.release();
        assert!(!resource.use_count().is_in_use(Access::Read));
        assert!(!freed.load(Ordering::Acquire));

        drop(resource);
        assert!(freed.load(Ordering::Acquire));
    }

    #[test]
    fn cookies_are_unique() {
        let a = new_cookie();
        let b = new_cookie();
        assert_ne!(a, b);
    }
}
