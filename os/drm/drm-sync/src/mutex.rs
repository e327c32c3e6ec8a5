use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
    _no_send_sync: PhantomData<*mut ()>, // !Send/!Sync by default; we implement below
}

unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
            _no_send_sync: PhantomData,
        }
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard { m: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.raw_try_lock() {
            Some(MutexGuard { m: self })
        } else {
            None
        }
    }

    /// Run `f` with the lock held; the lock is released even if `f` unwinds.
    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.lock())
    }

    /// Snapshot of the lock state; only meaningful for assertions.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.raw_is_locked()
    }
}

pub struct MutexGuard<'a, T, R>
where
    R: RawUnlock,
{
    m: &'a Mutex<T, R>,
}

impl<'a, T, R> MutexGuard<'a, T, R>
where
    R: RawLock + RawUnlock,
{
    /// Release the lock while `f` runs and re-acquire it before returning.
    ///
    /// The guard is borrowed mutably for the duration, so the protected data
    /// cannot be touched while the lock is not held. Anything read before the
    /// call may be stale afterward; callers re-validate.
    ///
    /// The lock is re-acquired even if `f` unwinds.
    pub fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U {
        struct Relock<'b, R: RawLock>(&'b R);

        impl<R: RawLock> Drop for Relock<'_, R> {
            fn drop(&mut self) {
                self.0.raw_lock();
            }
        }

        // SAFETY: the guard proves we hold the lock.
        unsafe { self.m.raw.raw_unlock() };
        let _relock = Relock(&self.m.raw);
        f()
    }

    /// The mutex this guard belongs to.
    #[inline]
    pub const fn mutex(&self) -> &'a Mutex<T, R> {
        self.m
    }
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn drop(&mut self) {
        unsafe { self.m.raw.raw_unlock() }
    }
}
