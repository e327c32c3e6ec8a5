//! # Synchronization primitives for GPU memory objects
//!
//! - [`Mutex<T, R>`]: a lock generic over its raw locking strategy, whose
//!   [`MutexGuard`] can give the lock up for the duration of a closure
//!   ([`MutexGuard::unlocked`]) and take it back afterward.
//! - [`SpinMutex<T>`]: the same over a [`RawSpin`] lock word, used both for
//!   short critical sections such as allocator bitmaps and for per-object
//!   buffer state.
//!
//! The release/re-acquire guard exists for callers that must block while
//! holding per-object state: a buffer object waiting for physical memory
//! drops its own lock so that a concurrent purge or pin of the same object
//! can make progress, then re-validates its state once it holds the lock
//! again.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;

pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
