use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Lock word behind [`SpinMutex`](crate::SpinMutex).
///
/// Test-and-test-and-set: contended waiters spin on a plain load and only
/// retry the exchange once the holder has released.
#[derive(Debug, Default)]
pub struct RawSpin(AtomicBool);

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }
}

impl RawLock for RawSpin {
    fn raw_lock(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.0.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    fn raw_try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn raw_is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl RawUnlock for RawSpin {
    unsafe fn raw_unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}
