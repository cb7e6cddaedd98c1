use super::spin_wait::SpinWait;
use parking_lot::lock_api::{self, GuardSend, RawMutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// A minimal test-and-test-and-set lock for very short critical sections.
///
/// Waiting threads spin with an exponential backoff and start yielding their time slice once
/// the lock stays contended. The lock is neither fair nor reentrant: locking it twice from
/// the same thread deadlocks.
///
/// The raw lock is usually used through [`SpinMutex`], or directly through the
/// [`RawMutex`] trait.
#[derive(Debug)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates a new unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for SpinLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

// Safety: The lock is only acquired by the compare-exchange from `false` to `true`, which
// happens at most once until the holder stores `false` again.
unsafe impl RawMutex for SpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = SpinLock::new();

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        let mut wait = SpinWait::new();
        while !self.try_lock() {
            // Spin on a plain load to keep the cache line shared while the lock is held.
            while self.is_locked() {
                wait.spin();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        let was_locked = self.locked.swap(false, Ordering::Release);
        contract_assert!(was_locked, "attempted to unlock a spin lock that is not locked");
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// A mutual exclusion primitive protecting its data with a [`SpinLock`].
pub type SpinMutex<T> = lock_api::Mutex<SpinLock, T>;

/// RAII guard of a locked [`SpinMutex`].
pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, SpinLock, T>;
