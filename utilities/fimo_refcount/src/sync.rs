//! Synchronization primitives used by the reference counters.
mod spin_lock;
mod spin_wait;

pub use parking_lot::lock_api::RawMutex;
pub use spin_lock::{SpinLock, SpinMutex, SpinMutexGuard};
pub use spin_wait::SpinWait;
