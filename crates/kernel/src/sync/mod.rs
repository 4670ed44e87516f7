//! Synchronization primitives.
//!
//! [`spinlock`] is the only busy-waiting primitive; everything else blocks
//! through the scheduler and takes a tick timeout (`0` = forever).

pub mod condvar;
pub mod mailbox;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;
pub mod timer;

#[cfg(test)]
mod tests;

pub use condvar::KCondVar;
pub use mailbox::KMailBox;
pub use mutex::KMutex;
pub use semaphore::KSemaphore;
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard, spin_lock};
pub use timer::KTimer;
