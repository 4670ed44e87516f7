//! Condition variables, paired with a [`KMutex`].

use core::cell::UnsafeCell;

use crate::sched;
use crate::sync::mutex::KMutex;
use crate::sync::spinlock::RawSpinLock;
use crate::task::{Task, TaskState};
use crate::utils::list::List;

pub struct KCondVar {
    raw: RawSpinLock,
    waiters: UnsafeCell<List<Task>>,
}

unsafe impl Send for KCondVar {}
unsafe impl Sync for KCondVar {}

impl KCondVar {
    pub const fn new(name: &'static str) -> Self {
        Self {
            raw: RawSpinLock::new(name),
            waiters: UnsafeCell::new(List::new()),
        }
    }

    /// Atomically release `mutex` and wait for a signal; the mutex is held
    /// again on return. Returns `0`, `-ETIMEDOUT` or `-EINTR`.
    pub fn timed_wait(&self, mutex: &KMutex, timeout: u64) -> i32 {
        // Taking our lock before dropping the mutex closes the missed-
        // signal window.
        self.raw.acquire();
        mutex.unlock();

        let r = unsafe {
            sched::sleep(
                self.waiters.get(),
                &self.raw,
                timeout,
                true,
                TaskState::Sleeping,
            )
        };
        self.raw.release();

        mutex.lock();
        r
    }

    pub fn wait(&self, mutex: &KMutex) -> i32 {
        self.timed_wait(mutex, 0)
    }

    pub fn signal(&self) {
        self.raw.acquire();
        unsafe { sched::wakeup_one(self.waiters.get(), 0) };
        self.raw.release();
    }

    pub fn broadcast(&self) {
        self.raw.acquire();
        unsafe { sched::wakeup_all(self.waiters.get(), 0) };
        self.raw.release();
    }
}
