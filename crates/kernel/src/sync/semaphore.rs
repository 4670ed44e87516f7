//! Counting semaphores.

use core::cell::UnsafeCell;

use opal_abi::errno::{EAGAIN, EINVAL};

use crate::sched;
use crate::sched::cpu;
use crate::sync::spinlock::RawSpinLock;
use crate::task::{Task, TaskState};
use crate::utils::list::List;

struct SemInner {
    count: usize,
    waiters: List<Task>,
}

pub struct KSemaphore {
    raw: RawSpinLock,
    inner: UnsafeCell<SemInner>,
}

unsafe impl Send for KSemaphore {}
unsafe impl Sync for KSemaphore {}

impl KSemaphore {
    pub const fn new(name: &'static str, initial: usize) -> Self {
        Self {
            raw: RawSpinLock::new(name),
            inner: UnsafeCell::new(SemInner {
                count: initial,
                waiters: List::new(),
            }),
        }
    }

    /// Take one unit, blocking up to `timeout` ticks (`0` = forever).
    /// Fails with `-EAGAIN` from interrupt context, `-ETIMEDOUT` on expiry
    /// and `-EINTR` if `interruptible` and a signal arrives.
    pub fn timed_get(&self, timeout: u64, interruptible: bool) -> Result<(), i32> {
        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };

        loop {
            if inner.count > 0 {
                inner.count -= 1;
                self.raw.release();
                return Ok(());
            }

            if cpu::in_isr() {
                self.raw.release();
                return Err(-EAGAIN);
            }

            let r = unsafe {
                sched::sleep(
                    &mut inner.waiters,
                    &self.raw,
                    timeout,
                    interruptible,
                    TaskState::Sleeping,
                )
            };
            if r != 0 {
                self.raw.release();
                return Err(r);
            }
        }
    }

    pub fn get(&self) -> Result<(), i32> {
        self.timed_get(0, false)
    }

    pub fn try_get(&self) -> bool {
        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let taken = inner.count > 0;
        if taken {
            inner.count -= 1;
        }
        self.raw.release();
        taken
    }

    /// Release one unit and wake a waiter.
    pub fn put(&self) {
        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        inner.count += 1;
        unsafe { sched::wakeup_one(&mut inner.waiters, 0) };
        self.raw.release();
    }

    /// Fail every sleeper; the semaphore itself stays usable.
    pub fn flush_waiters(&self) {
        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        unsafe { sched::wakeup_all(&mut inner.waiters, -EINVAL) };
        self.raw.release();
    }
}
