//! Sleeping mutexes with priority inheritance.
//!
//! While a higher-priority task waits, the holder runs at the waiter's
//! priority; unlock restores the priority the holder had when it acquired
//! the mutex and hands the lock-ordering decision to the highest-priority
//! waiter.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::sched;
use crate::sync::spinlock::RawSpinLock;
use crate::task::{Task, TaskState};
use crate::utils::list::{Link, List, Node};

struct MutexInner {
    owner: Option<NonNull<Task>>,
    waiters: List<Task>,
    /// The owner's priority at acquisition, restored on unlock.
    original_priority: u8,
}

pub struct KMutex {
    /// Links the mutex into its owner's held-mutexes list.
    link: Link<KMutex>,
    name: &'static str,
    raw: RawSpinLock,
    inner: UnsafeCell<MutexInner>,
}

unsafe impl Send for KMutex {}
unsafe impl Sync for KMutex {}

impl Node for KMutex {
    fn link(&mut self) -> &mut Link<KMutex> {
        &mut self.link
    }
    fn link_ref(&self) -> &Link<KMutex> {
        &self.link
    }
}

impl KMutex {
    pub const fn new(name: &'static str) -> Self {
        Self {
            link: Link::new(),
            name,
            raw: RawSpinLock::new(name),
            inner: UnsafeCell::new(MutexInner {
                owner: None,
                waiters: List::new(),
                original_priority: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the calling task holds this mutex.
    pub fn holding(&self) -> bool {
        let me = sched::current();
        self.raw.acquire();
        let holding = unsafe { &*self.inner.get() }.owner == Some(me);
        self.raw.release();
        holding
    }

    /// Acquire, blocking up to `timeout` ticks (`0` = forever).
    pub fn timed_lock(&self, timeout: u64) -> Result<(), i32> {
        let me_ptr = sched::current();
        let me = unsafe { me_ptr.as_ref() };

        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };

        loop {
            match inner.owner {
                None => {
                    inner.owner = Some(me_ptr);
                    inner.original_priority = me.priority();
                    unsafe {
                        (*me.owned_mutexes.get()).push_back(NonNull::from(self));
                    }
                    self.raw.release();
                    return Ok(());
                }
                Some(owner_ptr) => {
                    if owner_ptr == me_ptr {
                        self.raw.release();
                        panic!("mutex '{}': recursive lock", self.name);
                    }

                    // Priority inheritance: lend the owner our priority so
                    // it cannot be starved by the middle of the range.
                    let owner = unsafe { owner_ptr.as_ref() };
                    if me.priority() < owner.priority() {
                        if owner.saved_priority().is_none() {
                            owner.set_saved_priority(Some(owner.priority()));
                        }
                        sched::set_priority(owner_ptr, me.priority());
                    }

                    let r = unsafe {
                        sched::sleep(
                            &mut inner.waiters,
                            &self.raw,
                            timeout,
                            true,
                            TaskState::Mutex,
                        )
                    };
                    if r != 0 {
                        // Our boost must not outlive our wait: drop the
                        // owner back to its own priority or the best
                        // remaining waiter's.
                        if let Some(owner_ptr) = inner.owner {
                            let owner = unsafe { owner_ptr.as_ref() };
                            let mut target = inner.original_priority;
                            unsafe {
                                for waiter in inner.waiters.iter() {
                                    target = target.min(waiter.as_ref().priority());
                                }
                            }
                            if owner.priority() != target {
                                if target == inner.original_priority {
                                    owner.set_saved_priority(None);
                                }
                                sched::set_priority(owner_ptr, target);
                            }
                        }
                        self.raw.release();
                        return Err(r);
                    }
                }
            }
        }
    }

    pub fn lock(&self) {
        // only a timeout can fail, and there is none
        self.timed_lock(0).expect("untimed mutex lock failed");
    }

    pub fn unlock(&self) {
        let me_ptr = sched::current();
        let me = unsafe { me_ptr.as_ref() };

        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };

        assert!(
            inner.owner == Some(me_ptr),
            "mutex '{}': unlock by non-owner",
            self.name
        );

        unsafe {
            (*me.owned_mutexes.get()).remove(NonNull::from(self));
        }

        // Undo any inheritance picked up while we held it
        if me.priority() != inner.original_priority {
            let original = inner.original_priority;
            me.set_saved_priority(None);
            sched::set_priority(me_ptr, original);
        }

        inner.owner = None;

        // Hand the wake to the highest-priority waiter (lowest value)
        let mut best: Option<NonNull<Task>> = None;
        unsafe {
            for waiter in inner.waiters.iter() {
                let better = match best {
                    None => true,
                    Some(b) => waiter.as_ref().priority() < b.as_ref().priority(),
                };
                if better {
                    best = Some(waiter);
                }
            }
            if let Some(waiter) = best {
                sched::wake_task(waiter, &mut inner.waiters, 0);
            }
        }

        self.raw.release();
    }
}
