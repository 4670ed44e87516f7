//! Tick-driven timers.
//!
//! The queue keeps deadlines sorted with delta encoding: each node stores
//! ticks remaining *relative to its predecessor*, so the per-tick work is a
//! single decrement of the head. Expired callbacks run with the queue lock
//! dropped; a periodic timer re-enqueues itself afterwards.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TICKS_PER_SECOND;
use crate::sync::spinlock::{SpinLock, spin_lock};
use crate::utils::list::{Link, List, Node};

/// Monotonic tick counter, advanced by the boot CPU's timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[inline]
pub fn uptime_ms() -> u64 {
    ticks() * (1000 / TICKS_PER_SECOND)
}

#[inline]
pub const fn seconds_to_ticks(seconds: u64) -> u64 {
    seconds * TICKS_PER_SECOND
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Initialized but not queued.
    Inactive,
    /// Queued, counting down.
    Active,
}

pub struct KTimer {
    link: Link<KTimer>,
    /// Ticks remaining relative to the previous queue node.
    remain: u64,
    /// Re-arm interval; zero for one-shot timers.
    period: u64,
    state: TimerState,
    callback: Option<fn(usize)>,
    arg: usize,
}

unsafe impl Send for KTimer {}
unsafe impl Sync for KTimer {}

impl Node for KTimer {
    fn link(&mut self) -> &mut Link<KTimer> {
        &mut self.link
    }
    fn link_ref(&self) -> &Link<KTimer> {
        &self.link
    }
}

impl KTimer {
    pub const fn new() -> Self {
        Self {
            link: Link::new(),
            remain: 0,
            period: 0,
            state: TimerState::Inactive,
            callback: None,
            arg: 0,
        }
    }
}

static QUEUE: SpinLock<List<KTimer>> = spin_lock("ktimer", List::new());

/// Splice `timer` in at its deadline, rewriting the deltas it passes.
unsafe fn enqueue(queue: &mut List<KTimer>, mut timer: NonNull<KTimer>) {
    unsafe {
        let mut at = None;
        for node_ptr in queue.iter() {
            let node = &mut *node_ptr.as_ptr();
            if node.remain > timer.as_ref().remain {
                node.remain -= timer.as_ref().remain;
                at = Some(node_ptr);
                break;
            }
            timer.as_mut().remain -= node.remain;
        }

        match at {
            Some(node) => queue.insert_before(node, timer),
            None => queue.push_back(timer),
        }
    }
}

/// Unlink `timer`, folding its remaining delta into the successor.
unsafe fn dequeue(queue: &mut List<KTimer>, timer: NonNull<KTimer>) {
    unsafe {
        if let Some(next) = queue.next_of(timer) {
            (*next.as_ptr()).remain += timer.as_ref().remain;
        }
        queue.remove(timer);
    }
}

/// Initialize and optionally start a timer.
///
/// # Safety
/// `timer` must stay valid until stopped (or until it has fired, for a
/// one-shot).
pub unsafe fn create(
    timer: NonNull<KTimer>,
    callback: fn(usize),
    arg: usize,
    delay: u64,
    period: u64,
    autostart: bool,
) {
    let mut queue = QUEUE.lock();
    unsafe {
        let t = &mut *timer.as_ptr();
        assert!(!t.link.is_linked(), "timer is queued");
        t.callback = Some(callback);
        t.arg = arg;
        t.remain = delay.max(1);
        t.period = period;
        t.state = if autostart {
            TimerState::Active
        } else {
            TimerState::Inactive
        };
        if autostart {
            enqueue(&mut queue, timer);
        }
    }
}

/// Arm a one-shot wakeup `delay` ticks from now.
///
/// # Safety
/// As [`create`].
pub unsafe fn arm_oneshot(timer: NonNull<KTimer>, callback: fn(usize), arg: usize, delay: u64) {
    unsafe { create(timer, callback, arg, delay, 0, true) };
}

/// Stop a timer if it is pending; returns whether it was.
///
/// # Safety
/// `timer` must have been initialized by [`create`].
pub unsafe fn stop(timer: NonNull<KTimer>) -> bool {
    let mut queue = QUEUE.lock();
    unsafe {
        let t = &mut *timer.as_ptr();
        if t.state != TimerState::Active {
            return false;
        }
        dequeue(&mut queue, timer);
        t.state = TimerState::Inactive;
        true
    }
}

/// Advance the queue by one tick and fire everything that reached zero.
/// Called from the boot CPU's timer interrupt.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);

    loop {
        let fire;
        {
            let mut queue = QUEUE.lock();
            let Some(head) = queue.front() else {
                return;
            };
            let timer = unsafe { &mut *head.as_ptr() };
            debug_assert!(timer.state == TimerState::Active);

            if timer.remain > 1 {
                timer.remain -= 1;
                return;
            }
            timer.remain = 0;
            unsafe { queue.remove(head) };
            timer.state = TimerState::Inactive;
            fire = head;
        }

        // Run the callback with the queue unlocked; it may re-arm, sleep
        // nothing, or wake tasks.
        let (callback, arg, period) = unsafe {
            let t = fire.as_ref();
            (t.callback, t.arg, t.period)
        };
        if let Some(callback) = callback {
            callback(arg);
        }

        if period != 0 {
            let mut queue = QUEUE.lock();
            let t = unsafe { &mut *fire.as_ptr() };
            // A callback may have restarted or destroyed it already
            if t.state == TimerState::Inactive && !t.link.is_linked() {
                t.remain = period;
                t.state = TimerState::Active;
                unsafe { enqueue(&mut queue, fire) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn record(order: usize) {
        // Pack firing order: each callback shifts in its argument
        let v = FIRED.load(Ordering::Relaxed);
        FIRED.store(v * 10 + order, Ordering::Relaxed);
    }

    #[test_case]
    fn delta_queue_fires_in_deadline_order() {
        static mut T1: KTimer = KTimer::new();
        static mut T2: KTimer = KTimer::new();
        static mut T3: KTimer = KTimer::new();

        FIRED.store(0, Ordering::Relaxed);
        unsafe {
            // Inserted out of order on purpose
            create(NonNull::new(&raw mut T2).unwrap(), record, 2, 2, 0, true);
            create(NonNull::new(&raw mut T1).unwrap(), record, 1, 1, 0, true);
            create(NonNull::new(&raw mut T3).unwrap(), record, 3, 3, 0, true);
        }

        for _ in 0..3 {
            tick();
        }
        assert_eq!(FIRED.load(Ordering::Relaxed), 123);
    }

    #[test_case]
    fn stop_folds_delta_into_successor() {
        static mut A: KTimer = KTimer::new();
        static mut B: KTimer = KTimer::new();

        FIRED.store(0, Ordering::Relaxed);
        unsafe {
            create(NonNull::new(&raw mut A).unwrap(), record, 7, 2, 0, true);
            create(NonNull::new(&raw mut B).unwrap(), record, 8, 4, 0, true);
            assert!(stop(NonNull::new(&raw mut A).unwrap()));
        }

        // B must still fire at tick 4, not at 2
        tick();
        tick();
        assert_eq!(FIRED.load(Ordering::Relaxed), 0);
        tick();
        tick();
        assert_eq!(FIRED.load(Ordering::Relaxed), 8);
    }
}
