use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use opal_abi::errno::ETIMEDOUT;

use crate::config::TICKS_PER_SECOND;
use crate::sched;
use crate::sync::mutex::KMutex;
use crate::sync::semaphore::KSemaphore;
use crate::task;

static HIGH_RAN: AtomicBool = AtomicBool::new(false);

fn set_flag(_arg: usize) {
    HIGH_RAN.store(true, Ordering::SeqCst);
}

#[test_case]
fn higher_priority_runs_first() {
    HIGH_RAN.store(false, Ordering::SeqCst);

    let me = unsafe { sched::current().as_ref() }.priority();
    let high = task::create(None, set_flag, 0, me - 1).unwrap();
    sched::resume(high).unwrap();

    // The moment we hit a scheduling point, the higher-priority task must
    // win the CPU and finish before we run again.
    sched::yield_now();
    assert!(HIGH_RAN.load(Ordering::SeqCst));
}

static ROUND_ROBIN: AtomicU32 = AtomicU32::new(0);
static RR_DONE: KSemaphore = KSemaphore::new("rr_done", 0);

fn round_robin_entry(index: usize) {
    for _ in 0..3 {
        // Record our slot, then hand the CPU to the next sibling
        let v = ROUND_ROBIN.load(Ordering::SeqCst);
        ROUND_ROBIN.store(v * 10 + index as u32, Ordering::SeqCst);
        sched::yield_now();
    }
    RR_DONE.put();
}

#[test_case]
fn same_priority_round_robin() {
    ROUND_ROBIN.store(0, Ordering::SeqCst);

    let me = unsafe { sched::current().as_ref() }.priority();
    for index in 1..=3usize {
        let t = task::create(None, round_robin_entry, index, me - 1).unwrap();
        sched::resume(t).unwrap();
    }
    for _ in 0..3 {
        RR_DONE.get().unwrap();
    }

    // Three tasks, three rounds each, strictly interleaved
    assert_eq!(ROUND_ROBIN.load(Ordering::SeqCst), 123_123_123);
}

static PI_MUTEX: KMutex = KMutex::new("pi_test");
static PI_RESULT: AtomicUsize = AtomicUsize::new(usize::MAX);
static PI_DONE: KSemaphore = KSemaphore::new("pi_done", 0);

fn pi_waiter(_arg: usize) {
    let r = PI_MUTEX.timed_lock(TICKS_PER_SECOND);
    PI_RESULT.store(r.err().map(|e| -e as usize).unwrap_or(0), Ordering::SeqCst);
    PI_DONE.put();
}

#[test_case]
fn priority_inheritance_and_timeout() {
    let me_ptr = sched::current();
    let me = unsafe { me_ptr.as_ref() };
    let original = me.priority();

    PI_MUTEX.lock();

    // A top-priority waiter lends us its priority while it blocks
    let waiter = task::create(None, pi_waiter, 0, 0).unwrap();
    sched::resume(waiter).unwrap();
    sched::yield_now();
    assert_eq!(me.priority(), 0, "owner must inherit the waiter's priority");

    // After the timeout the boost is gone and the waiter saw -ETIMEDOUT
    PI_DONE.get().unwrap();
    assert_eq!(PI_RESULT.load(Ordering::SeqCst), ETIMEDOUT as usize);
    assert_eq!(me.priority(), original, "priority restored after timeout");

    PI_MUTEX.unlock();
}

static SLEEPER_WOKE: AtomicBool = AtomicBool::new(false);
static SLEEPER_READY: KSemaphore = KSemaphore::new("sleeper", 0);

fn interruptible_sleeper(_arg: usize) {
    SLEEPER_READY.put();
    let r = sched::sleep_current(60 * TICKS_PER_SECOND);
    SLEEPER_WOKE.store(r == -opal_abi::errno::EINTR, Ordering::SeqCst);
    SLEEPER_READY.put();
}

#[test_case]
fn interrupt_wakes_sleeping_task() {
    SLEEPER_WOKE.store(false, Ordering::SeqCst);

    let me = unsafe { sched::current().as_ref() }.priority();
    let t = task::create(None, interruptible_sleeper, 0, me).unwrap();
    sched::resume(t).unwrap();

    SLEEPER_READY.get().unwrap();
    // Give the sleeper time to actually park before interrupting it
    while !sched::interrupt(t) {
        sched::yield_now();
    }
    SLEEPER_READY.get().unwrap();
    assert!(SLEEPER_WOKE.load(Ordering::SeqCst));
}

#[test_case]
fn timed_sleep_elapses() {
    let before = crate::sync::timer::ticks();
    assert_eq!(sched::sleep_current(3), 0);
    assert!(crate::sync::timer::ticks() >= before + 3);
}
