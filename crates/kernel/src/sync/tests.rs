use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use opal_abi::errno::ETIMEDOUT;

use crate::sched;
use crate::sync::condvar::KCondVar;
use crate::sync::mailbox::KMailBox;
use crate::sync::mutex::KMutex;
use crate::sync::semaphore::KSemaphore;
use crate::task;

#[test_case]
fn mutex_lock_unlock() {
    static M: KMutex = KMutex::new("test_mutex");
    assert!(!M.holding());
    M.lock();
    assert!(M.holding());
    M.unlock();
    assert!(!M.holding());
}

#[test_case]
fn semaphore_timeout() {
    static S: KSemaphore = KSemaphore::new("test_sem", 0);
    assert_eq!(S.timed_get(3, false), Err(-ETIMEDOUT));
}

static HANDOFF: KSemaphore = KSemaphore::new("handoff", 0);

fn poster(_arg: usize) {
    sched::sleep_current(2);
    HANDOFF.put();
}

#[test_case]
fn semaphore_blocks_until_put() {
    let me = unsafe { sched::current().as_ref() }.priority();
    let t = task::create(None, poster, 0, me).unwrap();
    sched::resume(t).unwrap();

    assert_eq!(HANDOFF.timed_get(crate::config::TICKS_PER_SECOND, false), Ok(()));
}

static COUNTER: AtomicU32 = AtomicU32::new(0);
static GUARD: KMutex = KMutex::new("counter");
static CV: KCondVar = KCondVar::new("counter_cv");
static PRODUCERS_DONE: KSemaphore = KSemaphore::new("producers", 0);

fn producer(n: usize) {
    for _ in 0..n {
        GUARD.lock();
        COUNTER.fetch_add(1, Ordering::Relaxed);
        GUARD.unlock();
        CV.signal();
    }
    PRODUCERS_DONE.put();
}

#[test_case]
fn condvar_wait_signal() {
    COUNTER.store(0, Ordering::Relaxed);

    let me = unsafe { sched::current().as_ref() }.priority();
    let t = task::create(None, producer, 5, me).unwrap();
    sched::resume(t).unwrap();

    GUARD.lock();
    while COUNTER.load(Ordering::Relaxed) < 5 {
        let r = CV.timed_wait(&GUARD, crate::config::TICKS_PER_SECOND);
        assert!(r == 0, "condvar wait failed with {r}");
    }
    GUARD.unlock();
    PRODUCERS_DONE.get().unwrap();
}

#[test_case]
fn mailbox_fifo_and_timeout() {
    let mbox = KMailBox::new("test_mbox", 4, 2);

    mbox.timed_send(&1u32.to_ne_bytes(), 0, false).unwrap();
    mbox.timed_send(&2u32.to_ne_bytes(), 0, false).unwrap();
    // Full: a timed send must give up
    assert_eq!(mbox.timed_send(&3u32.to_ne_bytes(), 2, false), Err(-ETIMEDOUT));

    let mut out = [0u8; 4];
    mbox.timed_receive(&mut out, 0, false).unwrap();
    assert_eq!(u32::from_ne_bytes(out), 1);
    mbox.timed_receive(&mut out, 0, false).unwrap();
    assert_eq!(u32::from_ne_bytes(out), 2);

    // Empty again
    assert_eq!(mbox.timed_receive(&mut out, 2, false), Err(-ETIMEDOUT));
}

static DRAIN_COUNT: AtomicUsize = AtomicUsize::new(0);
static DRAIN_DONE: KSemaphore = KSemaphore::new("drain", 0);

fn mailbox_consumer(mbox_addr: usize) {
    let mbox = unsafe { &*(mbox_addr as *const KMailBox) };
    let mut out = [0u8; 4];
    while mbox.timed_receive(&mut out, 0, false).is_ok() {
        DRAIN_COUNT.fetch_add(1, Ordering::SeqCst);
    }
    DRAIN_DONE.put();
}

#[test_case]
fn mailbox_destroy_unblocks_receiver() {
    static MBOX: spin::Lazy<KMailBox> = spin::Lazy::new(|| KMailBox::new("destroy_mbox", 4, 2));

    DRAIN_COUNT.store(0, Ordering::SeqCst);
    let me = unsafe { sched::current().as_ref() }.priority();
    let t = task::create(None, mailbox_consumer, &*MBOX as *const KMailBox as usize, me).unwrap();
    sched::resume(t).unwrap();

    MBOX.timed_send(&7u32.to_ne_bytes(), 0, false).unwrap();
    sched::sleep_current(2);
    MBOX.destroy();

    DRAIN_DONE.get().unwrap();
    assert_eq!(DRAIN_COUNT.load(Ordering::SeqCst), 1);
}
