//! Fixed-capacity message mailboxes.
//!
//! A ring of uniform-size messages; send blocks on full, receive on empty,
//! both with tick timeouts and an opt-in `-EINTR` abort for callers that
//! service signals.

use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use opal_abi::errno::{EAGAIN, EINVAL};

use crate::sched;
use crate::sched::cpu;
use crate::sync::spinlock::RawSpinLock;
use crate::task::{Task, TaskState};
use crate::utils::list::List;

struct MailboxInner {
    buf: Vec<u8>,
    msg_size: usize,
    capacity: usize,
    /// Messages currently queued.
    count: usize,
    read_pos: usize,
    write_pos: usize,
    alive: bool,
    senders: List<Task>,
    receivers: List<Task>,
}

pub struct KMailBox {
    raw: RawSpinLock,
    inner: UnsafeCell<MailboxInner>,
}

unsafe impl Send for KMailBox {}
unsafe impl Sync for KMailBox {}

impl KMailBox {
    pub fn new(name: &'static str, msg_size: usize, capacity: usize) -> Self {
        assert!(msg_size > 0 && capacity > 0);
        Self {
            raw: RawSpinLock::new(name),
            inner: UnsafeCell::new(MailboxInner {
                buf: vec![0; msg_size * capacity],
                msg_size,
                capacity,
                count: 0,
                read_pos: 0,
                write_pos: 0,
                alive: true,
                senders: List::new(),
                receivers: List::new(),
            }),
        }
    }

    /// Queue a message, blocking up to `timeout` ticks while full.
    pub fn timed_send(&self, msg: &[u8], timeout: u64, interruptible: bool) -> Result<(), i32> {
        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        assert!(msg.len() == inner.msg_size, "message size mismatch");

        loop {
            if !inner.alive {
                self.raw.release();
                return Err(-EINVAL);
            }

            if inner.count < inner.capacity {
                let at = inner.write_pos * inner.msg_size;
                inner.buf[at..at + inner.msg_size].copy_from_slice(msg);
                inner.write_pos = (inner.write_pos + 1) % inner.capacity;
                inner.count += 1;
                unsafe { sched::wakeup_one(&mut inner.receivers, 0) };
                self.raw.release();
                return Ok(());
            }

            if cpu::in_isr() {
                self.raw.release();
                return Err(-EAGAIN);
            }

            let r = unsafe {
                sched::sleep(
                    &mut inner.senders,
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

    /// Dequeue a message into `out`, blocking up to `timeout` ticks while
    /// empty.
    pub fn timed_receive(
        &self,
        out: &mut [u8],
        timeout: u64,
        interruptible: bool,
    ) -> Result<(), i32> {
        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        assert!(out.len() == inner.msg_size, "message size mismatch");

        loop {
            if inner.count > 0 {
                let at = inner.read_pos * inner.msg_size;
                out.copy_from_slice(&inner.buf[at..at + inner.msg_size]);
                inner.read_pos = (inner.read_pos + 1) % inner.capacity;
                inner.count -= 1;
                unsafe { sched::wakeup_one(&mut inner.senders, 0) };
                self.raw.release();
                return Ok(());
            }

            if !inner.alive {
                self.raw.release();
                return Err(-EINVAL);
            }

            if cpu::in_isr() {
                self.raw.release();
                return Err(-EAGAIN);
            }

            let r = unsafe {
                sched::sleep(
                    &mut inner.receivers,
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

    pub fn send(&self, msg: &[u8]) -> Result<(), i32> {
        self.timed_send(msg, 0, false)
    }

    pub fn receive(&self, out: &mut [u8]) -> Result<(), i32> {
        self.timed_receive(out, 0, false)
    }

    pub fn try_receive(&self, out: &mut [u8]) -> bool {
        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let got = inner.count > 0;
        if got {
            let at = inner.read_pos * inner.msg_size;
            out.copy_from_slice(&inner.buf[at..at + inner.msg_size]);
            inner.read_pos = (inner.read_pos + 1) % inner.capacity;
            inner.count -= 1;
            unsafe { sched::wakeup_one(&mut inner.senders, 0) };
        }
        self.raw.release();
        got
    }

    /// Shut the mailbox down: every blocked sender and receiver fails with
    /// `-EINVAL`, as does any later send. Queued messages stay readable
    /// through [`try_receive`].
    pub fn destroy(&self) {
        self.raw.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        inner.alive = false;
        unsafe {
            sched::wakeup_all(&mut inner.senders, -EINVAL);
            sched::wakeup_all(&mut inner.receivers, -EINVAL);
        }
        self.raw.release();
    }

    pub fn is_alive(&self) -> bool {
        self.raw.acquire();
        let alive = unsafe { &*self.inner.get() }.alive;
        self.raw.release();
        alive
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.raw.acquire();
        let count = unsafe { &*self.inner.get() }.count;
        self.raw.release();
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
