//! IPC transaction objects.
//!
//! A request carries scatter/gather iovecs on both sides, a completion
//! semaphore and a reference count: one reference belongs to the sender,
//! one to the server for as long as the request sits in (or came out of)
//! the endpoint mailbox.

use alloc::boxed::Box;
use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, Ordering};

use opal_abi::errno::EFAULT;

use crate::memory::VirtAddr;
use crate::memory::vmspace::VmSpace;
use crate::sync::semaphore::KSemaphore;

/// Most transfers are one message iovec plus one data iovec.
pub const IOV_MAX: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub base: VirtAddr,
    pub len: usize,
}

pub struct Request {
    refcount: AtomicI32,
    /// Posted by `reply`; the sender waits here.
    sem: KSemaphore,
    result: AtomicIsize,
    /// Set when the sender gave up; servers must not touch the iovecs
    /// afterwards and replies become best-effort.
    abandoned: AtomicBool,
    /// The sender's address space; `None` for kernel-side senders whose
    /// iovecs are all kernel addresses.
    space: Option<NonNull<VmSpace>>,

    send_iov: heapless::Vec<IoVec, IOV_MAX>,
    recv_iov: heapless::Vec<IoVec, IOV_MAX>,
    /// Read/write cursors, advanced by the server only.
    send_idx: Cell<usize>,
    send_off: Cell<usize>,
    recv_idx: Cell<usize>,
    recv_off: Cell<usize>,
}

unsafe impl Send for Request {}
unsafe impl Sync for Request {}

impl Request {
    pub fn create(
        space: Option<NonNull<VmSpace>>,
        send_iov: &[IoVec],
        recv_iov: &[IoVec],
    ) -> Option<NonNull<Request>> {
        let req = Box::new(Request {
            refcount: AtomicI32::new(1),
            sem: KSemaphore::new("request", 0),
            result: AtomicIsize::new(0),
            abandoned: AtomicBool::new(false),
            space,
            send_iov: heapless::Vec::from_slice(send_iov).ok()?,
            recv_iov: heapless::Vec::from_slice(recv_iov).ok()?,
            send_idx: Cell::new(0),
            send_off: Cell::new(0),
            recv_idx: Cell::new(0),
            recv_off: Cell::new(0),
        });
        Some(NonNull::from(Box::leak(req)))
    }

    pub fn dup(req: NonNull<Request>) {
        let old = unsafe { req.as_ref() }.refcount.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    pub fn destroy(req: NonNull<Request>) {
        let old = unsafe { req.as_ref() }.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "request over-released");
        if old == 1 {
            drop(unsafe { Box::from_raw(req.as_ptr()) });
        }
    }

    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    fn copy_from_sender(&self, base: VirtAddr, buf: &mut [u8]) -> Result<(), i32> {
        match self.space {
            Some(space) => unsafe { space.as_ref() }.copy_in(base, buf),
            None => {
                // Kernel-side sender: iovecs point into the kernel half
                if !base.is_kernel() {
                    return Err(-EFAULT);
                }
                unsafe {
                    core::ptr::copy(base.into_ptr::<u8>(), buf.as_mut_ptr(), buf.len());
                }
                Ok(())
            }
        }
    }

    fn copy_to_sender(&self, base: VirtAddr, buf: &[u8]) -> Result<(), i32> {
        match self.space {
            Some(space) => unsafe { space.as_ref() }.copy_out(base, buf),
            None => {
                if !base.is_kernel() {
                    return Err(-EFAULT);
                }
                unsafe {
                    core::ptr::copy(buf.as_ptr(), base.into_ptr::<u8>(), buf.len());
                }
                Ok(())
            }
        }
    }

    /// Server side: pull up to `buf.len()` argument bytes from the sender,
    /// advancing the send cursor. Returns the byte count (0 = drained).
    pub fn read(&self, buf: &mut [u8]) -> isize {
        if self.is_abandoned() {
            return -(EFAULT as isize);
        }

        let mut total = 0usize;
        while total < buf.len() {
            let idx = self.send_idx.get();
            let Some(iov) = self.send_iov.get(idx) else {
                break;
            };
            let off = self.send_off.get();
            let n = (iov.len - off).min(buf.len() - total);
            if n == 0 {
                self.send_idx.set(idx + 1);
                self.send_off.set(0);
                continue;
            }

            if self
                .copy_from_sender(iov.base.add(off), &mut buf[total..total + n])
                .is_err()
            {
                return -(EFAULT as isize);
            }

            total += n;
            if off + n == iov.len {
                self.send_idx.set(idx + 1);
                self.send_off.set(0);
            } else {
                self.send_off.set(off + n);
            }
        }
        total as isize
    }

    /// Server side: push result bytes into the sender's receive iovecs,
    /// advancing the receive cursor. Short when the receive side is full.
    pub fn write(&self, buf: &[u8]) -> isize {
        if self.is_abandoned() {
            return -(EFAULT as isize);
        }

        let mut total = 0usize;
        while total < buf.len() {
            let idx = self.recv_idx.get();
            let Some(iov) = self.recv_iov.get(idx) else {
                break;
            };
            let off = self.recv_off.get();
            let n = (iov.len - off).min(buf.len() - total);
            if n == 0 {
                self.recv_idx.set(idx + 1);
                self.recv_off.set(0);
                continue;
            }

            if self
                .copy_to_sender(iov.base.add(off), &buf[total..total + n])
                .is_err()
            {
                return -(EFAULT as isize);
            }

            total += n;
            if off + n == iov.len {
                self.recv_idx.set(idx + 1);
                self.recv_off.set(0);
            } else {
                self.recv_off.set(off + n);
            }
        }
        total as isize
    }

    /// Complete the request: record the result, wake the sender and drop
    /// the server's reference.
    pub fn reply(req: NonNull<Request>, result: isize) {
        let r = unsafe { req.as_ref() };
        r.result.store(result, Ordering::Release);
        r.sem.put();
        Request::destroy(req);
    }

    pub(super) fn wait(&self, timeout: u64) -> Result<isize, i32> {
        self.sem.timed_get(timeout, false)?;
        Ok(self.result.load(Ordering::Acquire))
    }
}
