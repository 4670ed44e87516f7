//! Device registration tables: the thin boundary block and character
//! drivers plug into.

use opal_abi::errno::ENODEV;

use crate::sync::condvar::KCondVar;
use crate::sync::spinlock::{SpinLock, spin_lock};
use crate::utils::list::{Link, List, Node};

pub const NDEV: usize = 16;

/// One block transfer. Requests serialize per device behind the driver's
/// own mutex; completion signals the embedded condition variable.
pub struct BufRequest {
    pub link: Link<BufRequest>,
    pub data: *mut u8,
    pub len: usize,
    pub block_no: u32,
    pub write: bool,
    pub done: bool,
    pub wait: KCondVar,
}

impl Node for BufRequest {
    fn link(&mut self) -> &mut Link<BufRequest> {
        &mut self.link
    }
    fn link_ref(&self) -> &Link<BufRequest> {
        &self.link
    }
}

impl BufRequest {
    pub fn new(data: *mut u8, len: usize, block_no: u32, write: bool) -> Self {
        Self {
            link: Link::new(),
            data,
            len,
            block_no,
            write,
            done: false,
            wait: KCondVar::new("buf"),
        }
    }
}

/// The sole entry point of a block driver.
pub trait BlockDev: Sync {
    fn request(&self, req: &mut BufRequest);
}

/// Character device operations, registered by major number.
#[derive(Clone, Copy)]
pub struct CharDevOps {
    pub read: fn(minor: u32, buf: &mut [u8]) -> isize,
    pub write: fn(minor: u32, buf: &[u8]) -> isize,
    pub ioctl: fn(minor: u32, request: u32, arg: usize) -> isize,
}

static BLOCK_DEVS: SpinLock<[Option<&'static dyn BlockDev>; NDEV]> =
    spin_lock("blockdevs", [None; NDEV]);
static CHAR_DEVS: SpinLock<[Option<CharDevOps>; NDEV]> = spin_lock("chardevs", [None; NDEV]);

pub fn register_block(major: usize, dev: &'static dyn BlockDev) {
    let mut devs = BLOCK_DEVS.lock();
    assert!(devs[major].is_none(), "block major {major} already registered");
    devs[major] = Some(dev);
}

pub fn register_char(major: usize, ops: CharDevOps) {
    let mut devs = CHAR_DEVS.lock();
    assert!(devs[major].is_none(), "char major {major} already registered");
    devs[major] = Some(ops);
}

pub fn block_dev(major: usize) -> Result<&'static dyn BlockDev, i32> {
    BLOCK_DEVS
        .lock()
        .get(major)
        .copied()
        .flatten()
        .ok_or(-ENODEV)
}

pub fn char_dev(major: usize) -> Result<CharDevOps, i32> {
    CHAR_DEVS
        .lock()
        .get(major)
        .copied()
        .flatten()
        .ok_or(-ENODEV)
}

/// Per-device request queue type for drivers that buffer.
pub type BufQueue = List<BufRequest>;
