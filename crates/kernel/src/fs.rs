//! The filesystem boundary.
//!
//! Filesystems live out of tree, behind IPC channels. This module holds
//! the mount table (a path prefix per server), and the file-level wrappers
//! that turn descriptor operations into [`Message`]s sent over the owning
//! connection. Pipes ride the same machinery.

use alloc::sync::Arc;
use alloc::vec::Vec;

use opal_abi::errno::{EBADF, ENOENT};
use opal_abi::fcntl::{OpenFlags, SEEK_SET, Stat};
use opal_abi::ipc::Message;

use crate::ipc::{Connection, IoVec};
use crate::memory::VirtAddr;
use crate::sync::spinlock::{SpinLock, spin_lock};

/// A mounted filesystem server: turns an open request into a connection
/// whose endpoint that server owns.
pub type OpenHook = fn(path: &str, flags: OpenFlags) -> Result<Arc<Connection>, i32>;

struct Mount {
    prefix: &'static str,
    open: OpenHook,
}

static MOUNTS: SpinLock<Vec<Mount>> = spin_lock("mounts", Vec::new());

/// Register a filesystem server at a path prefix.
pub fn mount(prefix: &'static str, open: OpenHook) {
    MOUNTS.lock().push(Mount { prefix, open });
    crate::info!("fs: mounted server at {prefix}");
}

/// Resolve and open a path through its mount's server.
pub fn open(path: &str, flags: OpenFlags) -> Result<Arc<Connection>, i32> {
    let mounts = MOUNTS.lock();
    let mount = mounts
        .iter()
        .filter(|m| path.starts_with(m.prefix))
        .max_by_key(|m| m.prefix.len())
        .ok_or(-ENOENT)?;
    let open = mount.open;
    let suffix_start = mount.prefix.len();
    drop(mounts);
    open(&path[suffix_start..], flags)
}

/// Read into `dst` (a user or kernel address) through the connection.
pub fn read(conn: &Connection, dst: VirtAddr, nbyte: usize) -> isize {
    if !conn.open_flags().readable() {
        return -(EBADF as isize);
    }
    let msg = Message::Read { nbyte };
    conn.send(&msg, None, Some(IoVec { base: dst, len: nbyte }))
}

/// Write `nbyte` bytes from `src` through the connection.
pub fn write(conn: &Connection, src: VirtAddr, nbyte: usize) -> isize {
    if !conn.open_flags().writable() {
        return -(EBADF as isize);
    }
    let msg = Message::Write { nbyte };
    conn.send(&msg, Some(IoVec { base: src, len: nbyte }), None)
}

pub fn seek(conn: &Connection, offset: i64, whence: u32) -> isize {
    let msg = Message::Seek { offset, whence };
    conn.send(&msg, None, None)
}

pub fn fstat(conn: &Connection, stat: &mut Stat) -> isize {
    let msg = Message::Fstat;
    conn.send(
        &msg,
        None,
        Some(IoVec {
            base: VirtAddr::from_ptr(stat as *mut Stat),
            len: size_of::<Stat>(),
        }),
    )
}

pub fn fsync(conn: &Connection) -> isize {
    conn.send(&Message::Fsync, None, None)
}

pub fn ioctl(conn: &Connection, request: u32, arg: usize) -> isize {
    conn.send(&Message::Ioctl { request, arg }, None, None)
}

pub fn truncate(conn: &Connection, length: i64) -> isize {
    conn.send(&Message::Trunc { length }, None, None)
}

/// Positioned read into a kernel buffer; used by the exec loader.
pub fn read_at(conn: &Connection, offset: i64, buf: &mut [u8]) -> Result<usize, i32> {
    let r = seek(conn, offset, SEEK_SET);
    if r < 0 {
        return Err(r as i32);
    }
    let r = read(conn, VirtAddr::from_ptr(buf.as_ptr()), buf.len());
    if r < 0 {
        Err(r as i32)
    } else {
        Ok(r as usize)
    }
}
