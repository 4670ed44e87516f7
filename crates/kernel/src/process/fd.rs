//! The per-process file-descriptor table.

use alloc::sync::Arc;

use opal_abi::OPEN_MAX;
use opal_abi::errno::{EBADF, EMFILE};
use opal_abi::fcntl::FdFlags;

use crate::ipc::Connection;

#[derive(Clone)]
pub struct FdEntry {
    pub conn: Arc<Connection>,
    pub flags: FdFlags,
}

pub struct FdTable {
    entries: [Option<FdEntry>; OPEN_MAX],
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            entries: [const { None }; OPEN_MAX],
        }
    }

    /// Install `conn` at the lowest free slot.
    pub fn alloc(&mut self, conn: Arc<Connection>, flags: FdFlags) -> Result<usize, i32> {
        for (fd, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(FdEntry { conn, flags });
                return Ok(fd);
            }
        }
        Err(-EMFILE)
    }

    pub fn get(&self, fd: usize) -> Result<Arc<Connection>, i32> {
        self.entries
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.conn.clone())
            .ok_or(-EBADF)
    }

    pub fn flags(&self, fd: usize) -> Result<FdFlags, i32> {
        self.entries
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.flags)
            .ok_or(-EBADF)
    }

    pub fn set_flags(&mut self, fd: usize, flags: FdFlags) -> Result<(), i32> {
        self.entries
            .get_mut(fd)
            .and_then(|slot| slot.as_mut())
            .map(|entry| entry.flags = flags)
            .ok_or(-EBADF)
    }

    pub fn close(&mut self, fd: usize) -> Result<(), i32> {
        self.entries
            .get_mut(fd)
            .and_then(|slot| slot.take())
            .map(drop)
            .ok_or(-EBADF)
    }

    /// Duplicate into the lowest free slot; the copy starts with empty
    /// descriptor flags, per POSIX.
    pub fn dup(&mut self, fd: usize) -> Result<usize, i32> {
        let conn = self.get(fd)?;
        self.alloc(conn, FdFlags::empty())
    }

    pub fn dup2(&mut self, old: usize, new: usize) -> Result<usize, i32> {
        let conn = self.get(old)?;
        if old == new {
            return Ok(new);
        }
        let slot = self.entries.get_mut(new).ok_or(-EBADF)?;
        *slot = Some(FdEntry {
            conn,
            flags: FdFlags::empty(),
        });
        Ok(new)
    }

    /// Fork: the child shares every connection.
    pub fn clone_table(&self) -> FdTable {
        FdTable {
            entries: self.entries.clone(),
        }
    }

    /// Exec: drop everything marked close-on-exec.
    pub fn close_cloexec(&mut self) {
        for slot in self.entries.iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|entry| entry.flags.contains(FdFlags::CLOEXEC))
            {
                *slot = None;
            }
        }
    }

    /// Exit: release every descriptor.
    pub fn clear(&mut self) {
        for slot in self.entries.iter_mut() {
            *slot = None;
        }
    }
}
