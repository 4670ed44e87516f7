//! The IPC wire protocol spoken between the kernel's VFS boundary and
//! filesystem servers.
//!
//! A [`Message`] is the first iovec of every request. The discriminant is a
//! stable `u32`; the per-type argument record follows it in the layout
//! (`repr(C, u32)` pins the tag + payload arrangement), so a server written
//! in any language can decode it.

use int_enum::IntEnum;

/// Message discriminants, split between path operations (addressed by inode
/// of a directory plus a name) and open-descriptor operations.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub enum MessageType {
    Access = 0,
    Chdir = 1,
    Chmod = 2,
    Chown = 3,
    Create = 4,
    Link = 5,
    Lookup = 6,
    Stat = 7,
    Readlink = 8,
    Rmdir = 9,
    Symlink = 10,
    Unlink = 11,
    Utime = 12,

    Close = 13,
    Fchmod = 14,
    Fchown = 15,
    Fstat = 16,
    Fsync = 17,
    Ioctl = 18,
    Open = 19,
    Read = 20,
    Readdir = 21,
    Seek = 22,
    Select = 23,
    Trunc = 24,
    Write = 25,
}

/// The request message. Path names and data payloads are not carried inline;
/// they travel in the request's remaining send/receive iovecs.
#[repr(C, u32)]
#[derive(Debug, Clone, Copy)]
pub enum Message {
    Access { ino: u64, amode: u32 } = 0,
    Chdir { ino: u64 } = 1,
    Chmod { ino: u64, mode: u32 } = 2,
    Chown { ino: u64, uid: u32, gid: u32 } = 3,
    Create { dir_ino: u64, mode: u32, dev: u32 } = 4,
    Link { dir_ino: u64, ino: u64 } = 5,
    Lookup { dir_ino: u64, flags: u32 } = 6,
    Stat { ino: u64 } = 7,
    Readlink { ino: u64, nbyte: usize } = 8,
    Rmdir { dir_ino: u64, ino: u64 } = 9,
    Symlink { dir_ino: u64, mode: u32 } = 10,
    Unlink { dir_ino: u64, ino: u64 } = 11,
    Utime { ino: u64, actime: i64, modtime: i64 } = 12,

    Close = 13,
    Fchmod { mode: u32 } = 14,
    Fchown { uid: u32, gid: u32 } = 15,
    Fstat = 16,
    Fsync = 17,
    Ioctl { request: u32, arg: usize } = 18,
    Open { ino: u64, oflag: u32, mode: u32 } = 19,
    Read { nbyte: usize } = 20,
    Readdir { nbyte: usize } = 21,
    Seek { offset: i64, whence: u32 } = 22,
    Select { timeout_ticks: u64 } = 23,
    Trunc { length: i64 } = 24,
    Write { nbyte: usize } = 25,
}

impl Message {
    /// The wire discriminant of this message.
    pub const fn message_type(&self) -> MessageType {
        match self {
            Message::Access { .. } => MessageType::Access,
            Message::Chdir { .. } => MessageType::Chdir,
            Message::Chmod { .. } => MessageType::Chmod,
            Message::Chown { .. } => MessageType::Chown,
            Message::Create { .. } => MessageType::Create,
            Message::Link { .. } => MessageType::Link,
            Message::Lookup { .. } => MessageType::Lookup,
            Message::Stat { .. } => MessageType::Stat,
            Message::Readlink { .. } => MessageType::Readlink,
            Message::Rmdir { .. } => MessageType::Rmdir,
            Message::Symlink { .. } => MessageType::Symlink,
            Message::Unlink { .. } => MessageType::Unlink,
            Message::Utime { .. } => MessageType::Utime,
            Message::Close => MessageType::Close,
            Message::Fchmod { .. } => MessageType::Fchmod,
            Message::Fchown { .. } => MessageType::Fchown,
            Message::Fstat => MessageType::Fstat,
            Message::Fsync => MessageType::Fsync,
            Message::Ioctl { .. } => MessageType::Ioctl,
            Message::Open { .. } => MessageType::Open,
            Message::Read { .. } => MessageType::Read,
            Message::Readdir { .. } => MessageType::Readdir,
            Message::Seek { .. } => MessageType::Seek,
            Message::Select { .. } => MessageType::Select,
            Message::Trunc { .. } => MessageType::Trunc,
            Message::Write { .. } => MessageType::Write,
        }
    }
}
