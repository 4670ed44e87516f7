//! File-descriptor flags, seek origins and the `stat` record.

use bitflags::bitflags;

bitflags! {
    /// `open` flags. The access mode lives in the low two bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const O_WRONLY = 1 << 0;
        const O_RDWR = 1 << 1;
        const O_APPEND = 1 << 3;
        const O_CREAT = 1 << 4;
        const O_EXCL = 1 << 5;
        const O_TRUNC = 1 << 6;
        const O_NONBLOCK = 1 << 7;
        const O_SYNC = 1 << 8;
        const O_CLOEXEC = 1 << 9;
    }
}

/// `O_RDONLY` is the absence of the other two access bits.
pub const O_ACCMODE: u32 = OpenFlags::O_WRONLY.bits() | OpenFlags::O_RDWR.bits();

impl OpenFlags {
    #[inline]
    pub const fn readable(&self) -> bool {
        self.bits() & O_ACCMODE != OpenFlags::O_WRONLY.bits()
    }

    #[inline]
    pub const fn writable(&self) -> bool {
        self.bits() & O_ACCMODE != 0
    }
}

bitflags! {
    /// Per-descriptor (not per-connection) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FdFlags: u32 {
        const CLOEXEC = 1 << 0;
    }
}

/// `fcntl` commands.
pub const F_DUPFD: u32 = 0;
pub const F_GETFD: u32 = 1;
pub const F_SETFD: u32 = 2;
pub const F_GETFL: u32 = 3;
pub const F_SETFL: u32 = 4;

/// `seek` origins.
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

/// File metadata as returned by `stat`/`fstat`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub st_dev: u32,
    pub st_ino: u32,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u32,
    pub st_size: i64,
    pub st_atime: i64,
    pub st_mtime: i64,
    pub st_ctime: i64,
}

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFIFO: u32 = 0o010000;
pub const S_IFLNK: u32 = 0o120000;
