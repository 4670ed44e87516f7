//! The syscall number table.
//!
//! Numbers are stable: they are encoded literally into the trap instruction
//! by user programs (`svc #n` on ARM, the dispatch register on i386), so an
//! entry must never be renumbered, only appended.

use int_enum::IntEnum;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub enum Syscall {
    Fork = 1,
    Exec = 2,
    Waitpid = 3,
    Exit = 4,
    GetPid = 5,
    GetPpid = 6,
    Sbrk = 7,
    MMap = 8,
    MUnmap = 9,
    Nanosleep = 10,
    Uptime = 11,
    Kill = 12,
    SigAction = 13,
    SigProcMask = 14,
    SigReturn = 15,
    GetPgid = 16,
    SetPgid = 17,
    Pipe = 18,
    Open = 19,
    Close = 20,
    Read = 21,
    Write = 22,
    Seek = 23,
    Fstat = 24,
    Stat = 25,
    Chdir = 26,
    Dup = 27,
    Dup2 = 28,
    Fcntl = 29,
    Ioctl = 30,
    Yield = 31,
}

/// Flags for the `mmap` syscall's protection argument.
pub const PROT_READ: usize = 1 << 0;
pub const PROT_WRITE: usize = 1 << 1;
pub const PROT_EXEC: usize = 1 << 2;
