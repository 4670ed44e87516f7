//! The OpalOS kernel/user ABI.
//!
//! Everything in this crate is shared verbatim between the kernel and user
//! programs: error numbers, signal numbers and codes, syscall numbers, the
//! IPC message records exchanged with filesystem servers, and the POSIX-ish
//! limits the kernel enforces.
#![no_std]

pub mod errno;
pub mod fcntl;
pub mod ipc;
pub mod signal;
pub mod syscalls;
pub mod wait;

/// Maximum number of open file descriptors per process.
pub const OPEN_MAX: usize = 32;
/// Cumulative byte limit for `argv` + `envp` passed to `exec`.
pub const ARG_MAX: usize = 4096 * 8;
/// Default process priority bias; priorities span `0..2 * NZERO`.
pub const NZERO: usize = 20;
/// Maximum length of a path argument, including the terminating NUL.
pub const PATH_MAX: usize = 1024;
/// Maximum length of a single path component.
pub const NAME_MAX: usize = 255;
/// Writes of up to this many bytes to a pipe are atomic.
pub const PIPE_BUF: usize = 4096;
