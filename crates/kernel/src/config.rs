//! Compile-time kernel configuration.
//!
//! Everything tunable lives here so a port only has to touch one file.

pub use opal_abi::{ARG_MAX, NZERO, OPEN_MAX};

/// Maximum number of CPUs the kernel is built for.
pub const CPU_MAX: usize = 4;

/// Scheduler clock resolution: one tick is 10 ms.
pub const TICKS_PER_SECOND: u64 = 100;

/// Number of scheduler priority levels; lower value means higher priority.
/// User `nice` values map onto the upper half.
pub const TASK_MAX_PRIORITIES: usize = 2 * NZERO;

/// Default priority for kernel service tasks.
pub const PRIORITY_KERNEL: u8 = (NZERO / 2) as u8;
/// Priority of deferred-interrupt tasks; beats everything else.
pub const PRIORITY_IRQ_TASK: u8 = 0;
/// Default priority of the first thread of a new process.
pub const PRIORITY_DEFAULT: u8 = NZERO as u8;

/// Kernel stack size for a task, in pages (as a page-allocator order).
pub const KSTACK_ORDER: u32 = 1;
/// Default user stack size in bytes.
pub const USTACK_SIZE: usize = 8 * crate::memory::PAGE_SIZE;
/// Top of the user stack region.
pub const USTACK_TOP: usize = crate::memory::layout::VIRT_KERNEL_BASE;

/// How long an IPC send waits for the server before giving up.
pub const IPC_TIMEOUT_TICKS: u64 = 15 * TICKS_PER_SECOND;
/// In-flight request capacity of every endpoint mailbox.
pub const ENDPOINT_MAILBOX_CAPACITY: usize = 16;

/// Capacity of a pipe's ring buffer.
pub const PIPE_BUF: usize = opal_abi::PIPE_BUF;

/// Number of saved program counters on a spinlock acquisition.
pub const SPIN_MAX_PCS: usize = 8;

/// Number of IRQ lines the dispatch table covers (the i386 port indexes
/// it by interrupt vector).
pub const IRQ_MAX: usize = 256;
