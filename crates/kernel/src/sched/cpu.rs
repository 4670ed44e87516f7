//! Per-CPU state.
//!
//! The CPU array is initialized once at boot and only ever accessed by its
//! own CPU with interrupts disabled (except for the scheduler fields, which
//! are additionally guarded by the per-CPU scheduler lock).

use core::cell::SyncUnsafeCell;
use core::ptr::NonNull;

use crate::arch;
use crate::arch::threading::Context;
use crate::config::{CPU_MAX, TASK_MAX_PRIORITIES};
use crate::sync::spinlock::RawSpinLock;
use crate::task::Task;
use crate::utils::list::List;

pub struct Cpu {
    pub id: usize,
    /// The task this CPU is running; None while in the scheduler loop.
    pub task: Option<NonNull<Task>>,
    /// The scheduler loop's own switch context.
    pub scheduler_ctx: Context,
    /// One queue per priority level; guarded by [`sched_lock`].
    pub run_queues: [List<Task>; TASK_MAX_PRIORITIES],

    /// Nesting depth of `irq_save`.
    pub irq_save_count: u32,
    /// Whether IRQs were enabled at the outermost `irq_save`.
    pub irq_flags: bool,
    /// Interrupt nesting depth; preemption only happens at depth zero.
    pub isr_nesting: u32,
    /// Whether the frame the current IRQ interrupted was user mode.
    pub irq_from_user: bool,
}

// Only ever accessed by its own CPU with interrupts disabled (except the
// scheduler fields, which are additionally guarded by the per-CPU scheduler
// lock); see the module doc comment.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new(id: usize) -> Self {
        Self {
            id,
            task: None,
            scheduler_ctx: Context::zeroed(),
            run_queues: [const { List::new() }; TASK_MAX_PRIORITIES],
            irq_save_count: 0,
            irq_flags: false,
            isr_nesting: 0,
            irq_from_user: false,
        }
    }
}

// the literal arrays below spell out each CPU
const _: () = assert!(CPU_MAX == 4);

static CPUS: [SyncUnsafeCell<Cpu>; CPU_MAX] = [
    SyncUnsafeCell::new(Cpu::new(0)),
    SyncUnsafeCell::new(Cpu::new(1)),
    SyncUnsafeCell::new(Cpu::new(2)),
    SyncUnsafeCell::new(Cpu::new(3)),
];

/// One scheduler lock per CPU, guarding its run queues and current task.
static SCHED_LOCKS: [RawSpinLock; CPU_MAX] = [
    RawSpinLock::new("sched0"),
    RawSpinLock::new("sched1"),
    RawSpinLock::new("sched2"),
    RawSpinLock::new("sched3"),
];

#[inline]
pub fn sched_lock(cpu: usize) -> &'static RawSpinLock {
    &SCHED_LOCKS[cpu]
}

/// The calling CPU's state.
///
/// # Safety
/// Interrupts must be disabled, and the returned reference must not outlive
/// the interrupts-disabled region (another task could otherwise migrate to
/// this CPU and alias it).
pub unsafe fn current() -> &'static mut Cpu {
    debug_assert!(!arch::irq_enabled(), "cpu state touched with IRQs on");
    unsafe { &mut *CPUS[arch::cpu_id()].get() }
}

/// # Safety
/// `index`'s fields may only be touched under [`sched_lock`]`(index)`.
pub unsafe fn by_index(index: usize) -> &'static mut Cpu {
    unsafe { &mut *CPUS[index].get() }
}

/// Disable IRQs on this CPU, tracking nesting so the matching
/// [`irq_restore`] only re-enables at the outermost level.
pub fn irq_save() {
    let enabled = arch::irq_enabled();
    unsafe { arch::irq_disable() };

    let cpu = unsafe { current() };
    if cpu.irq_save_count == 0 {
        cpu.irq_flags = enabled;
    }
    cpu.irq_save_count += 1;
}

pub fn irq_restore() {
    let cpu = unsafe { current() };
    assert!(cpu.irq_save_count > 0, "unbalanced irq_restore");
    cpu.irq_save_count -= 1;

    if cpu.irq_save_count == 0 && cpu.irq_flags {
        unsafe { arch::irq_enable() };
    }
}

/// Track interrupt nesting; called by the IRQ dispatch path.
pub fn isr_enter() {
    let cpu = unsafe { current() };
    cpu.isr_nesting += 1;
}

pub fn isr_exit() {
    let cpu = unsafe { current() };
    assert!(cpu.isr_nesting > 0, "unbalanced isr_exit");
    cpu.isr_nesting -= 1;
}

/// Whether we are inside an interrupt handler on this CPU.
pub fn in_isr() -> bool {
    arch::without_interrupts(|| unsafe { current() }.isr_nesting > 0)
}
