//! IRQ dispatch: top halves, deferred bottom-half tasks and IPIs.
//!
//! The controller driver (GIC or LAPIC) sits behind `arch::irqchip`. On
//! dispatch the line is masked and EOI'd immediately; a top-half handler
//! decides whether the line is unmasked inline (return `true`) or stays
//! masked until a deferred handler task has run.

use alloc::boxed::Box;

use crate::arch::irqchip;
use crate::config::{IRQ_MAX, PRIORITY_IRQ_TASK};
use crate::sched::{self, cpu};
use crate::sync::semaphore::KSemaphore;
use crate::sync::spinlock::{SpinLock, spin_lock};
use crate::task;

/// A top-half handler: runs with IRQs off, the line masked and EOI'd.
/// Returns whether to unmask the line on the way out.
pub type IrqHandler = fn(usize) -> bool;

#[derive(Clone, Copy)]
struct IrqSlot {
    handler: IrqHandler,
    arg: usize,
}

static TABLE: SpinLock<[Option<IrqSlot>; IRQ_MAX]> = spin_lock("irq", [None; IRQ_MAX]);

/// Bind a top-half handler to a line and enable it at the controller,
/// routed to the boot CPU.
pub fn attach(irq: u32, handler: IrqHandler, arg: usize) {
    let mut table = TABLE.lock();
    let slot = &mut table[irq as usize];
    assert!(slot.is_none(), "IRQ {irq} already attached");
    *slot = Some(IrqSlot { handler, arg });
    drop(table);
    irqchip::enable(irq, 0);
}

/// Top-half dispatch, called from the trap handler for every IRQ trap.
pub fn dispatch() {
    let Some(irq) = irqchip::current() else {
        // Spurious
        return;
    };

    if irq as usize >= IRQ_MAX {
        crate::warn!("IRQ {irq} out of table range");
        return;
    }

    cpu::isr_enter();
    irqchip::mask(irq);
    irqchip::eoi(irq);

    let slot = TABLE.lock()[irq as usize];
    match slot {
        Some(IrqSlot { handler, arg }) => {
            if handler(arg) {
                irqchip::unmask(irq);
            }
        }
        None => {
            crate::warn!("unhandled IRQ {irq}, leaving it masked");
        }
    }

    cpu::isr_exit();
}

/// A deferred ("bottom-half") interrupt handler: the top half posts a
/// semaphore, a dedicated high-priority task runs the real handler with
/// interrupts enabled and unmasks the line when it is done.
pub struct InterruptTask {
    semaphore: KSemaphore,
    handler: fn(usize),
    arg: usize,
    irq: u32,
}

fn deferred_top(arg: usize) -> bool {
    let isr = unsafe { &*(arg as *const InterruptTask) };
    isr.semaphore.put();
    // stays masked until the task-level handler finishes
    false
}

fn interrupt_task_main(arg: usize) {
    let isr = unsafe { &*(arg as *const InterruptTask) };
    loop {
        isr.semaphore
            .get()
            .expect("interrupt task semaphore failed");
        (isr.handler)(isr.arg);
        irqchip::unmask(isr.irq);
    }
}

/// Attach `handler` to run in task context for every delivery of `irq`.
pub fn attach_task(irq: u32, handler: fn(usize), arg: usize) {
    let isr: &'static InterruptTask = Box::leak(Box::new(InterruptTask {
        semaphore: KSemaphore::new("isr", 0),
        handler,
        arg,
        irq,
    }));

    let task = task::create(
        None,
        interrupt_task_main,
        isr as *const InterruptTask as usize,
        PRIORITY_IRQ_TASK,
    )
    .expect("cannot create IRQ task");
    sched::resume(task).expect("cannot start IRQ task");

    attach(irq, deferred_top, isr as *const InterruptTask as usize);
}

fn timer_top(_arg: usize) -> bool {
    crate::arch::timer::ack();
    crate::process::times_tick();
    sched::tick();
    true
}

fn ipi_top(_arg: usize) -> bool {
    // Nothing to do: the point was to force this CPU through the
    // IRQ-return preemption path.
    true
}

/// Wire the scheduler tick and the reschedule IPI.
pub fn init() {
    attach(irqchip::TIMER_IRQ, timer_top, 0);
    attach(irqchip::IPI_IRQ, ipi_top, 0);
}
