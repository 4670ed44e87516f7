//! The common trap entry: classify, dispatch, and deliver signals on the
//! way back to user mode.

use opal_abi::signal::{ILL_ILLOPC, SEGV_ACCERR, SEGV_MAPERR, SIGILL, SIGSEGV};

use crate::arch::{self, threading::TrapFrame};
use crate::memory::VirtAddr;
use crate::sched::{self, cpu};
use crate::{irq, process, syscalls};

/// What a trap was, independent of architecture encoding.
#[derive(Debug, Clone, Copy)]
pub enum TrapCause {
    Syscall(u16),
    Irq,
    PageFault { addr: VirtAddr, access: FaultAccess },
    UndefinedInstruction,
    Unknown(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct FaultAccess {
    /// Faulting access was a write.
    pub write: bool,
    /// Permission fault on a present mapping (vs. a translation fault).
    pub permission: bool,
}

/// Common entry point for every exception; the architecture stubs build the
/// frame and call here with IRQs disabled.
#[unsafe(no_mangle)]
pub extern "C" fn trap(tf: &mut TrapFrame) {
    let from_user = tf.is_user();

    if from_user && let Some(task) = sched::try_current() {
        unsafe { task.as_ref() }
            .tf
            .store(tf, core::sync::atomic::Ordering::Release);
    }

    match tf.cause() {
        TrapCause::Syscall(number) => {
            // Syscalls run with interrupts on; the frame is popped with
            // them off again.
            unsafe { arch::irq_enable() };
            let r = syscalls::dispatch(number, tf);
            tf.set_return(r as usize);
            unsafe { arch::irq_disable() };
        }
        TrapCause::Irq => {
            unsafe { cpu::current() }.irq_from_user = from_user;
            irq::dispatch();
        }
        TrapCause::PageFault { addr, access } => handle_fault(tf, addr, access, from_user),
        TrapCause::UndefinedInstruction => {
            if !from_user {
                dump_frame(tf);
                panic!("undefined instruction in kernel mode");
            }
            process::signal::send_current(SIGILL, ILL_ILLOPC, tf.pc().into_raw());
        }
        TrapCause::Unknown(n) => {
            dump_frame(tf);
            panic!("unhandled trap {n} in kernel mode");
        }
    }

    // All preemption funnels through the outermost trap exit
    if !cpu::in_isr() {
        sched::preempt();
    }

    if from_user {
        process::signal::deliver_pending(tf);

        // A stopped process parks its threads here until SIGCONT
        while process::current_stopped() {
            sched::suspend();
            process::signal::deliver_pending(tf);
        }
    }
}

fn handle_fault(tf: &mut TrapFrame, addr: VirtAddr, access: FaultAccess, from_user: bool) {
    if !from_user {
        dump_frame(tf);
        panic!("kernel fault at {addr:?} (write={})", access.write);
    }

    // Copy-on-write and other resolvable faults first
    if process::handle_page_fault(addr).is_ok() {
        return;
    }

    let code = if access.permission {
        SEGV_ACCERR
    } else {
        SEGV_MAPERR
    };
    process::signal::send_current(SIGSEGV, code, addr.into_raw());
}

/// Display the contents of a trap frame in a readable format.
pub fn dump_frame(tf: &TrapFrame) {
    crate::panic_print!("trap frame on CPU {}: {tf:#x?}", arch::cpu_id());
}
