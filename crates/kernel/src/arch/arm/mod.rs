//! ARMv7-A (Cortex-A9 MPCore) port. The reference machine is the RealView
//! PBX-A9: GIC interrupt controller, per-CPU private timers and a PL011
//! console UART.

pub mod boot;
pub mod gic;
pub mod irqchip;
pub mod paging;
pub mod power;
pub mod registers;
pub mod serial;
pub mod signal;
pub mod threading;
pub mod timer;

use core::arch::asm;

use registers::{PSR_I, cpsr_get};

/// Index of the CPU executing this code.
#[inline(always)]
pub fn cpu_id() -> usize {
    (registers::mpidr_get() & 0x3) as usize
}

#[inline(always)]
pub fn irq_enabled() -> bool {
    cpsr_get() & PSR_I == 0
}

/// # Safety
/// Caller must not rely on critical sections staying closed.
#[inline(always)]
pub unsafe fn irq_enable() {
    unsafe { asm!("cpsie i", options(nomem, nostack)) };
}

/// # Safety
/// Must be balanced with re-enabling, or the CPU stops taking interrupts.
#[inline(always)]
pub unsafe fn irq_disable() {
    unsafe { asm!("cpsid i", options(nomem, nostack)) };
}

#[inline(always)]
pub fn wait_for_interrupt() {
    unsafe { asm!("wfi", options(nomem, nostack)) };
}

pub fn halt() -> ! {
    loop {
        unsafe { irq_disable() };
        wait_for_interrupt();
    }
}

/// Record the current call stack by following the APCS frame-pointer chain.
/// Requires `-Cforce-frame-pointers`; unresolvable frames leave zeros.
pub fn save_pcs(pcs: &mut [usize]) {
    let mut fp = registers::fp_get() as *const usize;
    let mut i = 0;

    while i < pcs.len() && !fp.is_null() && (fp as usize) % align_of::<usize>() == 0 {
        // APCS frame: fp points at the saved lr slot, fp[-1] is the caller's fp
        let (lr, prev) = unsafe { (fp.read(), fp.offset(-1).read() as *const usize) };
        if lr == 0 {
            break;
        }
        pcs[i] = lr;
        i += 1;
        if prev >= fp {
            break;
        }
        fp = prev;
    }

    pcs[i..].fill(0);
}

/// First bring-up on the boot CPU: console, exception vectors.
pub fn init_early() {
    serial::init();
    boot::vectors_init();
}

/// Per-CPU bring-up once the kernel page table is live: interrupt controller
/// CPU interface and the private tick timer.
pub fn init_percpu() {
    irqchip::init_percpu();
    timer::init_percpu(crate::config::TICKS_PER_SECOND);
    boot::vectors_init();
}

/// Release the secondary cores: the board ROM parks them until a nonzero
/// entry address shows up in FLAGSSET, then an event wakes them.
pub fn smp_start_secondaries() {
    use crate::memory::layout::device_kva;

    unsafe {
        device_kva(0x1000_0030)
            .into_ptr::<u32>()
            .write_volatile(boot::secondary_entry_pa() as u32);
        registers::dsb();
        asm!("sev", options(nomem, nostack));
    }
}
