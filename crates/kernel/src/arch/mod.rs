//! Architecture specific code: register access, trap vectors, MMU descriptor
//! layout, context switching and the interrupt controller / timer / serial
//! bring-up for each supported machine.
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "arm")] {
        pub mod arm;
        use arm as imp;
    } else if #[cfg(target_arch = "x86")] {
        pub mod x86;
        use x86 as imp;
    } else {
        compile_error!("unsupported architecture (target_arch unsupported)");
    }
}

pub use imp::{
    cpu_id, halt, init_early, init_percpu, irq_disable, irq_enable, irq_enabled, save_pcs,
    smp_start_secondaries, wait_for_interrupt,
};

/// Context switching and trap frames.
pub mod threading {
    pub use super::imp::threading::{
        Context, TrapFrame, context_switch, on_dispatch, trap_return,
    };
}

/// Page-table descriptor manipulation.
pub mod paging {
    pub use super::imp::paging::{
        PageTable, Pte, init_percpu as paging_init_percpu, invalidate_all, invalidate_page,
        kernel_map_init, kernel_table, load, load_kernel, load_root,
    };
}

pub mod serial {
    pub use super::imp::serial::{SERIAL, Serial, _serial};
}

/// Interrupt controller binding (GIC on ARM, LAPIC + 8259 on i386).
pub mod irqchip {
    pub use super::imp::irqchip::{
        IPI_IRQ, TIMER_IRQ, current, enable, eoi, init, init_percpu, mask, send_ipi, unmask,
    };
}

pub mod timer {
    pub use super::imp::timer::{ack, init_percpu};
}

pub mod power {
    pub use super::imp::power::{reboot, shutdown};
}

/// Signal frame setup and return.
pub mod signal {
    pub use super::imp::signal::{STUB_CODE, signal_prepare, signal_return};
}

/// Runs `f` with local IRQs masked, restoring the previous state afterwards.
pub fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    let was_enabled = irq_enabled();
    unsafe { irq_disable() };
    let r = f();
    if was_enabled {
        unsafe { irq_enable() };
    }
    r
}
