//! The portable interrupt-controller facade, bound to the GIC.

use super::gic;

/// Cortex-A9 private timer PPI.
pub const TIMER_IRQ: u32 = 29;
/// SGI used for cross-CPU reschedule kicks.
pub const IPI_IRQ: u32 = 0;

pub fn init() {
    gic::init();
}

pub fn init_percpu() {
    gic::init_percpu();
}

pub fn enable(irq: u32, cpu: usize) {
    if irq < 32 {
        // SGIs/PPIs are banked per CPU; nothing to route
        gic::unmask(irq);
    } else {
        gic::enable(irq, cpu);
    }
}

pub fn mask(irq: u32) {
    gic::mask(irq);
}

pub fn unmask(irq: u32) {
    gic::unmask(irq);
}

pub fn current() -> Option<u32> {
    gic::current()
}

pub fn eoi(irq: u32) {
    gic::eoi(irq);
}

pub fn send_ipi(cpu: usize) {
    gic::send_sgi(cpu, IPI_IRQ);
}
