//! Interrupt controller facade for i386: local APIC for the timer and
//! IPIs, legacy 8259 pair masked out of the way at boot.

use core::sync::atomic::Ordering;

use super::registers::outb;
use super::threading::CURRENT_IRQ;
use super::lapic;

/// LAPIC timer vector.
pub const TIMER_IRQ: u32 = 0x20;
/// Reschedule IPI vector.
pub const IPI_IRQ: u32 = 0xF0;

pub fn init() {
    // Mask every line of both 8259s; the APIC owns interrupts
    outb(0x21, 0xFF);
    outb(0xA1, 0xFF);
}

pub fn init_percpu() {
    lapic::init_percpu();
}

pub fn enable(_irq: u32, _cpu: usize) {
    // LAPIC-local vectors (timer, IPI) need no distributor routing
}

pub fn mask(_irq: u32) {}

pub fn unmask(_irq: u32) {}

/// The vector is latched from the trap frame during classification.
pub fn current() -> Option<u32> {
    Some(CURRENT_IRQ.load(Ordering::Relaxed))
}

pub fn eoi(_irq: u32) {
    lapic::eoi();
}

pub fn send_ipi(cpu: usize) {
    lapic::send_ipi(cpu, IPI_IRQ);
}
