//! Scheduler tick on the LAPIC timer.

use super::{irqchip, lapic};

/// Bus-clock counts (divided by 16) per tick; QEMU's LAPIC timer runs at
/// 1 GHz, so this approximates the configured tick rate.
const BUS_HZ_DIV16: u64 = 1_000_000_000 / 16;

pub fn init_percpu(hz: u64) {
    lapic::timer_start(irqchip::TIMER_IRQ, (BUS_HZ_DIV16 / hz) as u32);
}

/// The LAPIC needs only the EOI the dispatch path already sends.
pub fn ack() {}
