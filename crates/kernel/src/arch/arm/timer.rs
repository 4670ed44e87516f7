//! Cortex-A9 per-CPU private timer, used as the scheduler tick source.

use crate::memory::layout::device_kva;

const TIMER_OFFSET: usize = 0x600;

const LOAD: usize = 0x00;
const CONTROL: usize = 0x08;
const INTSTATUS: usize = 0x0C;

const CTRL_ENABLE: u32 = 1 << 0;
const CTRL_AUTO_RELOAD: u32 = 1 << 1;
const CTRL_IRQ_ENABLE: u32 = 1 << 2;

/// PERIPHCLK on the reference board.
const TIMER_CLK_HZ: u64 = 100_000_000;

#[inline]
fn reg(offset: usize) -> *mut u32 {
    let base = {
        let value: u32;
        unsafe {
            core::arch::asm!(
                "mrc p15, 4, {v}, c15, c0, 0",
                v = out(reg) value,
                options(nomem, nostack, preserves_flags)
            );
        }
        value as usize
    };
    device_kva(base + TIMER_OFFSET + offset).into_ptr()
}

/// Program this CPU's private timer to fire `hz` times a second.
pub fn init_percpu(hz: u64) {
    unsafe {
        reg(LOAD).write_volatile((TIMER_CLK_HZ / hz - 1) as u32);
        reg(CONTROL).write_volatile(CTRL_ENABLE | CTRL_AUTO_RELOAD | CTRL_IRQ_ENABLE);
    }
}

/// Clear the pending tick; call before returning from the timer IRQ.
pub fn ack() {
    unsafe { reg(INTSTATUS).write_volatile(1) };
}
