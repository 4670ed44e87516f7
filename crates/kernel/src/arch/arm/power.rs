//! Halt and reset, via the ARM semihosting interface (the kernel targets
//! emulated boards; on silicon the loop-forever fallback applies).

const SEMIHOST_SYS_EXIT: u32 = 0x18;
const ADP_STOPPED_APPLICATION_EXIT: u32 = 0x20026;

fn semihost(op: u32, arg: u32) {
    unsafe {
        core::arch::asm!(
            "svc 0x123456",
            in("r0") op,
            in("r1") arg,
            options(nostack)
        );
    }
}

pub fn shutdown() -> ! {
    semihost(SEMIHOST_SYS_EXIT, ADP_STOPPED_APPLICATION_EXIT);
    super::halt()
}

pub fn reboot() -> ! {
    // Board-level reset: unlock SYS_LOCK, poke SYS_RESETCTL
    use crate::memory::layout::device_kva;
    unsafe {
        device_kva(0x1000_0020).into_ptr::<u32>().write_volatile(0xA05F);
        device_kva(0x1000_0040).into_ptr::<u32>().write_volatile(0x4);
    }
    super::halt()
}
