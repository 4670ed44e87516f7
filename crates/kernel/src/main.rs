#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test::test_runner)]
#![reexport_test_harness_main = "kernel_testmain"]
#![feature(sync_unsafe_cell)]
#![feature(alloc_error_handler)]

#[cfg(test)]
mod test;

mod arch;
mod config;
mod dev;
mod fs;
mod ipc;
mod irq;
mod logging;
mod memory;
mod process;
mod sched;
mod sync;
mod syscalls;
mod task;
mod trap;
mod tty;
mod utils;

extern crate alloc;

pub use memory::{PhysAddr, VirtAddr};

use core::panic::PanicInfo;

use config::PRIORITY_KERNEL;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    unsafe {
        arch::irq_disable();
    }

    panic_print!(
        "\x1B[38;2;255;0;0mkernel panic on CPU {}:\n{}, at {}\x1B[0m",
        arch::cpu_id(),
        info.message(),
        info.location().unwrap()
    );

    let mut pcs = [0usize; config::SPIN_MAX_PCS];
    arch::save_pcs(&mut pcs);
    panic_print!("call chain:");
    for pc in pcs.iter().take_while(|pc| **pc != 0) {
        panic_print!("  [{pc:#010x}]");
    }

    #[cfg(test)]
    arch::power::shutdown();
    #[cfg(not(test))]
    arch::halt()
}

#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {layout:?}")
}

/// Boot CPU entry, called from the architecture start code with the MMU on
/// the entry translation table.
#[unsafe(no_mangle)]
pub extern "C" fn kmain() -> ! {
    arch::init_early();
    info!("opal-core booting on CPU {}", arch::cpu_id());

    memory::page::init_low();
    memory::kalloc::init();
    unsafe { arch::paging::kernel_map_init() };
    memory::page::init_high();

    arch::irqchip::init();
    sched::init();
    process::init();
    irq::init();
    arch::init_percpu();
    tty::init();

    process::spawn_kernel("init", init_main, 0, PRIORITY_KERNEL).expect("cannot spawn init");

    arch::smp_start_secondaries();

    info!("entering the scheduler");
    unsafe { sched::start() }
}

/// Secondary CPUs land here once released, with the entry table active.
#[unsafe(no_mangle)]
pub extern "C" fn kmain_secondary() -> ! {
    unsafe { arch::paging::paging_init_percpu() };
    arch::init_percpu();
    info!("CPU {} online", arch::cpu_id());
    unsafe { sched::start() }
}

/// Pid 1. Runs the in-kernel test suite when built for testing; otherwise
/// waits for a filesystem to appear and starts the real init from it.
fn init_main(_arg: usize) {
    info!("init: pid {} up", process::current_pid());

    #[cfg(test)]
    kernel_testmain();

    loop {
        match process::exec::exec("/bin/init", &[b"init"], &[]) {
            Ok(_) => unreachable!("exec returned into the kernel"),
            Err(e) => {
                debug!("init: /bin/init not available ({e}); retrying");
                sched::sleep_current(config::TICKS_PER_SECOND);
            }
        }
    }
}
