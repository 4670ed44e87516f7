//! The TTY boundary: a console character device over the serial port.
//!
//! Owns the input ring and delivers SIGINT/SIGQUIT to the foreground
//! process group on the canonical control characters. Line-discipline
//! proper lives with the out-of-tree console server.

use core::sync::atomic::{AtomicU32, Ordering};

use opal_abi::signal::{SIGINT, SIGQUIT, SigInfo};

use crate::dev::{self, CharDevOps};
use crate::process;
use crate::sync::semaphore::KSemaphore;
use crate::sync::spinlock::{SpinLock, spin_lock};

/// Console major number.
pub const TTY_MAJOR: usize = 1;

const INPUT_CAPACITY: usize = 256;

const CTRL_C: u8 = 0x03;
const CTRL_BACKSLASH: u8 = 0x1C;

struct InputRing {
    buf: [u8; INPUT_CAPACITY],
    read_pos: usize,
    write_pos: usize,
    count: usize,
}

static INPUT: SpinLock<InputRing> = spin_lock(
    "tty",
    InputRing {
        buf: [0; INPUT_CAPACITY],
        read_pos: 0,
        write_pos: 0,
        count: 0,
    },
);

/// Bytes available to read.
static AVAILABLE: KSemaphore = KSemaphore::new("tty_input", 0);

/// The process group that owns the terminal.
static FOREGROUND_PGID: AtomicU32 = AtomicU32::new(1);

pub fn set_foreground(pgid: u32) {
    FOREGROUND_PGID.store(pgid, Ordering::Relaxed);
}

pub fn foreground() -> u32 {
    FOREGROUND_PGID.load(Ordering::Relaxed)
}

fn signal_foreground(signo: u32) {
    let pgid = foreground();
    for proc in process::processes_in_group(pgid) {
        process::signal::post(
            proc,
            SigInfo {
                si_signo: signo,
                si_code: 0,
                si_value: 0,
            },
        );
    }
}

/// Feed one input byte; called from the UART interrupt task.
pub fn input(byte: u8) {
    match byte {
        CTRL_C => return signal_foreground(SIGINT),
        CTRL_BACKSLASH => return signal_foreground(SIGQUIT),
        _ => {}
    }

    let mut ring = INPUT.lock();
    if ring.count == INPUT_CAPACITY {
        // Oldest byte loses
        ring.read_pos = (ring.read_pos + 1) % INPUT_CAPACITY;
        ring.count -= 1;
    }
    let at = ring.write_pos;
    ring.buf[at] = byte;
    ring.write_pos = (at + 1) % INPUT_CAPACITY;
    ring.count += 1;
    drop(ring);
    AVAILABLE.put();
}

fn tty_read(_minor: u32, buf: &mut [u8]) -> isize {
    let mut n = 0usize;
    while n < buf.len() {
        // Block for the first byte, then drain what is there
        if n == 0 {
            if AVAILABLE.get().is_err() {
                return n as isize;
            }
        } else if !AVAILABLE.try_get() {
            break;
        }

        let mut ring = INPUT.lock();
        if ring.count == 0 {
            break;
        }
        let at = ring.read_pos;
        buf[n] = ring.buf[at];
        ring.read_pos = (at + 1) % INPUT_CAPACITY;
        ring.count -= 1;
        n += 1;
    }
    n as isize
}

fn tty_write(_minor: u32, buf: &[u8]) -> isize {
    let mut serial = crate::arch::serial::SERIAL.lock();
    for byte in buf {
        if *byte == b'\n' {
            serial.putc(b'\r');
        }
        serial.putc(*byte);
    }
    buf.len() as isize
}

fn tty_ioctl(_minor: u32, request: u32, arg: usize) -> isize {
    // TIOCSPGRP/TIOCGPGRP are all the core understands
    match request {
        0x5410 => {
            set_foreground(arg as u32);
            0
        }
        0x540F => foreground() as isize,
        _ => -(opal_abi::errno::ENOTTY as isize),
    }
}

/// Poll the UART for pending input; deferred-IRQ handler body.
fn uart_poll(_arg: usize) {
    let mut serial = crate::arch::serial::SERIAL.lock();
    while let Some(byte) = serial.getc() {
        drop(serial);
        input(byte);
        serial = crate::arch::serial::SERIAL.lock();
    }
}

pub fn init() {
    dev::register_char(
        TTY_MAJOR,
        CharDevOps {
            read: tty_read,
            write: tty_write,
            ioctl: tty_ioctl,
        },
    );

    // Console input arrives through a bottom-half task
    #[cfg(target_arch = "arm")]
    crate::irq::attach_task(44, uart_poll, 0);
    #[cfg(not(target_arch = "arm"))]
    let _ = uart_poll;
}
