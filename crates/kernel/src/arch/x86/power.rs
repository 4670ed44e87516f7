//! Emulator-friendly power controls.

use super::registers::{outb, outw};

pub fn shutdown() -> ! {
    // QEMU ACPI PM1a control
    outw(0x604, 0x2000);
    super::halt()
}

pub fn reboot() -> ! {
    // Pulse the keyboard controller reset line
    outb(0x64, 0xFE);
    super::halt()
}
