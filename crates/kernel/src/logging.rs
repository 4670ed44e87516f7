//! Serial logging macros.
//!
//! Every line carries a boot-relative timestamp and a colored severity tag.
//! `debug!` optionally names the subsystem type it speaks for.

use core::fmt::Write;

pub const MIN_LOG_TAG_WIDTH: usize = 5;

pub(crate) fn log_time_parts(ms: u64) -> (u32, u8, u8, u16) {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    (
        hours as u32,
        (minutes % 60) as u8,
        (seconds % 60) as u8,
        (ms % 1000) as u16,
    )
}

#[macro_export]
macro_rules! serial {
    ($($arg:tt)*) => {
        $crate::arch::serial::_serial(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_log {
    ($($arg:tt)*) => {{
        let (hours, minutes, seconds, ms) =
            $crate::logging::log_time_parts($crate::sync::timer::uptime_ms());
        $crate::serial!(
            "[{hours:02}:{minutes:02}:{seconds:02}.{ms:03}] {}\n",
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! logln_ext {
    ($name: literal, $name_color: literal, as $kind: expr, $($arg:tt)*) => {
        $crate::serial_log!(
            "[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m {kind}:\x1B[0m {}",
            format_args!($($arg)*),
            name_color = $name_color,
            name = $name,
            kind = $kind,
            width = $crate::logging::MIN_LOG_TAG_WIDTH
        )
    };

    ($name: literal, $name_color: literal, $($arg:tt)*) => {
        $crate::serial_log!(
            "[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m:\x1B[0m {}",
            format_args!($($arg)*),
            name_color = $name_color,
            name = $name,
            width = $crate::logging::MIN_LOG_TAG_WIDTH
        )
    };
}

/// Debug info; takes an optional module type as its first argument.
#[macro_export]
macro_rules! debug {
    ($mod: ty, $($arg:tt)*) => {{
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("debug", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => {{
        $crate::logln_ext!("debug", 91, $($arg)*)
    }};
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::logln_ext!("info", 92, $($arg)*));
}

#[macro_export]
macro_rules! warn {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("warn", 93, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("warn", 93, $($arg)*));
}

#[macro_export]
macro_rules! error {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("error", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("error", 91, $($arg)*));
}

/// Panic-path printing: bypasses the serial lock, which may be held by the
/// very code that just died.
#[macro_export]
macro_rules! panic_print {
    ($($arg:tt)*) => {
        $crate::logging::_panic_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

#[doc(hidden)]
pub fn _panic_print(args: core::fmt::Arguments) {
    // The serial lock may be held by the code that died; write through a
    // fresh handle instead of deadlocking or double-acquiring.
    let mut serial = crate::arch::serial::Serial;
    let _ = serial.write_fmt(args);
}
