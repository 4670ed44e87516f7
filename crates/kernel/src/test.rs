//! In-kernel test harness: runs every `#[test_case]` from the init task,
//! ordered so the allocators are proven before the code that depends on
//! them, then powers the machine off.

use core::any::type_name;

use alloc::vec::Vec;

use crate::arch::power::shutdown;
use crate::sync::timer;

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        $crate::logln_ext!("test", "92", $($arg)*)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestPriority {
    /// Page allocator and object pools: everything else needs them.
    Highest,
    /// Memory management above the allocators.
    High,
    /// Scheduler and synchronization.
    Medium,
    /// IPC, processes, end-to-end scenarios.
    Lowest,
}

fn priority_of(name: &str) -> TestPriority {
    if name.contains("::page::") || name.contains("::object_pool::") || name.contains("::kalloc::")
    {
        TestPriority::Highest
    } else if name.contains("::memory::") {
        TestPriority::High
    } else if name.contains("::sync::") || name.contains("::sched::") {
        TestPriority::Medium
    } else {
        TestPriority::Lowest
    }
}

pub trait Testable {
    fn run(&self);

    #[inline(always)]
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }

    #[inline(always)]
    fn priority(&self) -> TestPriority {
        priority_of(self.name())
    }
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        self()
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    let mut ordered: Vec<&&dyn Testable> = tests.iter().collect();
    ordered.sort_by_key(|t| t.priority());

    crate::serial!("\n");
    crate::test_log!("running {} tests", ordered.len());

    for test in ordered {
        crate::test_log!("{} ...", test.name());
        let start_us = timer::uptime_ms();
        test.run();
        let delta_ms = timer::uptime_ms() - start_us;
        crate::serial_log!("[ \x1B[92m OK   \x1B[0m  ]\x1b[90m:\x1B[0m delta {delta_ms}ms");
    }

    crate::test_log!("all tests passed");
    shutdown();
}
