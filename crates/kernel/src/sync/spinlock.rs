//! IRQ-saving spinlocks.
//!
//! Acquisition disables interrupts on this CPU (nested sections bump a
//! per-CPU save count; only the outermost restore re-enables them), records
//! the owning CPU and captures the caller's PC chain. Re-acquisition by the
//! same CPU dumps the recorded PCs and panics.
//!
//! The raw lock plugs into `lock_api`, so data-protecting locks get the
//! usual guard API ([`SpinLock`]); subsystems that must hold a lock across a
//! context switch (the scheduler) use [`RawSpinLock`] directly.
//!
//! The acquire/release orderings double as the architecture memory barrier:
//! nothing weaker than per-lock ordering is promised across CPUs.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lock_api::GuardSend;

use crate::arch;
use crate::config::SPIN_MAX_PCS;
use crate::sched::cpu;

pub struct RawSpinLock {
    locked: AtomicBool,
    /// Owning CPU id + 1; 0 while unheld.
    owner: AtomicUsize,
    name: &'static str,
    /// Call chain captured at acquisition; written only by the holder.
    pcs: UnsafeCell<[usize; SPIN_MAX_PCS]>,
}

unsafe impl Send for RawSpinLock {}
unsafe impl Sync for RawSpinLock {}

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            name,
            pcs: UnsafeCell::new([0; SPIN_MAX_PCS]),
        }
    }

    /// Whether this CPU is the current holder. Only meaningful with IRQs
    /// disabled (the answer cannot change underneath us then).
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == arch::cpu_id() + 1
    }

    pub fn acquire(&self) {
        cpu::irq_save();

        if self.holding() {
            self.print_pcs();
            panic!("CPU {} is already holding {}", arch::cpu_id(), self.name);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        self.owner.store(arch::cpu_id() + 1, Ordering::Relaxed);
        arch::save_pcs(unsafe { &mut *self.pcs.get() });
    }

    pub fn try_acquire(&self) -> bool {
        cpu::irq_save();

        if !self.holding()
            && self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            self.owner.store(arch::cpu_id() + 1, Ordering::Relaxed);
            arch::save_pcs(unsafe { &mut *self.pcs.get() });
            true
        } else {
            cpu::irq_restore();
            false
        }
    }

    pub fn release(&self) {
        if !self.holding() {
            self.print_pcs();
            panic!("CPU {} releasing {} it does not hold", arch::cpu_id(), self.name);
        }

        self.owner.store(0, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        cpu::irq_restore();
    }

    /// Dump the call chain recorded at the last acquisition.
    pub fn print_pcs(&self) {
        let pcs = unsafe { &*self.pcs.get() };
        crate::panic_print!("lock '{}' last acquired at:", self.name);
        for pc in pcs.iter().take_while(|pc| **pc != 0) {
            crate::panic_print!("  [{pc:#010x}]");
        }
    }
}

unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new("spinlock");
    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        self.acquire();
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.release();
    }
}

pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// A named spinlock around `value`.
pub const fn spin_lock<T>(name: &'static str, value: T) -> SpinLock<T> {
    SpinLock::const_new(RawSpinLock::new(name), value)
}
