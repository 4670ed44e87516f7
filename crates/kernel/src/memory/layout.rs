//! The kernel's view of the address space.
//!
//! All of physical RAM up to [`PHYS_LIMIT`] is mapped linearly at
//! [`VIRT_KERNEL_BASE`]; the device window follows it with caching disabled,
//! and the exception vectors sit in the last page-aligned slot of the
//! address space. Outside the device window, kernel-virtual to physical is a
//! pure offset shift.

use super::{PhysAddr, VirtAddr};

/// Everything below this address belongs to user mappings.
pub const VIRT_KERNEL_BASE: usize = 0x8000_0000;

/// Upper bound of physical RAM the kernel manages.
pub const PHYS_LIMIT: usize = 0x1000_0000;

/// Physical memory available before the full kernel map is active
/// (the entry translation table maps only this much).
pub const PHYS_ENTRY_LIMIT: usize = 0x0100_0000;

/// Where the exception vector page is mapped.
pub const VIRT_VECTOR_BASE: usize = 0xFFFF_0000;

/// End of the device window ([`VIRT_KERNEL_BASE`]` + PHYS_LIMIT` .. this).
pub const VIRT_DEVICE_END: usize = VIRT_VECTOR_BASE;

#[inline(always)]
pub const fn pa_to_kva(pa: PhysAddr) -> VirtAddr {
    VirtAddr::new(pa.into_raw() + VIRT_KERNEL_BASE)
}

#[inline(always)]
pub const fn kva_to_pa(va: VirtAddr) -> PhysAddr {
    PhysAddr::new(va.into_raw() - VIRT_KERNEL_BASE)
}

/// Kernel-virtual address of a memory-mapped device register block.
#[inline(always)]
pub const fn device_kva(pa: usize) -> VirtAddr {
    VirtAddr::new(pa + VIRT_KERNEL_BASE)
}
