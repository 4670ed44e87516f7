//! i386 two-level page tables.
//!
//! Unlike ARM there is no sidecar: the descriptor's three AVL bits are
//! enough to carry the `PAGE` and `COW` software flags directly.

use core::ptr::NonNull;

use crate::memory::layout::{PHYS_LIMIT, VIRT_KERNEL_BASE, pa_to_kva};
use crate::memory::page::{self, AllocFlags, PageTag};
use crate::memory::vm::VmFlags;
use crate::memory::{AllocError, PhysAddr, VirtAddr};

use super::registers;

const PDE_COUNT: usize = 1024;
const PTE_COUNT: usize = 1024;
/// First PDE of the kernel half.
const KERNEL_PDE: usize = VIRT_KERNEL_BASE >> 22;

const P_PRESENT: u32 = 1 << 0;
const P_WRITE: u32 = 1 << 1;
const P_USER: u32 = 1 << 2;
const P_PCD: u32 = 1 << 4;
const P_LARGE: u32 = 1 << 7;
/// AVL bits carrying the software flags.
const P_SW_PAGE: u32 = 1 << 9;
const P_SW_COW: u32 = 1 << 10;

fn encode(pa: PhysAddr, flags: VmFlags) -> u32 {
    let mut bits = pa.into_raw() as u32 | P_PRESENT;
    if flags.contains(VmFlags::WRITE) {
        bits |= P_WRITE;
    }
    if flags.contains(VmFlags::USER) {
        bits |= P_USER;
    }
    if flags.contains(VmFlags::NOCACHE) {
        bits |= P_PCD;
    }
    if flags.contains(VmFlags::PAGE) {
        bits |= P_SW_PAGE;
    }
    if flags.contains(VmFlags::COW) {
        bits |= P_SW_COW;
    }
    bits
}

fn decode(bits: u32) -> VmFlags {
    let mut flags = VmFlags::READ;
    if bits & P_WRITE != 0 {
        flags |= VmFlags::WRITE;
    }
    if bits & P_USER != 0 {
        flags |= VmFlags::USER | VmFlags::EXEC;
    }
    if bits & P_PCD != 0 {
        flags |= VmFlags::NOCACHE;
    }
    if bits & P_SW_PAGE != 0 {
        flags |= VmFlags::PAGE;
    }
    if bits & P_SW_COW != 0 {
        flags |= VmFlags::COW;
    }
    flags
}

pub struct Pte {
    entry: NonNull<u32>,
}

impl Pte {
    #[inline]
    pub fn valid(&self) -> bool {
        unsafe { self.entry.read_volatile() } & P_PRESENT != 0
    }

    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new((unsafe { self.entry.read_volatile() } & 0xFFFF_F000) as usize)
    }

    #[inline]
    pub fn flags(&self) -> VmFlags {
        decode(unsafe { self.entry.read_volatile() })
    }

    pub fn set(&mut self, pa: PhysAddr, flags: VmFlags) {
        unsafe { self.entry.write_volatile(encode(pa, flags)) };
    }

    pub fn clear(&mut self) {
        unsafe { self.entry.write_volatile(0) };
    }
}

#[derive(Debug)]
pub struct PageTable {
    root: PhysAddr,
    user: bool,
}

unsafe impl Send for PageTable {}

impl PageTable {
    pub fn create_user() -> Result<Self, AllocError> {
        let dir = page::alloc_one(AllocFlags::ZERO, PageTag::Pgtab).ok_or(AllocError)?;
        page::ref_inc(dir);

        // The kernel half is shared by aliasing the master directory
        let kernel = kernel_root();
        unsafe {
            let src: *const u32 = pa_to_kva(kernel).into_ptr();
            let dst: *mut u32 = page::kva(dir).into_ptr();
            core::ptr::copy_nonoverlapping(src.add(KERNEL_PDE), dst.add(KERNEL_PDE), PDE_COUNT - KERNEL_PDE);
        }

        Ok(Self {
            root: page::phys_addr(dir),
            user: true,
        })
    }

    pub const fn root_phys(&self) -> PhysAddr {
        self.root
    }

    pub const fn is_user(&self) -> bool {
        self.user
    }

    fn dir(&self) -> NonNull<u32> {
        NonNull::new(pa_to_kva(self.root).into_ptr()).unwrap()
    }

    pub fn lookup(&mut self, va: VirtAddr, alloc: bool) -> Option<Pte> {
        let pde_idx = va.into_raw() >> 22;
        let dir = self.dir();
        let pde = unsafe { dir.add(pde_idx).read_volatile() };

        let table_pa = if pde & P_PRESENT == 0 {
            if !alloc {
                return None;
            }
            let table = page::alloc_one(AllocFlags::ZERO, PageTag::Pgtab)?;
            page::ref_inc(table);
            let pa = page::phys_addr(table);
            unsafe {
                dir.add(pde_idx)
                    .write_volatile(pa.into_raw() as u32 | P_PRESENT | P_WRITE | P_USER);
            }
            pa
        } else {
            assert!(pde & P_LARGE == 0, "not a page table");
            PhysAddr::new((pde & 0xFFFF_F000) as usize)
        };

        let table: NonNull<u32> = NonNull::new(pa_to_kva(table_pa).into_ptr())?;
        let pte_idx = (va.into_raw() >> 12) & (PTE_COUNT - 1);
        Some(Pte {
            entry: unsafe { table.add(pte_idx) },
        })
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        if !self.user {
            return;
        }

        let dir = self.dir();
        for idx in 0..KERNEL_PDE {
            let pde = unsafe { dir.add(idx).read_volatile() };
            if pde & P_PRESENT == 0 {
                continue;
            }
            let table = page::from_phys(PhysAddr::new((pde & 0xFFFF_F000) as usize));
            if page::ref_dec(table) == 0 {
                page::free_one(table);
            }
        }

        let root = page::from_phys(self.root);
        if page::ref_dec(root) == 0 {
            page::free_one(root);
        }
    }
}

static KERNEL_ROOT: spin::Once<PhysAddr> = spin::Once::new();

fn kernel_root() -> PhysAddr {
    *KERNEL_ROOT.get().expect("kernel map not initialized")
}

/// Build the master directory: 4 MiB large pages covering RAM linearly at
/// the kernel base, plus an uncached window for the local APIC.
pub unsafe fn kernel_map_init() {
    let dir = page::alloc_one(AllocFlags::ZERO, PageTag::KernelVm).expect("out of memory");
    page::ref_inc(dir);
    let entries: NonNull<u32> = NonNull::new(page::kva(dir).into_ptr()).unwrap();

    let large_pages = PHYS_LIMIT >> 22;
    for i in 0..large_pages {
        let pa = (i << 22) as u32;
        unsafe {
            entries
                .add(KERNEL_PDE + i)
                .write_volatile(pa | P_PRESENT | P_WRITE | P_LARGE);
        }
    }

    // LAPIC window: one uncached 4 MiB page at its physical address
    let lapic_pde = super::lapic::LAPIC_PA >> 22;
    unsafe {
        entries
            .add(lapic_pde)
            .write_volatile((super::lapic::LAPIC_PA as u32 & 0xFFC0_0000) | P_PRESENT | P_WRITE | P_PCD | P_LARGE);
    }

    KERNEL_ROOT.call_once(|| page::phys_addr(dir));
    unsafe { init_percpu() };
}

pub unsafe fn init_percpu() {
    registers::cr3_set(kernel_root().into_raw() as u32);
}

pub fn kernel_table() -> PageTable {
    PageTable {
        root: kernel_root(),
        user: false,
    }
}

pub unsafe fn load(table: &PageTable) {
    registers::cr3_set(table.root_phys().into_raw() as u32);
}

pub unsafe fn load_root(root: PhysAddr) {
    registers::cr3_set(root.into_raw() as u32);
}

pub unsafe fn load_kernel() {
    registers::cr3_set(kernel_root().into_raw() as u32);
}

pub fn invalidate_page(va: VirtAddr) {
    registers::invlpg(va.into_raw());
}

pub fn invalidate_all() {
    unsafe { load_kernel() };
}
