//! ARMv7-A short-descriptor translation tables.
//!
//! Two-level layout: the kernel table is a full 16 KiB L1 table loaded
//! through TTBR1, user tables are 8 KiB (TTBCR.N = 1, covering the low
//! 2 GiB) loaded through TTBR0, so the kernel half is shared by hardware
//! rather than by copying entries.
//!
//! Second-level tables are 1 KiB; two of them live in the bottom half of one
//! frame and the top half holds a software word per entry, at byte offset
//! `pte + L2_NR_ENTRIES * 2 * 4`. The hardware descriptor cannot represent
//! `PAGE` (managed mapping) or `COW`, so they live in the sidecar word along
//! with the rest of the [`VmFlags`] the mapping was created with.

use core::ptr::NonNull;

use bitfield_struct::bitfield;

use crate::memory::layout::{
    PHYS_LIMIT, VIRT_DEVICE_END, VIRT_KERNEL_BASE, VIRT_VECTOR_BASE, pa_to_kva,
};
use crate::memory::page::{self, AllocFlags, PageTag};
use crate::memory::vm::VmFlags;
use crate::memory::{AllocError, PAGE_SIZE, PhysAddr, VirtAddr};

use super::registers;

pub const L1_SECTION_SIZE: usize = 1 << 20;
/// Entries in one second-level table.
pub const L2_NR_ENTRIES: usize = 256;
/// User L1 table: 2 GiB of address space, 8 KiB of entries (order-1 block).
const L1_USER_ENTRIES: usize = 2048;
const L1_KERNEL_ENTRIES: usize = 4096;
/// Word offset from a hardware PTE to its software sidecar.
const PTE_SW_OFFSET: usize = L2_NR_ENTRIES * 2;

/// Access-permission encodings (APX:AP).
const AP_PRIV_RW: u32 = 0b001;
const AP_USER_RO: u32 = 0b010;
const AP_BOTH_RW: u32 = 0b011;
const AP_PRIV_RO: u32 = 0b101;

#[bitfield(u32)]
struct L2Desc {
    /// Execute-never (small-page bit 0).
    xn: bool,
    /// Descriptor type: set for a small page.
    small: bool,
    bufferable: bool,
    cacheable: bool,
    #[bits(2)]
    ap: u32,
    #[bits(3)]
    tex: u32,
    apx: bool,
    shareable: bool,
    not_global: bool,
    #[bits(20)]
    base: u32,
}

#[bitfield(u32)]
struct L1Section {
    #[bits(2)]
    kind: u32,
    bufferable: bool,
    cacheable: bool,
    xn: bool,
    #[bits(4)]
    domain: u32,
    _impl_defined: bool,
    #[bits(2)]
    ap: u32,
    #[bits(3)]
    tex: u32,
    apx: bool,
    shareable: bool,
    not_global: bool,
    _supersection: bool,
    _ns: bool,
    #[bits(12)]
    base: u32,
}

const L1_TYPE_MASK: u32 = 0x3;
const L1_TYPE_TABLE: u32 = 0x1;
const L1_TYPE_SECTION: u32 = 0x2;
const L1_TABLE_BASE_MASK: u32 = 0xFFFF_FC00;

#[inline]
const fn l1_index(va: VirtAddr) -> usize {
    va.into_raw() >> 20
}

#[inline]
const fn l2_index(va: VirtAddr) -> usize {
    (va.into_raw() >> 12) & (L2_NR_ENTRIES - 1)
}

fn ap_for(flags: VmFlags) -> u32 {
    match (
        flags.contains(VmFlags::USER),
        flags.contains(VmFlags::WRITE),
    ) {
        (false, false) => AP_PRIV_RO,
        (false, true) => AP_PRIV_RW,
        (true, false) => AP_USER_RO,
        (true, true) => AP_BOTH_RW,
    }
}

fn l2_encode(pa: PhysAddr, flags: VmFlags) -> u32 {
    let ap = ap_for(flags);
    L2Desc::new()
        .with_small(true)
        .with_base((pa.into_raw() >> 12) as u32)
        .with_ap(ap & 0b11)
        .with_apx(ap & 0b100 != 0)
        .with_xn(flags.contains(VmFlags::USER) && !flags.contains(VmFlags::EXEC))
        .with_bufferable(!flags.contains(VmFlags::NOCACHE))
        .with_cacheable(!flags.contains(VmFlags::NOCACHE))
        .with_shareable(true)
        .into_bits()
}

fn l1_section_encode(pa: PhysAddr, flags: VmFlags) -> u32 {
    let ap = ap_for(flags);
    L1Section::new()
        .with_kind(L1_TYPE_SECTION)
        .with_base((pa.into_raw() >> 20) as u32)
        .with_ap(ap & 0b11)
        .with_apx(ap & 0b100 != 0)
        .with_bufferable(!flags.contains(VmFlags::NOCACHE))
        .with_cacheable(!flags.contains(VmFlags::NOCACHE))
        .with_shareable(true)
        .into_bits()
}

/// A handle to one page-table entry plus its software sidecar word.
pub struct Pte {
    hw: NonNull<u32>,
}

impl Pte {
    #[inline]
    fn sw(&self) -> NonNull<u32> {
        unsafe { self.hw.add(PTE_SW_OFFSET) }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        unsafe { self.hw.read_volatile() & 0x3 != 0 }
    }

    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new((unsafe { self.hw.read_volatile() } & 0xFFFF_F000) as usize)
    }

    #[inline]
    pub fn flags(&self) -> VmFlags {
        VmFlags::from_bits_truncate(unsafe { self.sw().read_volatile() })
    }

    pub fn set(&mut self, pa: PhysAddr, flags: VmFlags) {
        unsafe {
            self.hw.write_volatile(l2_encode(pa, flags));
            self.sw().write_volatile(flags.bits());
        }
        registers::dsb();
    }

    pub fn clear(&mut self) {
        unsafe {
            self.hw.write_volatile(0);
            self.sw().write_volatile(0);
        }
        registers::dsb();
    }
}

/// An L1 translation table plus ownership of its second-level tables.
#[derive(Debug)]
pub struct PageTable {
    root: PhysAddr,
    user: bool,
}

unsafe impl Send for PageTable {}

impl PageTable {
    /// Allocates an empty user table. The kernel half needs no entries here;
    /// TTBR1 serves it.
    pub fn create_user() -> Result<Self, AllocError> {
        // 8 KiB, naturally aligned by the buddy allocator
        let block = page::alloc_block(1, AllocFlags::ZERO, PageTag::Pgtab).ok_or(AllocError)?;
        page::ref_inc(block);
        Ok(Self {
            root: page::phys_addr(block),
            user: true,
        })
    }

    pub const fn root_phys(&self) -> PhysAddr {
        self.root
    }

    /// Whether this is a user table (kernel half served by TTBR1).
    pub const fn is_user(&self) -> bool {
        self.user
    }

    fn l1(&self) -> NonNull<u32> {
        NonNull::new(pa_to_kva(self.root).into_ptr()).unwrap()
    }

    fn l1_entries(&self) -> usize {
        if self.user {
            L1_USER_ENTRIES
        } else {
            L1_KERNEL_ENTRIES
        }
    }

    /// Walks to the PTE mapping `va`, allocating the second-level table if
    /// `alloc` is set. `None` means either a missing table (`alloc` clear)
    /// or out of memory.
    pub fn lookup(&mut self, va: VirtAddr, alloc: bool) -> Option<Pte> {
        let idx = l1_index(va);
        assert!(
            idx < self.l1_entries(),
            "va {va:?} out of range for this table"
        );

        let l1 = self.l1();
        let entry = unsafe { l1.add(idx).read_volatile() };

        let table_pa = match entry & L1_TYPE_MASK {
            0 => {
                if !alloc {
                    return None;
                }
                let page = page::alloc_block(0, AllocFlags::ZERO, PageTag::Pgtab)?;
                page::ref_inc(page);
                let pa = page::phys_addr(page).into_raw() as u32;

                // Two 1 KiB tables per frame: fill the even/odd L1 pair so
                // the sidecar layout stays uniform.
                let pair = idx & !1;
                unsafe {
                    l1.add(pair)
                        .write_volatile(pa | L1_TYPE_TABLE);
                    l1.add(pair + 1)
                        .write_volatile((pa + (L2_NR_ENTRIES * 4) as u32) | L1_TYPE_TABLE);
                }
                registers::dsb();
                let entry = unsafe { l1.add(idx).read_volatile() };
                PhysAddr::new((entry & L1_TABLE_BASE_MASK) as usize)
            }
            L1_TYPE_TABLE => PhysAddr::new((entry & L1_TABLE_BASE_MASK) as usize),
            _ => panic!("not a page table at L1 index {idx}"),
        };

        let table: NonNull<u32> = NonNull::new(pa_to_kva(table_pa).into_ptr())?;
        Some(Pte {
            hw: unsafe { table.add(l2_index(va)) },
        })
    }

    /// Static section/page mappings for the kernel half; init-time only.
    fn map_static(&mut self, mut va: VirtAddr, mut pa: PhysAddr, mut n: usize, flags: VmFlags) {
        assert!(va.is_aligned(PAGE_SIZE) && pa.is_aligned(PAGE_SIZE) && n % PAGE_SIZE == 0);

        while n != 0 {
            if va.is_aligned(L1_SECTION_SIZE)
                && pa.is_aligned(L1_SECTION_SIZE)
                && n >= L1_SECTION_SIZE
            {
                let idx = l1_index(va);
                unsafe {
                    let slot = self.l1().add(idx);
                    assert!(slot.read_volatile() == 0, "remap at L1 index {idx}");
                    slot.write_volatile(l1_section_encode(pa, flags));
                }
                va += L1_SECTION_SIZE;
                pa += L1_SECTION_SIZE;
                n -= L1_SECTION_SIZE;
            } else {
                let mut pte = self
                    .lookup(va, true)
                    .expect("out of memory for kernel map");
                assert!(!pte.valid(), "remap at {va:?}");
                pte.set(pa, flags);
                va += PAGE_SIZE;
                pa += PAGE_SIZE;
                n -= PAGE_SIZE;
            }
        }
    }
}

impl Drop for PageTable {
    /// Frees the second-level tables and the root block. All managed
    /// mappings must have been removed already.
    fn drop(&mut self) {
        // borrowed handles to the kernel table carry no ownership
        if !self.user {
            return;
        }

        let l1 = self.l1();
        for idx in (0..L1_USER_ENTRIES).step_by(2) {
            let entry = unsafe { l1.add(idx).read_volatile() };
            if entry == 0 {
                continue;
            }
            assert!(entry & L1_TYPE_MASK == L1_TYPE_TABLE);

            let frame_pa = PhysAddr::new((entry & L1_TABLE_BASE_MASK) as usize).align_down(PAGE_SIZE);
            let block = page::from_phys(frame_pa);
            if cfg!(debug_assertions) {
                let words: NonNull<u32> = NonNull::new(pa_to_kva(frame_pa).into_ptr()).unwrap();
                for w in 0..PTE_SW_OFFSET {
                    debug_assert!(
                        unsafe { words.add(w).read_volatile() } == 0,
                        "PTE still live while destroying table"
                    );
                }
            }
            if page::ref_dec(block) == 0 {
                page::free_block(block, 0);
            }
        }

        let root = page::from_phys(self.root);
        if page::ref_dec(root) == 0 {
            page::free_block(root, 1);
        }
    }
}

static KERNEL_ROOT: spin::Once<PhysAddr> = spin::Once::new();

/// Build the master kernel translation table: all of RAM linearly mapped,
/// the device window uncached, and the exception vector page aliased high.
pub unsafe fn kernel_map_init() {
    unsafe extern "C" {
        static __vectors: u8;
    }

    let block =
        page::alloc_block(2, AllocFlags::ZERO, PageTag::KernelVm).expect("out of memory");
    page::ref_inc(block);
    let mut table = PageTable {
        root: page::phys_addr(block),
        user: false,
    };

    table.map_static(
        VirtAddr::new(VIRT_KERNEL_BASE),
        PhysAddr::new(0),
        PHYS_LIMIT,
        VmFlags::READ | VmFlags::WRITE,
    );
    table.map_static(
        VirtAddr::new(VIRT_KERNEL_BASE + PHYS_LIMIT),
        PhysAddr::new(PHYS_LIMIT),
        VIRT_DEVICE_END - (VIRT_KERNEL_BASE + PHYS_LIMIT),
        VmFlags::READ | VmFlags::WRITE | VmFlags::NOCACHE,
    );
    let vectors_pa =
        PhysAddr::new((&raw const __vectors).addr() - VIRT_KERNEL_BASE).align_down(PAGE_SIZE);
    table.map_static(
        VirtAddr::new(VIRT_VECTOR_BASE),
        vectors_pa,
        PAGE_SIZE,
        VmFlags::READ,
    );

    KERNEL_ROOT.call_once(|| table.root);
    // the kernel table lives forever
    core::mem::forget(table);

    unsafe { init_percpu() };
}

/// Switch this CPU from the entry table to the full kernel map.
pub unsafe fn init_percpu() {
    let root = kernel_root().into_raw() as u32;
    registers::ttbr0_set(root);
    registers::ttbr1_set(root);
    // TTBR0 covers the low 2 GiB only
    registers::ttbcr_set(1);
    registers::tlbiall(0);
    registers::dsb();
    registers::isb();
}

fn kernel_root() -> PhysAddr {
    *KERNEL_ROOT.get().expect("kernel map not initialized")
}

/// A borrowed handle to the kernel half mappings (used by `vm` for managed
/// kernel pages).
pub fn kernel_table() -> PageTable {
    PageTable {
        root: kernel_root(),
        user: false,
    }
}

/// Install a user translation table.
pub unsafe fn load(table: &PageTable) {
    registers::ttbr0_set(table.root_phys().into_raw() as u32);
    registers::tlbiall(0);
    registers::dsb();
    registers::isb();
}

/// Install a user table by its root physical address (dispatch fast path).
pub unsafe fn load_root(root: PhysAddr) {
    registers::ttbr0_set(root.into_raw() as u32);
    registers::tlbiall(0);
    registers::dsb();
    registers::isb();
}

/// Back to the master kernel table (idle, or between user tasks).
pub unsafe fn load_kernel() {
    registers::ttbr0_set(kernel_root().into_raw() as u32);
    registers::tlbiall(0);
    registers::dsb();
    registers::isb();
}

/// Invalidate a single mapping by virtual address.
pub fn invalidate_page(va: VirtAddr) {
    registers::tlbimva(va.align_down(PAGE_SIZE).into_raw() as u32);
    registers::dsb();
}

pub fn invalidate_all() {
    registers::tlbiall(0);
    registers::dsb();
}
