//! The physical page allocator.
//!
//! Every frame of RAM gets a [`Page`] record in one boot-enumerated array;
//! free blocks live on per-order buddy lists chained through array indices,
//! so a block's buddy is simply `index ^ (1 << order)`.
//!
//! Init happens in two phases: [`init_low`] enrolls what the entry
//! translation table can reach (the first 16 MiB, minus the kernel image and
//! the page array itself), [`init_high`] the rest once the full kernel map
//! is live.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use super::layout::{PHYS_ENTRY_LIMIT, PHYS_LIMIT, kva_to_pa, pa_to_kva};
use super::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr, align_up};
use crate::sync::spinlock::{SpinLock, spin_lock};

/// The maximum page allocation order: blocks up to 4 MiB.
pub const PAGE_ORDER_MAX: u32 = 10;

const NONE: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Fill the allocated block with zeros.
        const ZERO = 1 << 0;
    }
}

/// Who owns a frame; stamped at allocation, checked by [`assert_owner`] on
/// hot paths. Purely advisory.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTag {
    Free = 0,
    Anon,
    Pgtab,
    KernelVm,
    Kstack,
    Slab,
    Mailbox,
    Buf,
    Pipe,
}

/// Physical frame metadata.
#[derive(Debug)]
pub struct Page {
    /// Buddy free-list linkage (indices into the page array); only
    /// meaningful while the page heads a free block.
    next: u32,
    prev: u32,
    free: bool,
    /// Block order, for free blocks and allocated block heads alike.
    order: u8,
    tag: PageTag,
    /// Owning slab, stashed here by the object pool.
    slab: usize,
    /// Mapping references. Zero means the sole owner is whoever allocated
    /// the block (or the buddy allocator, if the page is free).
    ref_count: AtomicU32,
}

/// A handle to a page: its index in the page array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef(u32);

struct PageAllocator {
    free_lists: [u32; (PAGE_ORDER_MAX + 1) as usize],
    free_count: usize,
}

unsafe impl Send for PageAllocator {}

static ALLOCATOR: SpinLock<PageAllocator> = spin_lock(
    "pages",
    PageAllocator {
        free_lists: [NONE; (PAGE_ORDER_MAX + 1) as usize],
        free_count: 0,
    },
);

/// Base pointer and length of the page array; set once in [`init_low`].
static PAGES_BASE: AtomicUsize = AtomicUsize::new(0);
static PAGES_COUNT: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn pages() -> *mut Page {
    let base = PAGES_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "page allocator used before init");
    base as *mut Page
}

#[inline]
fn page_count() -> usize {
    PAGES_COUNT.load(Ordering::Relaxed)
}

#[inline]
fn page_at(index: u32) -> &'static mut Page {
    debug_assert!((index as usize) < page_count(), "bad page index {index}");
    unsafe { &mut *pages().add(index as usize) }
}

impl PageAllocator {
    fn push(&mut self, index: u32, order: u32) {
        let head = self.free_lists[order as usize];
        let page = page_at(index);
        page.free = true;
        page.order = order as u8;
        page.tag = PageTag::Free;
        page.prev = NONE;
        page.next = head;
        if head != NONE {
            page_at(head).prev = index;
        }
        self.free_lists[order as usize] = index;
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next, order) = {
            let page = page_at(index);
            debug_assert!(page.free);
            (page.prev, page.next, page.order)
        };
        if prev != NONE {
            page_at(prev).next = next;
        } else {
            self.free_lists[order as usize] = next;
        }
        if next != NONE {
            page_at(next).prev = prev;
        }
        let page = page_at(index);
        page.free = false;
        page.next = NONE;
        page.prev = NONE;
    }

    fn alloc(&mut self, order: u32, tag: PageTag) -> Option<u32> {
        let found = (order..=PAGE_ORDER_MAX)
            .find(|o| self.free_lists[*o as usize] != NONE)?;

        let index = self.free_lists[found as usize];
        self.unlink(index);

        // Split the block down, returning the right buddies to their lists
        for o in (order..found).rev() {
            self.push(index + (1 << o), o);
        }

        let page = page_at(index);
        page.order = order as u8;
        page.tag = tag;
        page.slab = 0;
        self.free_count -= 1 << order;
        Some(index)
    }

    fn free(&mut self, mut index: u32, order: u32) {
        {
            let page = page_at(index);
            assert!(!page.free, "double free of page {index}");
            assert!(
                page.ref_count.load(Ordering::Relaxed) == 0,
                "freeing page {index} with live references"
            );
        }
        self.free_count += 1 << order;

        // Coalesce with the buddy as long as it is free and whole
        let mut order = order;
        while order < PAGE_ORDER_MAX {
            let buddy = index ^ (1 << order);
            if (buddy as usize) >= page_count() {
                break;
            }
            {
                let b = page_at(buddy);
                if !b.free || b.order as u32 != order {
                    break;
                }
            }
            self.unlink(buddy);
            index = index.min(buddy);
            order += 1;
        }

        self.push(index, order);
    }
}

/// Allocate a block of `2^order` contiguous frames.
pub fn alloc_block(order: u32, flags: AllocFlags, tag: PageTag) -> Option<PageRef> {
    assert!(order <= PAGE_ORDER_MAX);
    let index = ALLOCATOR.lock().alloc(order, tag)?;
    let page = PageRef(index);

    if flags.contains(AllocFlags::ZERO) {
        unsafe {
            core::ptr::write_bytes(kva(page).into_ptr::<u8>(), 0, PAGE_SIZE << order);
        }
    }
    Some(page)
}

#[inline]
pub fn alloc_one(flags: AllocFlags, tag: PageTag) -> Option<PageRef> {
    alloc_block(0, flags, tag)
}

/// Return a block to the allocator. The caller must own it and `ref_count`
/// must have dropped to zero.
pub fn free_block(page: PageRef, order: u32) {
    assert!(order <= PAGE_ORDER_MAX);
    assert!(page.0 % (1 << order) == 0, "misaligned block free");
    ALLOCATOR.lock().free(page.0, order);
}

#[inline]
pub fn free_one(page: PageRef) {
    free_block(page, 0);
}

#[inline]
pub fn phys_addr(page: PageRef) -> PhysAddr {
    PhysAddr::new((page.0 as usize) << PAGE_SHIFT)
}

#[inline]
pub fn kva(page: PageRef) -> VirtAddr {
    pa_to_kva(phys_addr(page))
}

pub fn from_phys(pa: PhysAddr) -> PageRef {
    let index = pa.into_raw() >> PAGE_SHIFT;
    assert!(index < page_count(), "bad physical address {pa:?}");
    PageRef(index as u32)
}

#[inline]
pub fn from_kva(va: VirtAddr) -> PageRef {
    from_phys(kva_to_pa(va))
}

/// Bump the mapping reference count; returns the new count.
pub fn ref_inc(page: PageRef) -> u32 {
    page_at(page.0).ref_count.fetch_add(1, Ordering::AcqRel) + 1
}

/// Drop a mapping reference; returns the new count (0 = caller owns).
pub fn ref_dec(page: PageRef) -> u32 {
    let old = page_at(page.0).ref_count.fetch_sub(1, Ordering::AcqRel);
    assert!(old > 0, "ref_dec of unreferenced page");
    old - 1
}

pub fn ref_count(page: PageRef) -> u32 {
    page_at(page.0).ref_count.load(Ordering::Acquire)
}

/// Verify a page is an allocated block head with the expected layout and
/// owner.
pub fn assert_owner(page: PageRef, order: u32, tag: PageTag) {
    let p = page_at(page.0);
    assert!(
        !p.free && p.order as u32 == order && p.tag == tag,
        "page {}: expected order {order} tag {tag:?}, found free={} order={} tag={:?}",
        page.0,
        p.free,
        p.order,
        p.tag,
    );
}

/// Stash the owning slab on a page (object pool bookkeeping).
pub fn set_slab(page: PageRef, slab: usize) {
    page_at(page.0).slab = slab;
}

pub fn slab_of(page: PageRef) -> usize {
    page_at(page.0).slab
}

pub fn free_count() -> usize {
    ALLOCATOR.lock().free_count
}

pub fn total_count() -> usize {
    page_count()
}

/// Enroll `[start, end)` into the free lists, one frame at a time; eager
/// coalescing in `free` rebuilds the large blocks.
pub fn free_region(start: PhysAddr, end: PhysAddr) {
    let mut allocator = ALLOCATOR.lock();
    let mut pa = start.align_up(PAGE_SIZE);
    let end = end.align_down(PAGE_SIZE);

    while pa < end {
        allocator.free((pa.into_raw() >> PAGE_SHIFT) as u32, 0);
        pa += PAGE_SIZE;
    }
}

unsafe extern "C" {
    /// End of the kernel image (virtual), provided by the linker script.
    static __kernel_end: u8;
}

/// First init phase, run on the entry translation table: carve the page
/// array out of the memory right after the kernel image and enroll the rest
/// of the low 16 MiB.
pub fn init_low() {
    let count = PHYS_LIMIT >> PAGE_SHIFT;
    let base = align_up((&raw const __kernel_end).addr(), align_of::<Page>());
    let array_bytes = count * size_of::<Page>();

    unsafe {
        let pages = base as *mut Page;
        for i in 0..count {
            pages.add(i).write(Page {
                next: NONE,
                prev: NONE,
                free: false,
                order: 0,
                tag: PageTag::Free,
                slab: 0,
                ref_count: AtomicU32::new(0),
            });
        }
    }
    PAGES_BASE.store(base, Ordering::Relaxed);
    PAGES_COUNT.store(count, Ordering::Relaxed);

    let first_free = kva_to_pa(VirtAddr::new(base + array_bytes)).align_up(PAGE_SIZE);
    free_region(first_free, PhysAddr::new(PHYS_ENTRY_LIMIT));

    crate::info!(
        "page: low init, {}/{} frames free (array {} KiB)",
        free_count(),
        count,
        array_bytes / 1024
    );
}

/// Second init phase, once the full kernel map covers all of RAM.
pub fn init_high() {
    free_region(PhysAddr::new(PHYS_ENTRY_LIMIT), PhysAddr::new(PHYS_LIMIT));
    crate::info!("page: high init, {}/{} frames free", free_count(), total_count());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn block_alignment() {
        for order in 0..=3u32 {
            let block = alloc_block(order, AllocFlags::empty(), PageTag::Anon).unwrap();
            assert!(phys_addr(block).is_aligned(PAGE_SIZE << order));
            free_block(block, order);
        }
    }

    #[test_case]
    fn free_then_realloc_returns_same_block() {
        let block = alloc_block(2, AllocFlags::empty(), PageTag::Anon).unwrap();
        free_block(block, 2);
        let again = alloc_block(2, AllocFlags::empty(), PageTag::Anon).unwrap();
        assert_eq!(block, again);
        free_block(again, 2);
    }

    #[test_case]
    fn buddies_coalesce() {
        let parent = alloc_block(3, AllocFlags::empty(), PageTag::Anon).unwrap();
        free_block(parent, 3);

        // Split the parent into two order-2 buddies, then free both: the
        // next order-3 allocation must hand back the coalesced parent.
        let left = alloc_block(2, AllocFlags::empty(), PageTag::Anon).unwrap();
        let right = alloc_block(2, AllocFlags::empty(), PageTag::Anon).unwrap();
        free_block(left, 2);
        free_block(right, 2);

        let whole = alloc_block(3, AllocFlags::empty(), PageTag::Anon).unwrap();
        assert_eq!(whole, parent);
        free_block(whole, 3);
    }

    #[test_case]
    fn zeroed_allocation() {
        let page = alloc_one(AllocFlags::ZERO, PageTag::Anon).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(kva(page).into_ptr::<u8>(), PAGE_SIZE) };
        assert!(bytes.iter().all(|b| *b == 0));
        free_one(page);
    }

    #[test_case]
    fn tag_round_trip() {
        let page = alloc_one(AllocFlags::empty(), PageTag::Kstack).unwrap();
        assert_owner(page, 0, PageTag::Kstack);
        free_one(page);
    }
}
