//! The kernel heap: a ladder of power-of-two object pools behind the global
//! allocator, with page blocks backing anything larger.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use super::object_pool::ObjectPool;
use super::page::{self, AllocFlags, PageTag};
use super::{PAGE_SIZE, VirtAddr};
use crate::sync::spinlock::{SpinLock, spin_lock};

const SIZES: [usize; 9] = [32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

static MALLOC_POOLS: SpinLock<[Option<&'static ObjectPool>; SIZES.len()]> =
    spin_lock("kmalloc", [None; SIZES.len()]);

/// Create the size-class pools. Must run after the page allocator's low
/// init and before the first heap allocation.
pub fn init() {
    static NAMES: [&str; SIZES.len()] = [
        "kmalloc-32",
        "kmalloc-64",
        "kmalloc-128",
        "kmalloc-256",
        "kmalloc-512",
        "kmalloc-1024",
        "kmalloc-2048",
        "kmalloc-4096",
        "kmalloc-8192",
    ];

    let mut pools = MALLOC_POOLS.lock();
    for (i, size) in SIZES.iter().enumerate() {
        pools[i] =
            Some(ObjectPool::create(NAMES[i], *size, *size, None, None).expect("out of memory"));
    }
    crate::info!("kalloc: {} size classes up to {} bytes", SIZES.len(), SIZES[SIZES.len() - 1]);
}

#[inline]
fn class_of(layout: Layout) -> Option<usize> {
    let need = layout.size().max(layout.align());
    SIZES.iter().position(|s| *s >= need)
}

/// Page order covering `layout` for beyond-ladder allocations.
fn order_of(layout: Layout) -> u32 {
    let pages = layout.size().max(layout.align()).div_ceil(PAGE_SIZE);
    pages.next_power_of_two().trailing_zeros()
}

pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match class_of(layout) {
            Some(class) => {
                let pool = MALLOC_POOLS.lock()[class];
                match pool.and_then(|p| p.get()) {
                    Some(obj) => obj.as_ptr(),
                    None => core::ptr::null_mut(),
                }
            }
            None => match page::alloc_block(order_of(layout), AllocFlags::empty(), PageTag::Anon)
            {
                Some(block) => page::kva(block).into_ptr(),
                None => core::ptr::null_mut(),
            },
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(obj) = NonNull::new(ptr) else {
            return;
        };
        match class_of(layout) {
            Some(class) => {
                let pool = MALLOC_POOLS.lock()[class].expect("kalloc pool missing");
                pool.put(obj);
            }
            None => {
                let block = page::from_kva(VirtAddr::from_ptr(ptr));
                page::free_block(block, order_of(layout));
            }
        }
    }
}

#[global_allocator]
static GLOBAL_ALLOCATOR: KernelHeap = KernelHeap;

#[cfg(test)]
mod tests {
    #[test_case]
    fn heap_round_trip() {
        use alloc::vec::Vec;

        let mut v = Vec::new();
        for i in 0..1000usize {
            v.push(i);
        }
        assert_eq!(v.iter().sum::<usize>(), 999 * 1000 / 2);
    }

    #[test_case]
    fn large_allocation_uses_page_blocks() {
        use alloc::boxed::Box;

        let boxed = Box::new([0u8; 3 * super::PAGE_SIZE]);
        assert!(boxed.iter().all(|b| *b == 0));
    }
}
