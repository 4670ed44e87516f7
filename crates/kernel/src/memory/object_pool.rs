//! Slab object pools over the page allocator.
//!
//! A pool hands out fixed-size constructed objects from page-block slabs.
//! The constructor runs once per slot when a slab is created and the
//! destructor once when it is torn down; `get`/`put` never re-run them, so
//! object contents survive a round trip through the free list.
//!
//! Free slots are threaded through a per-slab tag array (not through the
//! object memory, which would clobber constructed state). Small objects
//! keep their slab descriptor at the head of the block; objects of a
//! half-KiB or more move it off-slab into [`SLAB_POOL`] and find it again
//! through the owning-slab word in the page metadata.

use core::ptr::NonNull;

use super::page::{self, AllocFlags, PageRef, PageTag};
use super::{PAGE_SIZE, VirtAddr, align_up};
use crate::sync::spinlock::{SpinLock, spin_lock};
use crate::utils::list::{Link, List, Node};

/// Objects at or above this size keep their descriptors off-slab.
const OFF_SLAB_MIN: usize = PAGE_SIZE / 8;
/// Largest slab block the order search will use.
const SLAB_ORDER_MAX: u32 = 3;
/// Upper bound on objects per slab for off-slab descriptors.
const OFF_SLAB_CAPACITY_MAX: usize = 64;

const TAG_NONE: u16 = u16::MAX;

pub type ObjectCtor = fn(*mut u8, usize);
pub type ObjectDtor = fn(*mut u8, usize);

/// Slab descriptor: either at the head of its own block or allocated from
/// [`SLAB_POOL`]. The free-tag array follows it immediately.
struct Slab {
    link: Link<Slab>,
    pool: *const ObjectPool,
    /// First object (block start + header + color offset).
    data: VirtAddr,
    /// Head page of the backing block.
    block: PageRef,
    free_head: u16,
    used_count: u16,
}

impl Node for Slab {
    fn link(&mut self) -> &mut Link<Slab> {
        &mut self.link
    }
    fn link_ref(&self) -> &Link<Slab> {
        &self.link
    }
}

impl Slab {
    #[inline]
    fn tags(&mut self, capacity: usize) -> &mut [u16] {
        unsafe {
            core::slice::from_raw_parts_mut((self as *mut Slab).add(1).cast::<u16>(), capacity)
        }
    }
}

struct PoolInner {
    /// Slabs with no free objects.
    slabs_empty: List<Slab>,
    /// Slabs with both used and free objects.
    slabs_partial: List<Slab>,
    /// Slabs with every object free.
    slabs_full: List<Slab>,
    /// Color offset (in alignment units) for the next slab.
    color_next: usize,
    slab_count: usize,
}

unsafe impl Send for PoolInner {}

/// A named cache of fixed-size objects.
pub struct ObjectPool {
    name: &'static str,
    /// Size the caller asked for.
    obj_size: usize,
    /// Slot stride: `obj_size` rounded up to the alignment.
    block_size: usize,
    align: usize,
    /// Objects per slab.
    capacity: usize,
    /// Page order of each slab block.
    page_order: u32,
    off_slab: bool,
    /// Maximum color offset, in alignment units.
    color_max: usize,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    inner: SpinLock<PoolInner>,
}

/// Slab geometry solved at pool-creation time.
const fn solve_geometry(block_size: usize, align: usize) -> (u32, usize, bool, usize) {
    let off_slab = block_size >= OFF_SLAB_MIN;

    let mut order = 0;
    while order < SLAB_ORDER_MAX {
        let bytes = PAGE_SIZE << order;
        if block_size <= bytes && bytes % block_size <= bytes / 8 {
            break;
        }
        order += 1;
    }

    let bytes = PAGE_SIZE << order;
    let (capacity, header) = if off_slab {
        let mut cap = bytes / block_size;
        if cap > OFF_SLAB_CAPACITY_MAX {
            cap = OFF_SLAB_CAPACITY_MAX;
        }
        (cap, 0)
    } else {
        // Header (descriptor + one tag per object) shares the block
        let mut cap = (bytes - size_of::<Slab>()) / (block_size + size_of::<u16>());
        loop {
            let header = size_of::<Slab>() + cap * size_of::<u16>();
            if align_up(header, align) + cap * block_size <= bytes {
                break;
            }
            cap -= 1;
        }
        (cap, align_up(size_of::<Slab>() + cap * size_of::<u16>(), align))
    };

    let slack = bytes - header - capacity * block_size;
    (order, capacity, off_slab, slack / align)
}

impl ObjectPool {
    /// Const constructor for the bootstrap pools.
    const fn new_static(name: &'static str, obj_size: usize, align: usize) -> Self {
        let block_size = align_up(obj_size, align);
        let (page_order, capacity, off_slab, color_max) = solve_geometry(block_size, align);
        // the bootstrap pools must be self-hosting
        assert!(!off_slab);
        Self {
            name,
            obj_size,
            block_size,
            align,
            capacity,
            page_order,
            off_slab,
            color_max,
            ctor: None,
            dtor: None,
            inner: spin_lock(
                name,
                PoolInner {
                    slabs_empty: List::new(),
                    slabs_partial: List::new(),
                    slabs_full: List::new(),
                    color_next: 0,
                    slab_count: 0,
                },
            ),
        }
    }

    /// Create a pool. The constructor (if any) runs once per slot at slab
    /// creation, the destructor once at slab destruction.
    pub fn create(
        name: &'static str,
        obj_size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Option<&'static ObjectPool> {
        let align = if align == 0 { align_of::<usize>() } else { align };
        assert!(align.is_power_of_two());
        assert!(obj_size > 0 && obj_size <= PAGE_SIZE << SLAB_ORDER_MAX);

        let block_size = align_up(obj_size, align);
        let (page_order, capacity, off_slab, color_max) = solve_geometry(block_size, align);
        if off_slab {
            assert!(
                size_of::<Slab>() + capacity * size_of::<u16>() <= SLAB_DESC_BYTES,
                "off-slab descriptor too large for '{name}'"
            );
        }

        let slot = POOL_POOL.get()?.cast::<ObjectPool>();
        unsafe {
            slot.write(ObjectPool {
                name,
                obj_size,
                block_size,
                align,
                capacity,
                page_order,
                off_slab,
                color_max,
                ctor,
                dtor,
                inner: spin_lock(
                    name,
                    PoolInner {
                        slabs_empty: List::new(),
                        slabs_partial: List::new(),
                        slabs_full: List::new(),
                        color_next: 0,
                        slab_count: 0,
                    },
                ),
            });
            Some(slot.as_ref())
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    fn grow(&self, inner: &mut PoolInner) -> Option<NonNull<Slab>> {
        let block = page::alloc_block(self.page_order, AllocFlags::empty(), PageTag::Slab)?;
        let block_va = page::kva(block);

        let color = inner.color_next;
        inner.color_next = if inner.color_next >= self.color_max {
            0
        } else {
            inner.color_next + 1
        };

        let (slab_ptr, data) = if self.off_slab {
            let desc = match SLAB_POOL.get() {
                Some(d) => d.cast::<Slab>(),
                None => {
                    page::free_block(block, self.page_order);
                    return None;
                }
            };
            (desc, block_va.add(color * self.align))
        } else {
            let header = align_up(
                size_of::<Slab>() + self.capacity * size_of::<u16>(),
                self.align,
            );
            (
                NonNull::new(block_va.into_ptr::<Slab>()).unwrap(),
                block_va.add(header + color * self.align),
            )
        };

        unsafe {
            slab_ptr.write(Slab {
                link: Link::new(),
                pool: self,
                data,
                block,
                free_head: 0,
                used_count: 0,
            });

            let slab = &mut *slab_ptr.as_ptr();
            let tags = slab.tags(self.capacity);
            for i in 0..self.capacity {
                tags[i] = if i + 1 == self.capacity {
                    TAG_NONE
                } else {
                    (i + 1) as u16
                };
            }

            // Every page of the block points back at the slab so `put` can
            // find it from a bare object pointer
            for i in 0..(1usize << self.page_order) {
                let p = page::from_kva(block_va.add(i * PAGE_SIZE));
                page::set_slab(p, slab_ptr.as_ptr() as usize);
            }

            if let Some(ctor) = self.ctor {
                for i in 0..self.capacity {
                    ctor(data.add(i * self.block_size).into_ptr(), self.obj_size);
                }
            }

            inner.slabs_full.push_back(slab_ptr);
        }
        inner.slab_count += 1;
        Some(slab_ptr)
    }

    fn destroy_slab(&self, inner: &mut PoolInner, slab_ptr: NonNull<Slab>) {
        let slab = unsafe { slab_ptr.as_ref() };
        assert!(slab.used_count == 0, "destroying a live slab of '{}'", self.name);

        if let Some(dtor) = self.dtor {
            for i in 0..self.capacity {
                dtor(slab.data.add(i * self.block_size).into_ptr(), self.obj_size);
            }
        }

        let block = slab.block;
        page::free_block(block, self.page_order);
        if self.off_slab {
            SLAB_POOL.put(slab_ptr.cast());
        }
        inner.slab_count -= 1;
    }

    /// Take a constructed object out of the pool.
    pub fn get(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();

        let slab_ptr = inner
            .slabs_partial
            .front()
            .or_else(|| inner.slabs_full.front())
            .or_else(|| self.grow(&mut inner))?;

        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        let was_full = slab.used_count == 0;

        let idx = slab.free_head;
        debug_assert!(idx != TAG_NONE);
        slab.free_head = slab.tags(self.capacity)[idx as usize];
        slab.used_count += 1;

        let exhausted = slab.free_head == TAG_NONE;
        unsafe {
            if was_full {
                inner.slabs_full.remove(slab_ptr);
            } else if exhausted {
                inner.slabs_partial.remove(slab_ptr);
            }
            if exhausted {
                inner.slabs_empty.push_back(slab_ptr);
            } else if was_full {
                inner.slabs_partial.push_back(slab_ptr);
            }
        }

        NonNull::new(slab.data.add(idx as usize * self.block_size).into_ptr())
    }

    /// Return an object. Contents are preserved; the constructor does not
    /// run again on the next `get`.
    pub fn put(&self, obj: NonNull<u8>) {
        let va = VirtAddr::from_ptr(obj.as_ptr());
        let slab_ptr = NonNull::new(page::slab_of(page::from_kva(va)) as *mut Slab)
            .expect("put of a pointer that no slab owns");

        let mut inner = self.inner.lock();
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        assert!(
            core::ptr::eq(slab.pool, self),
            "object returned to the wrong pool"
        );

        let offset = va - slab.data;
        debug_assert!(offset % self.block_size == 0);
        let idx = (offset / self.block_size) as u16;

        let was_empty = slab.free_head == TAG_NONE;
        slab.tags(self.capacity)[idx as usize] = slab.free_head;
        slab.free_head = idx;
        slab.used_count -= 1;

        let now_full = slab.used_count == 0;
        unsafe {
            if was_empty {
                inner.slabs_empty.remove(slab_ptr);
            } else if now_full {
                inner.slabs_partial.remove(slab_ptr);
            }

            if now_full {
                // Reclaim all-free slabs, but only while the pool keeps
                // other live slabs around
                if !inner.slabs_partial.is_empty() && inner.slab_count > 1 {
                    self.destroy_slab(&mut inner, slab_ptr);
                } else {
                    inner.slabs_full.push_back(slab_ptr);
                }
            } else if was_empty {
                inner.slabs_partial.push_back(slab_ptr);
            }
        }
    }

    /// Tear the pool down. Every object must have been returned.
    pub fn destroy(pool: &'static ObjectPool) {
        {
            let mut inner = pool.inner.lock();
            assert!(
                inner.slabs_empty.is_empty() && inner.slabs_partial.is_empty(),
                "destroying pool '{}' with live objects",
                pool.name
            );
            while let Some(slab) = inner.slabs_full.front() {
                unsafe { inner.slabs_full.remove(slab) };
                pool.destroy_slab(&mut inner, slab);
            }
        }
        POOL_POOL.put(NonNull::from(pool).cast());
    }
}

/// Bytes reserved per off-slab descriptor (header + maximum tag array).
const SLAB_DESC_BYTES: usize = size_of::<Slab>() + OFF_SLAB_CAPACITY_MAX * size_of::<u16>();

/// Descriptor pool for off-slab slabs; its own descriptors are on-slab.
static SLAB_POOL: ObjectPool =
    ObjectPool::new_static("slab_pool", SLAB_DESC_BYTES, align_of::<Slab>());

/// The pool of pool descriptors.
static POOL_POOL: ObjectPool = ObjectPool::new_static(
    "pool_pool",
    size_of::<ObjectPool>(),
    align_of::<ObjectPool>(),
);

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
    static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn counting_ctor(obj: *mut u8, size: usize) {
        CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
        unsafe { core::ptr::write_bytes(obj, 0xA5, size) };
    }

    fn counting_dtor(_obj: *mut u8, _size: usize) {
        DTOR_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    #[test_case]
    fn ctor_runs_once_per_slot() {
        CTOR_RUNS.store(0, Ordering::Relaxed);
        DTOR_RUNS.store(0, Ordering::Relaxed);

        let pool =
            ObjectPool::create("test_ctor", 48, 8, Some(counting_ctor), Some(counting_dtor))
                .unwrap();

        let a = pool.get().unwrap();
        let ctors_after_first = CTOR_RUNS.load(Ordering::Relaxed);
        assert!(ctors_after_first > 0);

        // A put/get round trip constructs nothing new
        pool.put(a);
        let _b = pool.get().unwrap();
        assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), ctors_after_first);

        pool.put(_b);
        ObjectPool::destroy(pool);
        assert_eq!(
            DTOR_RUNS.load(Ordering::Relaxed),
            ctors_after_first,
            "every constructed slot must be destructed"
        );
    }

    #[test_case]
    fn contents_preserved_across_put_get() {
        let pool = ObjectPool::create("test_keep", 64, 8, None, None).unwrap();

        let obj = pool.get().unwrap();
        unsafe { core::ptr::write_bytes(obj.as_ptr(), 0x5C, 64) };
        pool.put(obj);

        let again = pool.get().unwrap();
        assert_eq!(again, obj, "LIFO free list returns the same slot");
        let bytes = unsafe { core::slice::from_raw_parts(again.as_ptr(), 64) };
        assert!(bytes.iter().all(|b| *b == 0x5C));

        pool.put(again);
        ObjectPool::destroy(pool);
    }

    #[test_case]
    fn alignment_honored() {
        let pool = ObjectPool::create("test_align", 40, 64, None, None).unwrap();
        let mut held = heapless::Vec::<_, 16>::new();
        for _ in 0..held.capacity() {
            let obj = pool.get().unwrap();
            assert!(obj.as_ptr().addr() % 64 == 0);
            held.push(obj).unwrap();
        }
        for obj in held {
            pool.put(obj);
        }
        ObjectPool::destroy(pool);
    }

    #[test_case]
    fn off_slab_objects() {
        // >= PAGE_SIZE / 8 forces off-slab descriptors
        let pool = ObjectPool::create("test_off", 1024, 8, None, None).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(a != b);
        pool.put(a);
        pool.put(b);
        ObjectPool::destroy(pool);
    }
}
