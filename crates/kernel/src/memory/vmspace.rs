//! Process-level address spaces: a page table plus an ordered list of
//! mapped regions.

use alloc::boxed::Box;
use core::ptr::NonNull;

use opal_abi::errno::{EFAULT, EINVAL, ENOMEM};

use super::layout::VIRT_KERNEL_BASE;
use super::vm::{self, PageTable, VmFlags};
use super::{PAGE_SIZE, PhysAddr, VirtAddr, page_round_up};
use crate::sync::spinlock::{SpinLock, spin_lock};
use crate::utils::list::{Link, List, Node};

/// One contiguous mapped range. Regions never overlap and never cross
/// `VIRT_KERNEL_BASE`.
pub struct VmRegion {
    link: Link<VmRegion>,
    pub start: VirtAddr,
    pub length: usize,
    pub flags: VmFlags,
}

impl Node for VmRegion {
    fn link(&mut self) -> &mut Link<VmRegion> {
        &mut self.link
    }
    fn link_ref(&self) -> &Link<VmRegion> {
        &self.link
    }
}

fn new_region(start: VirtAddr, length: usize, flags: VmFlags) -> Option<NonNull<VmRegion>> {
    Some(NonNull::from(Box::leak(Box::new(VmRegion {
        link: Link::new(),
        start,
        length,
        flags,
    }))))
}

unsafe fn drop_region(region: NonNull<VmRegion>) {
    drop(unsafe { Box::from_raw(region.as_ptr()) });
}

struct VmSpaceInner {
    pgtab: PageTable,
    /// Sorted by `start`.
    regions: List<VmRegion>,
    /// Current data break for `sbrk`.
    brk: VirtAddr,
}

unsafe impl Send for VmSpaceInner {}

/// An address space. Dropping it frees every mapped page and the table.
pub struct VmSpace {
    inner: SpinLock<VmSpaceInner>,
}

impl VmSpace {
    pub fn create() -> Result<Self, i32> {
        let pgtab = PageTable::create_user().map_err(|_| -ENOMEM)?;
        Ok(Self {
            inner: spin_lock(
                "vmspace",
                VmSpaceInner {
                    pgtab,
                    regions: List::new(),
                    brk: VirtAddr::null(),
                },
            ),
        })
    }

    pub fn root_phys(&self) -> PhysAddr {
        self.inner.lock().pgtab.root_phys()
    }

    /// Map `n` bytes of zeroed memory at the first gap at or after `hint`,
    /// coalescing with equal-flag neighbors. Returns the chosen address.
    pub fn map(&self, hint: VirtAddr, n: usize, flags: VmFlags) -> Result<VirtAddr, i32> {
        let mut inner = self.inner.lock();
        map_locked(&mut inner, hint, n, flags)
    }

    /// Map at exactly `va` (used by exec to place segments and stacks).
    pub fn map_fixed(&self, va: VirtAddr, n: usize, flags: VmFlags) -> Result<(), i32> {
        let mut inner = self.inner.lock();
        let got = map_locked(&mut inner, va, n, flags)?;
        if got != va.align_down(PAGE_SIZE) {
            // something already lives there; roll the surprise mapping back
            let n = page_round_up(n);
            vm::range_free(&mut inner.pgtab, got, n);
            remove_region_span(&mut inner, got, n);
            return Err(-EINVAL);
        }
        Ok(())
    }

    /// Clone for fork: every region is mirrored; unless `share`, writable
    /// pages become copy-on-write in both spaces.
    pub fn clone_space(&self, share: bool) -> Result<VmSpace, i32> {
        let new = VmSpace::create()?;
        let mut src = self.inner.lock();
        {
            let mut dst = new.inner.lock();
            dst.brk = src.brk;

            let src_inner = &mut *src;
            let mut node = src_inner.regions.front();
            while let Some(region_ptr) = node {
                let region = unsafe { region_ptr.as_ref() };
                let copy = new_region(region.start, region.length, region.flags)
                    .ok_or(-ENOMEM)?;
                unsafe { dst.regions.push_back(copy) };

                vm::user_clone(
                    &mut src_inner.pgtab,
                    &mut dst.pgtab,
                    region.start,
                    region.length,
                    share,
                )?;

                node = unsafe { src_inner.regions.next_of(region_ptr) };
            }
        }
        Ok(new)
    }

    /// Resolve a fault at `va` (copy-on-write path).
    pub fn handle_fault(&self, va: VirtAddr) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        vm::handle_fault(&mut inner.pgtab, va)
    }

    pub fn copy_out(&self, dst: VirtAddr, src: &[u8]) -> Result<(), i32> {
        if dst.into_raw().checked_add(src.len()).is_none() {
            return Err(-EFAULT);
        }
        // Kernel-half targets are already mapped; plain move
        if dst.is_kernel() {
            unsafe {
                core::ptr::copy(src.as_ptr(), dst.into_ptr::<u8>(), src.len());
            }
            return Ok(());
        }
        let mut inner = self.inner.lock();
        vm::copy_out(&mut inner.pgtab, dst, src)
    }

    pub fn copy_in(&self, src: VirtAddr, dst: &mut [u8]) -> Result<(), i32> {
        if src.into_raw().checked_add(dst.len()).is_none() {
            return Err(-EFAULT);
        }
        if src.is_kernel() {
            unsafe {
                core::ptr::copy(src.into_ptr::<u8>(), dst.as_mut_ptr(), dst.len());
            }
            return Ok(());
        }
        let mut inner = self.inner.lock();
        vm::copy_in(&mut inner.pgtab, src, dst)
    }

    pub fn check_buf(&self, va: VirtAddr, n: usize, write: bool) -> Result<(), i32> {
        let mut inner = self.inner.lock();
        vm::user_check_buf(&mut inner.pgtab, va, n, write)
    }

    pub fn check_str(&self, va: VirtAddr, limit: usize) -> Result<usize, i32> {
        let mut inner = self.inner.lock();
        vm::user_check_str(&mut inner.pgtab, va, limit)
    }

    pub fn check_args(&self, va: VirtAddr) -> Result<usize, i32> {
        let mut inner = self.inner.lock();
        vm::user_check_args(&mut inner.pgtab, va)
    }

    /// Current data break.
    pub fn brk(&self) -> VirtAddr {
        self.inner.lock().brk
    }

    pub fn set_brk(&self, brk: VirtAddr) {
        self.inner.lock().brk = brk;
    }

    /// Grow (or shrink) the data break by `delta`; returns the old break.
    pub fn grow(&self, delta: isize) -> Result<VirtAddr, i32> {
        let old = self.brk();
        if delta == 0 {
            return Ok(old);
        }

        if delta > 0 {
            let start = VirtAddr::new(page_round_up(old.into_raw()));
            let end = page_round_up(old.into_raw() + delta as usize);
            if end > start.into_raw() {
                self.map_fixed(
                    start,
                    end - start.into_raw(),
                    VmFlags::READ | VmFlags::WRITE | VmFlags::USER,
                )?;
            }
            self.set_brk(old.add(delta as usize));
        } else {
            let shrink = (-delta) as usize;
            if shrink > old.into_raw() {
                return Err(-EINVAL);
            }
            let new_brk = old - shrink;
            let start = page_round_up(new_brk.into_raw());
            let end = page_round_up(old.into_raw());
            if end > start {
                let mut inner = self.inner.lock();
                vm::range_free(&mut inner.pgtab, VirtAddr::new(start), end - start);
                remove_region_span(&mut inner, VirtAddr::new(start), end - start);
            }
            self.set_brk(new_brk);
        }
        Ok(old)
    }

    /// Run `f` with the raw page table (exec loading, signal frames).
    pub fn with_pgtab<T>(&self, f: impl FnOnce(&mut PageTable) -> T) -> T {
        let mut inner = self.inner.lock();
        f(&mut inner.pgtab)
    }

    /// Snapshot of the region list for diagnostics.
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    pub fn first_region_covering(&self, va: VirtAddr) -> Option<(VirtAddr, usize, VmFlags)> {
        let inner = self.inner.lock();
        let mut node = inner.regions.front();
        while let Some(region_ptr) = node {
            let region = unsafe { region_ptr.as_ref() };
            if va >= region.start && va < region.start.add(region.length) {
                return Some((region.start, region.length, region.flags));
            }
            node = unsafe { inner.regions.next_of(region_ptr) };
        }
        None
    }
}

/// First-fit scan of the sorted region list, then allocate + coalesce.
fn map_locked(
    inner: &mut VmSpaceInner,
    hint: VirtAddr,
    n: usize,
    flags: VmFlags,
) -> Result<VirtAddr, i32> {
    let mut va = if hint.is_null() {
        VirtAddr::new(PAGE_SIZE)
    } else {
        hint.align_up(PAGE_SIZE)
    };
    let n = page_round_up(n);

    if n == 0
        || va.into_raw() >= VIRT_KERNEL_BASE
        || va.into_raw().checked_add(n).is_none_or(|end| end > VIRT_KERNEL_BASE)
    {
        return Err(-EINVAL);
    }

    // Find the region we would insert before, pushing the candidate
    // address past every overlap; remember the predecessor for merging.
    let mut insert_before = None;
    let mut prev = None;
    let mut node = inner.regions.front();
    while let Some(region_ptr) = node {
        let region = unsafe { region_ptr.as_ref() };
        if va.add(n) <= region.start {
            insert_before = Some(region_ptr);
            break;
        }
        if va < region.start.add(region.length) {
            va = region.start.add(region.length);
        }
        prev = Some(region_ptr);
        node = unsafe { inner.regions.next_of(region_ptr) };
    }

    if va.into_raw() + n > VIRT_KERNEL_BASE {
        return Err(-ENOMEM);
    }

    vm::range_alloc(&mut inner.pgtab, va, n, flags)?;

    let merge_prev = prev.filter(|p| {
        let p = unsafe { p.as_ref() };
        p.start.add(p.length) == va && p.flags == flags
    });
    let merge_next = insert_before.filter(|x| {
        let x = unsafe { x.as_ref() };
        x.start == va.add(n) && x.flags == flags
    });

    match (merge_prev, merge_next) {
        (Some(p), Some(x)) => unsafe {
            let extra = x.as_ref().length;
            (*p.as_ptr()).length += n + extra;
            inner.regions.remove(x);
            drop_region(x);
        },
        (Some(p), None) => unsafe {
            (*p.as_ptr()).length += n;
        },
        (None, Some(x)) => unsafe {
            (*x.as_ptr()).start = va;
            (*x.as_ptr()).length += n;
        },
        (None, None) => {
            let Some(region) = new_region(va, n, flags) else {
                vm::range_free(&mut inner.pgtab, va, n);
                return Err(-ENOMEM);
            };
            unsafe {
                match insert_before {
                    Some(next) => inner.regions.insert_before(next, region),
                    None => inner.regions.push_back(region),
                }
            }
        }
    }

    Ok(va)
}

/// Drop or trim region records covering `[start, start+n)`. Only exact or
/// suffix spans occur in practice (sbrk shrink, map_fixed rollback).
fn remove_region_span(inner: &mut VmSpaceInner, start: VirtAddr, n: usize) {
    let end = start.add(n);
    let mut node = inner.regions.front();
    while let Some(region_ptr) = node {
        node = unsafe { inner.regions.next_of(region_ptr) };
        let region = unsafe { &mut *region_ptr.as_ptr() };
        let r_end = region.start.add(region.length);

        if region.start >= start && r_end <= end {
            unsafe {
                inner.regions.remove(region_ptr);
                drop_region(region_ptr);
            }
        } else if region.start < start && r_end > start && r_end <= end {
            region.length = start - region.start;
        }
    }
}

impl Drop for VmSpace {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        while let Some(region_ptr) = inner.regions.pop_front() {
            let region = unsafe { region_ptr.as_ref() };
            vm::range_free(&mut inner.pgtab, region.start, region.length);
            unsafe { drop_region(region_ptr) };
        }
        // the page table itself is reclaimed by its own Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW_USER: VmFlags = VmFlags::READ.union(VmFlags::WRITE).union(VmFlags::USER);

    #[test_case]
    fn map_coalesces_equal_flags() {
        let space = VmSpace::create().unwrap();

        let first = space.map(VirtAddr::new(0x10_0000), PAGE_SIZE, RW_USER).unwrap();
        let second = space
            .map(first.add(PAGE_SIZE), PAGE_SIZE, RW_USER)
            .unwrap();
        assert_eq!(second, first.add(PAGE_SIZE));
        assert_eq!(space.region_count(), 1, "adjacent equal-flag maps merge");

        // Different flags keep their own region
        let third = space
            .map(second.add(PAGE_SIZE), PAGE_SIZE, VmFlags::READ | VmFlags::USER)
            .unwrap();
        assert_eq!(third, second.add(PAGE_SIZE));
        assert_eq!(space.region_count(), 2);
    }

    #[test_case]
    fn map_skips_over_occupied_ranges() {
        let space = VmSpace::create().unwrap();

        let at = space.map(VirtAddr::new(0x20_0000), PAGE_SIZE, RW_USER).unwrap();
        // Hinting into the middle of the mapped range lands past it
        let next = space.map(at, PAGE_SIZE, RW_USER).unwrap();
        assert_eq!(next, at.add(PAGE_SIZE));
    }

    #[test_case]
    fn grow_moves_the_break() {
        let space = VmSpace::create().unwrap();
        space.set_brk(VirtAddr::new(0x30_0000));

        let old = space.grow(100).unwrap();
        assert_eq!(old, VirtAddr::new(0x30_0000));
        assert_eq!(space.brk(), VirtAddr::new(0x30_0000 + 100));

        // The grown range is usable
        space.copy_out(VirtAddr::new(0x30_0000), b"brk").unwrap();

        let old = space.grow(-100).unwrap();
        assert_eq!(old, VirtAddr::new(0x30_0000 + 100));
        assert_eq!(space.brk(), VirtAddr::new(0x30_0000));
    }

    #[test_case]
    fn kernel_half_copies_bypass_the_table() {
        let space = VmSpace::create().unwrap();
        let mut target = [0u8; 4];
        let va = VirtAddr::from_ptr(target.as_ptr());
        space.copy_out(va, b"ker\0").unwrap();
        assert_eq!(&target, b"ker\0");
    }
}
