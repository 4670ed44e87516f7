//! The virtual-memory engine: managed page mappings, copy-on-write faults,
//! bounded user copying and user-pointer validation.
//!
//! Mappings carrying [`VmFlags::PAGE`] are "managed": they hold a reference
//! on their [`page`] frame, and removing them drops it. Device windows and
//! other fixed mappings never set `PAGE` and are invisible to this module.

use bitflags::bitflags;

use opal_abi::ARG_MAX;
use opal_abi::errno::{E2BIG, EFAULT, EINVAL, ENAMETOOLONG, ENOMEM};

use super::layout::VIRT_KERNEL_BASE;
use super::page::{self, AllocFlags, PageRef, PageTag};
use super::{PAGE_SIZE, VirtAddr, page_round_down, page_round_up};

pub use crate::arch::paging::PageTable;

bitflags! {
    /// Portable mapping flags; the architecture encodes what it can in the
    /// hardware descriptor and keeps the rest in the sidecar word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const NOCACHE = 1 << 4;
        /// Copy-on-write: shared read-only until the first write fault.
        const COW = 1 << 5;
        /// Managed mapping participating in frame refcounting.
        const PAGE = 1 << 6;
    }
}

/// Mappings for user addresses only ever live in user tables and vice
/// versa; crossing over is a kernel bug, not an error.
fn vm_assert(pgtab: &PageTable, va: VirtAddr) {
    if pgtab.is_user() {
        assert!(
            va.into_raw() < VIRT_KERNEL_BASE,
            "kernel va {va:?} in a user table"
        );
    } else {
        assert!(va.is_kernel(), "user va {va:?} in the kernel table");
    }
}

/// The managed frame mapped at `va`, with its flags.
pub fn page_lookup(pgtab: &mut PageTable, va: VirtAddr) -> Option<(PageRef, VmFlags)> {
    vm_assert(pgtab, va);

    let pte = pgtab.lookup(va, false)?;
    if !pte.valid() {
        return None;
    }
    let flags = pte.flags();
    if !flags.contains(VmFlags::PAGE) {
        return None;
    }
    Some((page::from_phys(pte.phys_addr()), flags))
}

/// Map `page` at `va`, replacing any existing mapping there.
pub fn page_insert(
    pgtab: &mut PageTable,
    page: PageRef,
    va: VirtAddr,
    flags: VmFlags,
) -> Result<(), i32> {
    vm_assert(pgtab, va);

    // Take the reference before removing: re-inserting the same page at
    // the same address with different flags must not free it in between.
    page::ref_inc(page);
    page_remove(pgtab, va);

    let Some(mut pte) = pgtab.lookup(va, true) else {
        page::ref_dec(page);
        return Err(-ENOMEM);
    };
    pte.set(page::phys_addr(page), flags | VmFlags::PAGE);
    Ok(())
}

/// Unmap the managed page at `va`, freeing the frame on its last
/// reference. Unmapped addresses are ignored.
pub fn page_remove(pgtab: &mut PageTable, va: VirtAddr) {
    vm_assert(pgtab, va);

    let Some(mut pte) = pgtab.lookup(va, false) else {
        return;
    };
    if !pte.valid() || !pte.flags().contains(VmFlags::PAGE) {
        return;
    }

    let page = page::from_phys(pte.phys_addr());
    if page::ref_dec(page) == 0 {
        page::free_one(page);
    }

    pte.clear();
    crate::arch::paging::invalidate_page(va);
}

/// Back `[va, va+n)` with zeroed pages mapped with `flags`; on failure the
/// partial range is rolled back.
pub fn range_alloc(pgtab: &mut PageTable, va: VirtAddr, n: usize, flags: VmFlags) -> Result<(), i32> {
    let start = VirtAddr::new(page_round_down(va.into_raw()));
    let end = VirtAddr::new(page_round_up(va.into_raw() + n));

    if start > end || (pgtab.is_user() && end.into_raw() > VIRT_KERNEL_BASE) {
        return Err(-EINVAL);
    }

    let mut a = start;
    while a < end {
        let Some(page) = page::alloc_one(AllocFlags::ZERO, PageTag::Anon) else {
            range_free(pgtab, start, a - start);
            return Err(-ENOMEM);
        };
        if let Err(e) = page_insert(pgtab, page, a, flags) {
            page::free_one(page);
            range_free(pgtab, start, a - start);
            return Err(e);
        }
        a += PAGE_SIZE;
    }
    Ok(())
}

/// Remove every managed mapping in `[va, va+n)`.
pub fn range_free(pgtab: &mut PageTable, va: VirtAddr, n: usize) {
    let mut a = VirtAddr::new(page_round_down(va.into_raw()));
    let end = VirtAddr::new(page_round_up(va.into_raw() + n));
    assert!(a <= end, "invalid range [{a:?}, {end:?})");

    while a < end {
        page_remove(pgtab, a);
        a += PAGE_SIZE;
    }
}

/// Copy `src` into `pgtab`'s address space at `dst`, page by page.
pub fn copy_out(pgtab: &mut PageTable, mut dst: VirtAddr, mut src: &[u8]) -> Result<(), i32> {
    while !src.is_empty() {
        let (page, _) = page_lookup(pgtab, dst).ok_or(-EFAULT)?;
        let offset = dst.page_offset();
        let ncopy = (PAGE_SIZE - offset).min(src.len());

        unsafe {
            core::ptr::copy(
                src.as_ptr(),
                page::kva(page).add(offset).into_ptr::<u8>(),
                ncopy,
            );
        }

        src = &src[ncopy..];
        dst += ncopy;
    }
    Ok(())
}

/// Copy from `pgtab`'s address space at `src` into `dst`.
pub fn copy_in(pgtab: &mut PageTable, mut src: VirtAddr, mut dst: &mut [u8]) -> Result<(), i32> {
    while !dst.is_empty() {
        let (page, _) = page_lookup(pgtab, src).ok_or(-EFAULT)?;
        let offset = src.page_offset();
        let ncopy = (PAGE_SIZE - offset).min(dst.len());

        unsafe {
            core::ptr::copy(
                page::kva(page).add(offset).into_ptr::<u8>(),
                dst.as_mut_ptr(),
                ncopy,
            );
        }

        dst = &mut dst[ncopy..];
        src += ncopy;
    }
    Ok(())
}

/// Resolve a user page fault at `va`. Only copy-on-write faults are
/// resolvable; everything else is the caller's signal to raise.
pub fn handle_fault(pgtab: &mut PageTable, va: VirtAddr) -> Result<(), ()> {
    if va.is_kernel() {
        return Err(());
    }

    let (old, flags) = page_lookup(pgtab, va).ok_or(())?;
    if !flags.contains(VmFlags::COW) {
        return Err(());
    }

    let new = page::alloc_one(AllocFlags::empty(), PageTag::Anon).ok_or(())?;
    unsafe {
        core::ptr::copy_nonoverlapping(
            page::kva(old).into_ptr::<u8>(),
            page::kva(new).into_ptr::<u8>(),
            PAGE_SIZE,
        );
    }

    let new_flags = (flags - VmFlags::COW) | VmFlags::WRITE;
    // Inserting drops the old mapping's reference; the last sharer gets
    // its private copy for free when the count reaches one again.
    if page_insert(pgtab, new, va.align_down(PAGE_SIZE), new_flags).is_err() {
        page::free_one(new);
        return Err(());
    }
    crate::arch::paging::invalidate_page(va);
    Ok(())
}

/// Mirror `[va, va+n)` from `src` into `dst` for fork. With `share` the
/// frames are mapped with identical permissions; otherwise writable pages
/// are demoted to read-only copy-on-write in *both* tables.
pub fn user_clone(
    src: &mut PageTable,
    dst: &mut PageTable,
    va: VirtAddr,
    n: usize,
    share: bool,
) -> Result<(), i32> {
    let mut a = VirtAddr::new(page_round_down(va.into_raw()));
    let end = VirtAddr::new(page_round_up(va.into_raw() + n));

    while a < end {
        if let Some((page, flags)) = page_lookup(src, a) {
            if share || !flags.contains(VmFlags::WRITE) {
                page_insert(dst, page, a, flags)?;
            } else {
                let demoted = (flags - VmFlags::WRITE) | VmFlags::COW;
                page_insert(dst, page, a, demoted)?;
                page_insert(src, page, a, demoted)?;
                crate::arch::paging::invalidate_page(a);
            }
        }
        a += PAGE_SIZE;
    }
    Ok(())
}

fn check_page(pgtab: &mut PageTable, va: VirtAddr, write: bool) -> Result<(), i32> {
    let (_, flags) = page_lookup(pgtab, va).ok_or(-EFAULT)?;
    let mut need = VmFlags::USER;
    need |= if write { VmFlags::WRITE } else { VmFlags::READ };
    // A COW page is writable in spirit; the fault handler finishes the job
    if write && flags.contains(VmFlags::COW | VmFlags::USER) {
        return Ok(());
    }
    if flags.contains(need) {
        Ok(())
    } else {
        Err(-EFAULT)
    }
}

/// Verify that `[va, va+n)` is user-accessible with the requested access.
pub fn user_check_buf(pgtab: &mut PageTable, va: VirtAddr, n: usize, write: bool) -> Result<(), i32> {
    if n == 0 {
        return Ok(());
    }
    if va.into_raw().checked_add(n).is_none_or(|end| end > VIRT_KERNEL_BASE) {
        return Err(-EFAULT);
    }

    let mut a = VirtAddr::new(page_round_down(va.into_raw()));
    let end = VirtAddr::new(page_round_up(va.into_raw() + n));
    while a < end {
        check_page(pgtab, a, write)?;
        a += PAGE_SIZE;
    }
    Ok(())
}

/// Verify a user object of `size` bytes at `va`.
pub fn user_check_ptr(pgtab: &mut PageTable, va: VirtAddr, size: usize, write: bool) -> Result<(), i32> {
    user_check_buf(pgtab, va, size, write)
}

/// Verify a NUL-terminated user string; returns its length (excluding the
/// NUL). Fails with `-ENAMETOOLONG` past `limit` bytes.
pub fn user_check_str(pgtab: &mut PageTable, va: VirtAddr, limit: usize) -> Result<usize, i32> {
    let mut len = 0usize;
    let mut a = va;

    loop {
        check_page(pgtab, a, false)?;
        let (page, _) = page_lookup(pgtab, a).ok_or(-EFAULT)?;

        let offset = a.page_offset();
        let span = PAGE_SIZE - offset;
        let bytes = unsafe {
            core::slice::from_raw_parts(page::kva(page).add(offset).into_ptr::<u8>(), span)
        };

        match bytes.iter().position(|b| *b == 0) {
            Some(at) => {
                len += at;
                return if len <= limit { Ok(len) } else { Err(-ENAMETOOLONG) };
            }
            None => {
                len += span;
                if len > limit {
                    return Err(-ENAMETOOLONG);
                }
                a += span;
                if a.into_raw() >= VIRT_KERNEL_BASE {
                    return Err(-EFAULT);
                }
            }
        }
    }
}

/// Verify a NULL-terminated user pointer vector (argv/envp style): every
/// entry must be a valid string, cumulatively bounded by `ARG_MAX`.
/// Returns the number of entries.
pub fn user_check_args(pgtab: &mut PageTable, va: VirtAddr) -> Result<usize, i32> {
    let mut count = 0usize;
    let mut total = 0usize;

    loop {
        let slot = va.add(count * size_of::<usize>());
        user_check_buf(pgtab, slot, size_of::<usize>(), false)?;

        let mut raw = [0u8; size_of::<usize>()];
        copy_in(pgtab, slot, &mut raw)?;
        let ptr = usize::from_ne_bytes(raw);
        if ptr == 0 {
            return Ok(count);
        }

        let len = user_check_str(pgtab, VirtAddr::new(ptr), ARG_MAX)?;
        total += len + 1;
        if total > ARG_MAX {
            return Err(-E2BIG);
        }
        count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vmspace::VmSpace;

    const TEST_VA: VirtAddr = VirtAddr::new(0x40_0000);

    #[test_case]
    fn insert_copy_roundtrip_then_fault() {
        let mut pgtab = PageTable::create_user().unwrap();
        let page = page::alloc_one(AllocFlags::ZERO, PageTag::Anon).unwrap();

        page_insert(
            &mut pgtab,
            page,
            TEST_VA,
            VmFlags::READ | VmFlags::WRITE | VmFlags::USER,
        )
        .unwrap();

        let message = *b"paging works";
        copy_out(&mut pgtab, TEST_VA.add(100), &message).unwrap();

        let mut readback = [0u8; 12];
        copy_in(&mut pgtab, TEST_VA.add(100), &mut readback).unwrap();
        assert_eq!(readback, message);

        page_remove(&mut pgtab, TEST_VA);
        assert_eq!(copy_in(&mut pgtab, TEST_VA, &mut readback), Err(-EFAULT));
        assert_eq!(copy_out(&mut pgtab, TEST_VA, &message), Err(-EFAULT));
    }

    #[test_case]
    fn reinsert_same_page_different_flags() {
        let mut pgtab = PageTable::create_user().unwrap();
        let page = page::alloc_one(AllocFlags::ZERO, PageTag::Anon).unwrap();

        let rw = VmFlags::READ | VmFlags::WRITE | VmFlags::USER;
        page_insert(&mut pgtab, page, TEST_VA, rw).unwrap();
        assert_eq!(page::ref_count(page), 1);

        // The refcount-before-remove dance keeps the page alive here
        let ro = VmFlags::READ | VmFlags::USER;
        page_insert(&mut pgtab, page, TEST_VA, ro).unwrap();
        assert_eq!(page::ref_count(page), 1);

        let (found, flags) = page_lookup(&mut pgtab, TEST_VA).unwrap();
        assert_eq!(found, page);
        assert!(!flags.contains(VmFlags::WRITE));

        page_remove(&mut pgtab, TEST_VA);
    }

    #[test_case]
    fn user_checks_enforce_permissions() {
        let mut pgtab = PageTable::create_user().unwrap();
        let page = page::alloc_one(AllocFlags::ZERO, PageTag::Anon).unwrap();
        page_insert(&mut pgtab, page, TEST_VA, VmFlags::READ | VmFlags::USER).unwrap();

        assert!(user_check_buf(&mut pgtab, TEST_VA, 64, false).is_ok());
        assert_eq!(user_check_buf(&mut pgtab, TEST_VA, 64, true), Err(-EFAULT));
        // Unmapped neighbors fail
        assert_eq!(
            user_check_buf(&mut pgtab, TEST_VA.add(PAGE_SIZE), 1, false),
            Err(-EFAULT)
        );

        page_remove(&mut pgtab, TEST_VA);
    }

    #[test_case]
    fn user_string_check_finds_nul() {
        let mut pgtab = PageTable::create_user().unwrap();
        let page = page::alloc_one(AllocFlags::ZERO, PageTag::Anon).unwrap();
        page_insert(
            &mut pgtab,
            page,
            TEST_VA,
            VmFlags::READ | VmFlags::WRITE | VmFlags::USER,
        )
        .unwrap();

        copy_out(&mut pgtab, TEST_VA, b"/bin/init\0").unwrap();
        assert_eq!(user_check_str(&mut pgtab, TEST_VA, 64), Ok(9));
        assert_eq!(
            user_check_str(&mut pgtab, TEST_VA, 4),
            Err(-ENAMETOOLONG)
        );

        page_remove(&mut pgtab, TEST_VA);
    }

    #[test_case]
    fn cow_clone_diverges() {
        let space_a = VmSpace::create().unwrap();
        let va = space_a
            .map(
                VirtAddr::new(0x1_0000),
                PAGE_SIZE,
                VmFlags::READ | VmFlags::WRITE | VmFlags::USER,
            )
            .unwrap();
        space_a.copy_out(va, b"a").unwrap();

        let frame = space_a
            .with_pgtab(|pt| page_lookup(pt, va).map(|(p, _)| p))
            .unwrap();
        assert_eq!(page::ref_count(frame), 1);

        let space_b = space_a.clone_space(false).unwrap();
        // Both spaces share the frame read-only now
        assert_eq!(page::ref_count(frame), 2);

        // The write fault gives B a private copy and drops one reference
        space_b.handle_fault(va).unwrap();
        space_b.copy_out(va, b"b").unwrap();
        assert_eq!(page::ref_count(frame), 1);

        let mut seen_a = [0u8; 1];
        let mut seen_b = [0u8; 1];
        space_a.copy_in(va, &mut seen_a).unwrap();
        space_b.copy_in(va, &mut seen_b).unwrap();
        assert_eq!(&seen_a, b"a");
        assert_eq!(&seen_b, b"b");
    }

    #[test_case]
    fn non_cow_fault_is_unresolvable() {
        let space = VmSpace::create().unwrap();
        assert!(space.handle_fault(VirtAddr::new(0x2000)).is_err());
    }
}
