//! Per-process address spaces.
//!
//! A [`MemorySpace`] owns one Sv39 page table plus the process's on-demand
//! ranges. It is the seam every user pointer crosses: syscalls validate
//! through [`MemorySpace::access_ok`] / the copy helpers before anything is
//! dereferenced, and page faults land in
//! [`MemorySpace::handle_page_fault`].

use super::page_table::{PageTable, PageTableMappingError, Permission, PteFlags};
use super::{Page, is_user_range};
use crate::KernelError;
use alloc::{string::String, vec::Vec};
use core::ops::Range;
use smode::addressing::{PAGE_SIZE, Pa, Va};

/// Upper bound for user-supplied NUL-terminated strings, in bytes.
pub const USER_STR_MAX: usize = 4096;

/// An opaque handle identifying a root page table, sufficient to install it
/// as the current address space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Mtag(usize);

impl Mtag {
    /// The raw `satp` value behind the tag.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

struct LazyRange {
    range: Range<usize>,
    perm: Permission,
}

/// A user address space: the page-table tree plus on-demand ranges.
pub struct MemorySpace {
    pt: PageTable,
    lazy: Vec<LazyRange>,
}

fn map_err(e: PageTableMappingError) -> KernelError {
    match e {
        // `NotExist` out of a mapping operation means an intermediate table
        // could not be allocated.
        PageTableMappingError::NotExist => KernelError::NoMemory,
        PageTableMappingError::Duplicated => KernelError::InvalidArgument,
        PageTableMappingError::Unaligned | PageTableMappingError::InvalidPermission => {
            KernelError::BadAddress
        }
    }
}

impl MemorySpace {
    /// Creates a fresh address space containing only the kernel window.
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self {
            pt: PageTable::new(),
            lazy: Vec::new(),
        })
    }

    /// The tag that installs this space.
    pub fn mtag(&self) -> Mtag {
        Mtag(self.pt.satp())
    }

    /// Installs this space as the active translation.
    pub fn switch_to(&self) {
        unsafe { smode::csr::write_satp(self.mtag().0) };
    }

    /// Releases the space: every user frame and table page is freed.
    pub fn reclaim(self) {
        drop(self);
    }

    /// Maps the single page `pg` at `va` with permission `perm`.
    pub fn map_page(&mut self, va: Va, pg: Page, perm: Permission) -> Result<(), KernelError> {
        self.pt.map(va, pg, perm).map_err(map_err)
    }

    /// Allocates fresh zeroed frames for every page of `[va, va + len)` and
    /// maps them with `perm`.
    pub fn alloc_and_map_range(
        &mut self,
        va: Va,
        len: usize,
        perm: Permission,
    ) -> Result<(), KernelError> {
        let lo = va.into_usize();
        let hi = lo.checked_add(len).ok_or(KernelError::BadAddress)?;
        if lo & (PAGE_SIZE - 1) != 0 || !is_user_range(lo, hi) {
            return Err(KernelError::BadAddress);
        }
        let mut at = lo;
        while at < hi {
            let page = Page::new()?;
            self.pt
                .map(Va::new(at).unwrap(), page, perm)
                .map_err(map_err)?;
            at += PAGE_SIZE;
        }
        Ok(())
    }

    /// Declares `[va, va + len)` as demand-mapped with `perm`: pages are
    /// materialized one at a time by [`handle_page_fault`].
    ///
    /// [`handle_page_fault`]: Self::handle_page_fault
    pub fn declare_lazy_range(
        &mut self,
        va: Va,
        len: usize,
        perm: Permission,
    ) -> Result<(), KernelError> {
        let lo = va.into_usize();
        let hi = lo.checked_add(len).ok_or(KernelError::BadAddress)?;
        if lo & (PAGE_SIZE - 1) != 0 || hi & (PAGE_SIZE - 1) != 0 || !is_user_range(lo, hi) {
            return Err(KernelError::BadAddress);
        }
        self.lazy.push(LazyRange {
            range: lo..hi,
            perm,
        });
        Ok(())
    }

    /// Handles a page fault at `va`.
    ///
    /// If `va` lies in a declared on-demand range, a fresh frame is mapped
    /// and the fault is resolved. Otherwise the fault is the process's
    /// problem and surfaces as [`KernelError::BadAddress`].
    pub fn handle_page_fault(&mut self, va: Va) -> Result<(), KernelError> {
        let page_va = va.page_down();
        if self.pt.walk(page_va).is_ok() {
            // Already materialized; a stale fault is benign.
            return Ok(());
        }
        let perm = self
            .lazy
            .iter()
            .find(|l| l.range.contains(&va.into_usize()))
            .map(|l| l.perm)
            .ok_or(KernelError::BadAddress)?;
        let page = Page::new()?;
        self.pt.map(page_va, page, perm).map_err(map_err)
    }

    /// Duplicates the whole user address space.
    ///
    /// Every mapped user frame is copied byte-for-byte into a fresh frame
    /// mapped at the same address with the same permissions; nothing is
    /// shared with the parent except the global kernel window. On-demand
    /// declarations are inherited.
    pub fn try_clone(&self) -> Result<Self, KernelError> {
        let mut child = MemorySpace::new()?;
        let mut failure = None;
        self.pt.for_each_user_leaf(|va, pte| {
            if failure.is_some() {
                return;
            }
            let copied = Page::new().and_then(|mut page| {
                let src = pte.pa().unwrap().into_kva().into_usize() as *const u8;
                unsafe {
                    core::ptr::copy_nonoverlapping(src, page.inner_mut().as_mut_ptr(), PAGE_SIZE);
                }
                child
                    .pt
                    .map(va, page, Permission::from_pte_flags(pte.flags()))
                    .map_err(map_err)
            });
            if let Err(e) = copied {
                failure = Some(e);
            }
        });
        match failure {
            Some(e) => Err(e),
            None => {
                for l in &self.lazy {
                    child.lazy.push(LazyRange {
                        range: l.range.clone(),
                        perm: l.perm,
                    });
                }
                Ok(child)
            }
        }
    }

    /// Verifies that every byte of `range` is mapped with at least read
    /// permission (plus write permission when `is_write`) and accessible
    /// from user mode.
    pub fn access_ok(&self, range: Range<Va>, is_write: bool) -> bool {
        let (lo, hi) = (range.start.into_usize(), range.end.into_usize());
        if lo >= hi {
            return lo == hi && is_user_range(lo, hi);
        }
        if !is_user_range(lo, hi) {
            return false;
        }
        let mut at = lo & !(PAGE_SIZE - 1);
        while at < hi {
            let Ok(pte) = self.pt.walk(Va::new(at).unwrap()) else {
                return false;
            };
            let need = if is_write {
                PteFlags::U | PteFlags::R | PteFlags::W
            } else {
                PteFlags::U | PteFlags::R
            };
            if !pte.flags().contains(need) {
                return false;
            }
            at += PAGE_SIZE;
        }
        true
    }

    /// Translates a user virtual address to the physical address behind it.
    pub fn translate(&self, va: Va) -> Option<Pa> {
        let pte = self.pt.walk(va.page_down()).ok()?;
        Some(pte.pa()? + va.offset())
    }

    /// Copies `dst.len()` bytes out of user memory at `va`.
    ///
    /// Goes through the translation, so it never touches an unmapped user
    /// address regardless of which space is active.
    pub fn copy_from_user(&self, va: Va, dst: &mut [u8]) -> Result<(), KernelError> {
        let end = Va::new(va.into_usize() + dst.len()).ok_or(KernelError::BadAddress)?;
        if !self.access_ok(va..end, false) {
            return Err(KernelError::BadAddress);
        }
        let mut copied = 0;
        while copied < dst.len() {
            let at = va + copied;
            let chunk = (PAGE_SIZE - at.offset()).min(dst.len() - copied);
            let src = self.translate(at).unwrap().into_kva().into_usize() as *const u8;
            unsafe {
                core::ptr::copy_nonoverlapping(src, dst[copied..].as_mut_ptr(), chunk);
            }
            copied += chunk;
        }
        Ok(())
    }

    /// Copies `src` into user memory at `va`.
    pub fn copy_to_user(&self, va: Va, src: &[u8]) -> Result<(), KernelError> {
        let end = Va::new(va.into_usize() + src.len()).ok_or(KernelError::BadAddress)?;
        if !self.access_ok(va..end, true) {
            return Err(KernelError::BadAddress);
        }
        let mut copied = 0;
        while copied < src.len() {
            let at = va + copied;
            let chunk = (PAGE_SIZE - at.offset()).min(src.len() - copied);
            let dst = self.translate(at).unwrap().into_kva().into_usize() as *mut u8;
            unsafe {
                core::ptr::copy_nonoverlapping(src[copied..].as_ptr(), dst, chunk);
            }
            copied += chunk;
        }
        Ok(())
    }

    /// Reads a NUL-terminated user string, validating page by page.
    ///
    /// # Errors
    /// - [`KernelError::BadAddress`]: an unmapped page before the NUL.
    /// - [`KernelError::InvalidArgument`]: no NUL within [`USER_STR_MAX`]
    ///   bytes, or the bytes are not UTF-8.
    pub fn read_user_str(&self, va: Va) -> Result<String, KernelError> {
        let mut bytes = Vec::new();
        let mut at = va;
        while bytes.len() < USER_STR_MAX {
            let page_end = at.page_down() + PAGE_SIZE;
            let chunk = (page_end - at).min(USER_STR_MAX - bytes.len());
            let end = Va::new(at.into_usize() + chunk).ok_or(KernelError::BadAddress)?;
            if !self.access_ok(at..end, false) {
                return Err(KernelError::BadAddress);
            }
            let base = self.translate(at).unwrap().into_kva().into_usize() as *const u8;
            for i in 0..chunk {
                let b = unsafe { base.add(i).read() };
                if b == 0 {
                    return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
                }
                bytes.push(b);
            }
            at = end;
        }
        Err(KernelError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::USER_LO;

    fn uva(off: usize) -> Va {
        Va::new(USER_LO + off).unwrap()
    }

    fn rw() -> Permission {
        Permission::READ | Permission::WRITE | Permission::USER
    }

    fn write_user(space: &MemorySpace, va: Va, bytes: &[u8]) {
        space.copy_to_user(va, bytes).unwrap();
    }

    #[test]
    fn alloc_and_map_covers_the_range() {
        let mut space = MemorySpace::new().unwrap();
        space
            .alloc_and_map_range(uva(0x4000), 3 * PAGE_SIZE, rw())
            .unwrap();
        assert!(space.access_ok(uva(0x4000)..uva(0x7000), true));
        assert!(!space.access_ok(uva(0x3000)..uva(0x7000), false));
        assert!(!space.access_ok(uva(0x4000)..uva(0x7001), false));
    }

    #[test]
    fn access_ok_rejects_spans_straddling_unmapped_pages() {
        let mut space = MemorySpace::new().unwrap();
        space
            .alloc_and_map_range(uva(0x1000), PAGE_SIZE, rw())
            .unwrap();
        // 16 bytes starting 8 bytes before the unmapped page.
        assert!(!space.access_ok(uva(0x1ff8)..uva(0x2008), false));
        assert!(space.access_ok(uva(0x1ff8)..uva(0x2000), false));
    }

    #[test]
    fn write_permission_is_checked() {
        let mut space = MemorySpace::new().unwrap();
        space
            .alloc_and_map_range(uva(0), PAGE_SIZE, Permission::READ | Permission::USER)
            .unwrap();
        assert!(space.access_ok(uva(0)..uva(0x100), false));
        assert!(!space.access_ok(uva(0)..uva(0x100), true));
    }

    #[test]
    fn kernel_addresses_never_validate() {
        let space = MemorySpace::new().unwrap();
        let k = Va::new(0x8000_0000).unwrap();
        assert!(!space.access_ok(k..Va::new(0x8000_0010).unwrap(), false));
    }

    #[test]
    fn copy_round_trips_across_page_boundaries() {
        let mut space = MemorySpace::new().unwrap();
        space
            .alloc_and_map_range(uva(0), 2 * PAGE_SIZE, rw())
            .unwrap();
        let msg = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let at = uva(PAGE_SIZE - 4);
        write_user(&space, at, &msg);
        let mut back = [0u8; 8];
        space.copy_from_user(at, &mut back).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn clone_copies_bytes_into_disjoint_frames() {
        let mut parent = MemorySpace::new().unwrap();
        parent
            .alloc_and_map_range(uva(0x2000), 2 * PAGE_SIZE, rw())
            .unwrap();
        write_user(&parent, uva(0x2010), b"fork me");

        let child = parent.try_clone().unwrap();

        // Same contents...
        let mut got = [0u8; 7];
        child.copy_from_user(uva(0x2010), &mut got).unwrap();
        assert_eq!(&got, b"fork me");
        // ...different frames...
        assert_ne!(
            parent.translate(uva(0x2010)).unwrap(),
            child.translate(uva(0x2010)).unwrap()
        );
        // ...and writes stay private.
        write_user(&child, uva(0x2010), b"child!!");
        let mut parent_view = [0u8; 7];
        parent.copy_from_user(uva(0x2010), &mut parent_view).unwrap();
        assert_eq!(&parent_view, b"fork me");
    }

    #[test]
    fn lazy_range_materializes_on_fault() {
        let mut space = MemorySpace::new().unwrap();
        space
            .declare_lazy_range(uva(0x10_0000), 4 * PAGE_SIZE, rw())
            .unwrap();
        assert!(!space.access_ok(uva(0x10_0000)..uva(0x10_0008), false));
        space.handle_page_fault(uva(0x10_0004)).unwrap();
        assert!(space.access_ok(uva(0x10_0000)..uva(0x10_0008), true));
        // Faults outside any declared range are the process's problem.
        assert_eq!(
            space.handle_page_fault(uva(0x50_0000)),
            Err(KernelError::BadAddress)
        );
    }

    #[test]
    fn clone_inherits_lazy_ranges() {
        let mut parent = MemorySpace::new().unwrap();
        parent
            .declare_lazy_range(uva(0x20_0000), PAGE_SIZE, rw())
            .unwrap();
        let mut child = parent.try_clone().unwrap();
        child.handle_page_fault(uva(0x20_0000)).unwrap();
        assert!(child.access_ok(uva(0x20_0000)..uva(0x20_0004), true));
    }

    #[test]
    fn user_strings_are_scanned_page_by_page() {
        let mut space = MemorySpace::new().unwrap();
        space
            .alloc_and_map_range(uva(0), 2 * PAGE_SIZE, rw())
            .unwrap();
        let at = uva(PAGE_SIZE - 3);
        write_user(&space, at, b"hello\0");
        assert_eq!(space.read_user_str(at).unwrap(), "hello");

        // A string running off the mapped region faults instead of running
        // through kernel memory.
        let tail = uva(2 * PAGE_SIZE - 4);
        write_user(&space, tail, b"oops");
        assert_eq!(space.read_user_str(tail), Err(KernelError::BadAddress));
    }
}
