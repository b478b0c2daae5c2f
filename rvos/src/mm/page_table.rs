//! Sv39 page tables.
//!
//! Three levels of 512 entries each, 4 KiB leaves. Every root carries the
//! identity-mapped kernel window as gigapage leaf entries, so the kernel is
//! visible in every address space; user mappings are built out of 4 KiB
//! pages whose frames the table owns.
//!
//! A virtual address decomposes as:
//!
//! ```text
//! 38        30 29        21 20        12 11         0
//! +-----------+------------+------------+------------+
//! |   VPN[2]  |   VPN[1]   |   VPN[0]   |   offset   |
//! +-----------+------------+------------+------------+
//! ```
//!
//! and an entry holds the target PPN in bits 53..10 above the flag bits.

use super::{KERNEL_GIGA_PAGES, Page};
use alloc::boxed::Box;
use smode::addressing::{PAGE_MASK, PAGE_SHIFT, Pa, Va};

bitflags::bitflags! {
    /// Flags of an Sv39 page-table entry.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PteFlags: usize {
        /// Valid; must be 1 for the entry to participate in translation.
        const V = 1 << 0;
        /// Readable leaf.
        const R = 1 << 1;
        /// Writable leaf.
        const W = 1 << 2;
        /// Executable leaf.
        const X = 1 << 3;
        /// Accessible from user mode.
        const U = 1 << 4;
        /// Global mapping, present in every address space.
        const G = 1 << 5;
        /// Accessed.
        const A = 1 << 6;
        /// Dirty.
        const D = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Possible memory permissions for a mapped page.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Page can be referred to by a user application.
        const USER = 1 << 3;
    }
}

impl Permission {
    /// Translates the permission into leaf-entry flags.
    ///
    /// `A` and `D` are set eagerly; this kernel does not manage them.
    pub fn into_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::V | PteFlags::A | PteFlags::D;
        if self.contains(Permission::READ) {
            flags |= PteFlags::R;
        }
        if self.contains(Permission::WRITE) {
            flags |= PteFlags::W;
        }
        if self.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::X;
        }
        if self.contains(Permission::USER) {
            flags |= PteFlags::U;
        }
        flags
    }

    /// Recovers the permission encoded in leaf-entry flags.
    pub fn from_pte_flags(flags: PteFlags) -> Self {
        let mut perm = Permission::empty();
        if flags.contains(PteFlags::R) {
            perm |= Permission::READ;
        }
        if flags.contains(PteFlags::W) {
            perm |= Permission::WRITE;
        }
        if flags.contains(PteFlags::X) {
            perm |= Permission::EXECUTABLE;
        }
        if flags.contains(PteFlags::U) {
            perm |= Permission::USER;
        }
        perm
    }
}

/// Page table mapping error.
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    Unaligned,
    /// The requested entry does not exist.
    NotExist,
    /// The address is already mapped.
    Duplicated,
    /// The mapping's permission or location is not allowed.
    InvalidPermission,
}

/// An Sv39 page-table entry.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Pte(pub usize);

const FLAG_BITS: usize = 0x3ff;

impl Pte {
    /// An invalid (empty) entry.
    pub const EMPTY: Self = Self(0);

    /// The physical address this entry points at, if it is valid.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.0 & PteFlags::V.bits() != 0 {
            Pa::new((self.0 >> 10) << PAGE_SHIFT)
        } else {
            None
        }
    }

    /// The flags of this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAG_BITS)
    }

    /// Is this entry a leaf (any of R/W/X set)?
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags()
            .intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    /// Points the entry at `pa`, preserving its flags and setting `V`.
    ///
    /// # Errors
    /// [`PageTableMappingError::Unaligned`] when `pa` is not page-aligned.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, PageTableMappingError> {
        let pa = pa.into_usize();
        if pa & PAGE_MASK != 0 {
            Err(PageTableMappingError::Unaligned)
        } else {
            self.0 = ((pa >> PAGE_SHIFT) << 10) | (self.0 & FLAG_BITS) | PteFlags::V.bits();
            Ok(self)
        }
    }

    /// Replaces the flags of this entry, preserving the address.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) -> &mut Self {
        self.0 = (self.0 & !FLAG_BITS) | flags.bits();
        self
    }

    /// Clears the entry, returning the address it held.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        let pa = self.pa();
        self.0 = 0;
        pa
    }

    /// The next-level table this non-leaf entry points at.
    ///
    /// # Safety
    /// The entry must point at a live page-table page.
    #[inline]
    unsafe fn table_mut<'a>(&self) -> &'a mut [Pte; 512] {
        let pa = self.pa().expect("dereferencing an invalid pte");
        unsafe { &mut *(pa.into_kva().into_usize() as *mut [Pte; 512]) }
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.pa() {
            Some(pa) => write!(f, "Pte({:016x}, {:?})", pa.into_usize(), self.flags()),
            None => write!(f, "."),
        }
    }
}

/// Page-table indices of a virtual address.
pub struct PtIndices {
    /// The decomposed address.
    pub va: Va,
    /// Level-2 (root) index.
    pub vpn2: usize,
    /// Level-1 index.
    pub vpn1: usize,
    /// Level-0 index.
    pub vpn0: usize,
}

impl PtIndices {
    /// Decomposes a page-aligned virtual address.
    ///
    /// # Errors
    /// [`PageTableMappingError::Unaligned`] when `va` has a page offset.
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        let addr = va.into_usize();
        if addr & PAGE_MASK != 0 {
            Err(PageTableMappingError::Unaligned)
        } else {
            Ok(Self {
                va,
                vpn2: (addr >> 30) & 0x1ff,
                vpn1: (addr >> 21) & 0x1ff,
                vpn0: (addr >> 12) & 0x1ff,
            })
        }
    }
}

/// A page-table root: 512 entries, page-aligned.
///
/// Indices below [`KERNEL_GIGA_PAGES`] are the shared kernel window and must
/// never be touched by user-mapping operations.
#[repr(align(4096))]
pub struct PageTableRoot(pub [Pte; 512]);

impl PageTableRoot {
    fn new_boxed_with_kernel_window() -> Box<Self> {
        let mut root = Box::new(PageTableRoot([Pte::EMPTY; 512]));
        for (i, entry) in root.0.iter_mut().enumerate().take(KERNEL_GIGA_PAGES) {
            // Identity-mapped gigapage: MMIO and RAM, kernel-only.
            *entry = Pte(((i << 30) >> PAGE_SHIFT) << 10);
            entry.set_flags(
                PteFlags::V
                    | PteFlags::R
                    | PteFlags::W
                    | PteFlags::X
                    | PteFlags::G
                    | PteFlags::A
                    | PteFlags::D,
            );
        }
        root
    }
}

/// Sv39 mode field of `satp`.
const SATP_MODE_SV39: usize = 8 << 60;

/// A three-level Sv39 page table for one user address space.
///
/// Owns every user frame and intermediate table page it references; dropping
/// the table frees them all. The kernel gigapage entries are shared global
/// state and are left alone.
pub struct PageTable {
    root: Box<PageTableRoot>,
}

impl PageTable {
    /// Creates a page table mapping only the kernel window.
    pub fn new() -> Self {
        Self {
            root: PageTableRoot::new_boxed_with_kernel_window(),
        }
    }

    /// The physical address of the root page.
    pub fn pa(&self) -> Pa {
        Pa::new(self.root.as_ref() as *const PageTableRoot as usize).unwrap()
    }

    /// The `satp` value that activates this table.
    pub fn satp(&self) -> usize {
        SATP_MODE_SV39 | (self.pa().into_usize() >> PAGE_SHIFT)
    }

    /// Maps the user page `pg` at `va` with permission `perm`.
    ///
    /// The frame's ownership moves into the table. Fails without leaking the
    /// page.
    ///
    /// # Errors
    /// - [`PageTableMappingError::Unaligned`]: `va` has a page offset.
    /// - [`PageTableMappingError::InvalidPermission`]: `va` is outside the
    ///   user window, or `perm` lacks [`Permission::USER`].
    /// - [`PageTableMappingError::Duplicated`]: `va` is already mapped.
    pub fn map(
        &mut self,
        va: Va,
        pg: Page,
        perm: Permission,
    ) -> Result<(), PageTableMappingError> {
        let pa = pg.into_raw();
        unsafe { self.do_map(va, pa, perm.into_pte_flags()) }
            .inspect_err(|_| drop(unsafe { Page::from_pa(pa) }))
    }

    /// Maps the physical address `pa` at `va` with raw leaf flags.
    ///
    /// # Safety
    /// `pa` must be a frame the caller owns and is handing to the table.
    pub unsafe fn do_map(
        &mut self,
        va: Va,
        pa: Pa,
        flags: PteFlags,
    ) -> Result<(), PageTableMappingError> {
        if !super::is_user_range(va.into_usize(), va.into_usize() + (PAGE_MASK + 1))
            || !flags.contains(PteFlags::U)
        {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let pte = self.walk_alloc(va)?;
        if pte.flags().contains(PteFlags::V) {
            return Err(PageTableMappingError::Duplicated);
        }
        pte.set_pa(pa)?.set_flags(flags);
        Ok(())
    }

    /// Unmaps `va`, returning the frame that was mapped there.
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        let pte = self.walk_mut(va)?;
        let pa = pte.clear().ok_or(PageTableMappingError::NotExist)?;
        Ok(unsafe { Page::from_pa(pa) })
    }

    /// Finds the leaf entry for `va`.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        let PtIndices {
            vpn2, vpn1, vpn0, ..
        } = PtIndices::from_va(va)?;
        let l2 = &self.root.0[vpn2];
        if !l2.flags().contains(PteFlags::V) || l2.is_leaf() {
            // Kernel gigapages are not user leaves.
            return Err(PageTableMappingError::NotExist);
        }
        let l1 = &unsafe { l2.table_mut() }[vpn1];
        if !l1.flags().contains(PteFlags::V) || l1.is_leaf() {
            return Err(PageTableMappingError::NotExist);
        }
        let l0 = &unsafe { l1.table_mut() }[vpn0];
        if !l0.flags().contains(PteFlags::V) {
            return Err(PageTableMappingError::NotExist);
        }
        Ok(unsafe { &*(l0 as *const Pte) })
    }

    /// Finds the leaf entry for `va`, mutably.
    pub fn walk_mut(&mut self, va: Va) -> Result<&mut Pte, PageTableMappingError> {
        let PtIndices {
            vpn2, vpn1, vpn0, ..
        } = PtIndices::from_va(va)?;
        let l2 = &mut self.root.0[vpn2];
        if !l2.flags().contains(PteFlags::V) || l2.is_leaf() {
            return Err(PageTableMappingError::NotExist);
        }
        let l1 = &mut unsafe { l2.table_mut() }[vpn1];
        if !l1.flags().contains(PteFlags::V) || l1.is_leaf() {
            return Err(PageTableMappingError::NotExist);
        }
        let l0 = &mut unsafe { l1.table_mut() }[vpn0];
        if !l0.flags().contains(PteFlags::V) {
            return Err(PageTableMappingError::NotExist);
        }
        Ok(l0)
    }

    /// Descends to the leaf entry for `va`, allocating intermediate tables.
    fn walk_alloc(&mut self, va: Va) -> Result<&mut Pte, PageTableMappingError> {
        let PtIndices {
            vpn2, vpn1, vpn0, ..
        } = PtIndices::from_va(va)?;
        let l2 = &mut self.root.0[vpn2];
        if !l2.flags().contains(PteFlags::V) {
            let table = Page::new().map_err(|_| PageTableMappingError::NotExist)?;
            l2.set_pa(table.into_raw())?.set_flags(PteFlags::V);
        } else if l2.is_leaf() {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let l1 = &mut unsafe { l2.table_mut() }[vpn1];
        if !l1.flags().contains(PteFlags::V) {
            let table = Page::new().map_err(|_| PageTableMappingError::NotExist)?;
            l1.set_pa(table.into_raw())?.set_flags(PteFlags::V);
        } else if l1.is_leaf() {
            return Err(PageTableMappingError::InvalidPermission);
        }
        Ok(&mut unsafe { l1.table_mut() }[vpn0])
    }

    /// Calls `f` for every mapped user leaf, lowest address first.
    pub fn for_each_user_leaf(&self, mut f: impl FnMut(Va, &Pte)) {
        for (i, l2) in self.root.0.iter().enumerate().skip(KERNEL_GIGA_PAGES) {
            if !l2.flags().contains(PteFlags::V) || l2.is_leaf() {
                continue;
            }
            for (j, l1) in unsafe { l2.table_mut() }.iter().enumerate() {
                if !l1.flags().contains(PteFlags::V) || l1.is_leaf() {
                    continue;
                }
                for (k, l0) in unsafe { l1.table_mut() }.iter().enumerate() {
                    if l0.flags().contains(PteFlags::V) {
                        let va = Va::new((i << 30) | (j << 21) | (k << PAGE_SHIFT)).unwrap();
                        f(va, l0);
                    }
                }
            }
        }
    }

    /// Frees every user mapping and every intermediate table.
    ///
    /// The kernel gigapage entries are untouched.
    fn clear(&mut self) {
        for l2 in self.root.0.iter_mut().skip(KERNEL_GIGA_PAGES) {
            let Some(l1_pa) = l2.pa() else { continue };
            if l2.is_leaf() {
                continue;
            }
            for l1 in unsafe { l2.table_mut() }.iter_mut() {
                let Some(l0_pa) = l1.pa() else { continue };
                if l1.is_leaf() {
                    continue;
                }
                for l0 in unsafe { l1.table_mut() }.iter_mut() {
                    if let Some(frame) = l0.clear() {
                        drop(unsafe { Page::from_pa(frame) });
                    }
                }
                l1.clear();
                drop(unsafe { Page::from_pa(l0_pa) });
            }
            l2.clear();
            drop(unsafe { Page::from_pa(l1_pa) });
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        assert_ne!(
            smode::csr::read_satp(),
            self.satp(),
            "trying to drop the active page table"
        );
        self.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::USER_LO;

    fn user_va(off: usize) -> Va {
        Va::new(USER_LO + off).unwrap()
    }

    #[test]
    fn decomposes_virtual_addresses() {
        let idx = PtIndices::from_va(Va::new(0xC040_3000).unwrap()).unwrap();
        assert_eq!(idx.vpn2, 3);
        assert_eq!(idx.vpn1, 2);
        assert_eq!(idx.vpn0, 3);
        assert!(matches!(
            PtIndices::from_va(Va::new(0xC000_0001).unwrap()),
            Err(PageTableMappingError::Unaligned)
        ));
    }

    #[test]
    fn map_then_walk_observes_the_frame() {
        let mut pt = PageTable::new();
        let mut pg = Page::new().unwrap();
        pg.inner_mut()[0] = 0x5A;
        let pa = pg.pa();
        pt.map(user_va(0x3000), pg, Permission::READ | Permission::USER)
            .unwrap();

        let pte = pt.walk(user_va(0x3000)).unwrap();
        assert_eq!(pte.pa(), Some(pa));
        assert!(pte.flags().contains(PteFlags::U | PteFlags::R));
        assert!(!pte.flags().contains(PteFlags::W));
        assert!(matches!(
            pt.walk(user_va(0x4000)),
            Err(PageTableMappingError::NotExist)
        ));
    }

    #[test]
    fn duplicate_mapping_is_rejected() {
        let mut pt = PageTable::new();
        let perm = Permission::READ | Permission::WRITE | Permission::USER;
        pt.map(user_va(0), Page::new().unwrap(), perm).unwrap();
        assert_eq!(
            pt.map(user_va(0), Page::new().unwrap(), perm),
            Err(PageTableMappingError::Duplicated)
        );
    }

    #[test]
    fn kernel_window_is_not_mappable() {
        let mut pt = PageTable::new();
        assert_eq!(
            pt.map(
                Va::new(0x8000_0000).unwrap(),
                Page::new().unwrap(),
                Permission::READ | Permission::USER
            ),
            Err(PageTableMappingError::InvalidPermission)
        );
        // User mappings must carry the USER permission.
        assert_eq!(
            pt.map(user_va(0), Page::new().unwrap(), Permission::READ),
            Err(PageTableMappingError::InvalidPermission)
        );
    }

    #[test]
    fn unmap_returns_the_frame() {
        let mut pt = PageTable::new();
        let mut pg = Page::new().unwrap();
        pg.inner_mut()[7] = 77;
        pt.map(user_va(0x1000), pg, Permission::READ | Permission::USER)
            .unwrap();
        let pg = pt.unmap(user_va(0x1000)).unwrap();
        assert_eq!(pg.inner()[7], 77);
        assert!(matches!(
            pt.walk(user_va(0x1000)),
            Err(PageTableMappingError::NotExist)
        ));
    }

    #[test]
    fn kernel_window_entries_are_global_gigapages() {
        let pt = PageTable::new();
        for i in 0..crate::mm::KERNEL_GIGA_PAGES {
            let pte = pt.root.0[i];
            assert!(pte.is_leaf());
            assert!(pte.flags().contains(PteFlags::G));
            assert!(!pte.flags().contains(PteFlags::U));
            assert_eq!(pte.pa().unwrap().into_usize(), i << 30);
        }
    }

    #[test]
    fn iterates_user_leaves_in_order() {
        let mut pt = PageTable::new();
        let perm = Permission::READ | Permission::USER;
        for off in [0x5000, 0x1000, 0x20_0000] {
            pt.map(user_va(off), Page::new().unwrap(), perm).unwrap();
        }
        let mut seen = alloc::vec::Vec::new();
        pt.for_each_user_leaf(|va, _| seen.push(va.into_usize() - USER_LO));
        assert_eq!(seen, [0x1000, 0x5000, 0x20_0000]);
    }
}
