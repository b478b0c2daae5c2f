//! Memory management.
//!
//! The core abstraction is the [`Page`]: one exclusively-owned 4 KiB physical
//! frame, carved from the kernel heap (the kernel window is identity-mapped,
//! so a heap page *is* a frame). A [`Page`] is freed when dropped; handing a
//! frame to a page table transfers ownership with [`Page::into_raw`], and
//! tearing a mapping down reconstructs the owner with [`Page::from_pa`].
//!
//! [`page_table`] implements the Sv39 tree, [`space`] the per-process
//! address-space operations built on top of it.

pub mod page_table;
pub mod space;

pub use space::{MemorySpace, Mtag};

use crate::KernelError;
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;
use smode::addressing::{Kva, PAGE_SIZE, Pa};
use smode::spinlock::SpinLock;

/// Bottom of the user window.
pub const USER_LO: usize = 0xC000_0000;

/// Top of the user window (exclusive).
pub const USER_HI: usize = 0x1_0000_0000;

/// Number of identity-mapped kernel gigapages installed into every root
/// (`[0, KERNEL_GIGA_PAGES << 30)`: MMIO and RAM).
pub const KERNEL_GIGA_PAGES: usize = 3;

const PAGE_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(l) => l,
    Err(_) => unreachable!(),
};

/// A representation of one 4 KiB memory page.
///
/// Allocation is zeroing; the page is freed when the instance drops. Frames
/// are never shared: cloning an address space copies bytes into fresh pages.
pub struct Page {
    ptr: NonNull<u8>,
}

unsafe impl Send for Page {}

impl Page {
    /// Allocates a new zeroed page.
    ///
    /// # Errors
    /// [`KernelError::NoMemory`] when the heap is exhausted.
    pub fn new() -> Result<Self, KernelError> {
        NonNull::new(unsafe { alloc_zeroed(PAGE_LAYOUT) })
            .map(|ptr| Self { ptr })
            .ok_or(KernelError::NoMemory)
    }

    /// The kernel virtual address of this page.
    #[inline]
    pub fn kva(&self) -> Kva {
        Kva::new(self.ptr.as_ptr() as usize).unwrap()
    }

    /// The physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.kva().into_pa()
    }

    /// Read-only access to the page contents.
    pub fn inner(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Mutable access to the page contents.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Consumes the page, returning its physical address.
    ///
    /// The caller becomes responsible for the frame; reconstruct the owner
    /// with [`Page::from_pa`] to release it.
    #[inline]
    pub fn into_raw(self) -> Pa {
        core::mem::ManuallyDrop::new(self).pa()
    }

    /// Reconstructs a page from a physical address.
    ///
    /// # Safety
    /// `pa` must have come from [`Page::into_raw`] and must not be
    /// reconstructed twice.
    #[inline]
    pub unsafe fn from_pa(pa: Pa) -> Self {
        Self {
            ptr: unsafe { NonNull::new_unchecked(pa.into_kva().into_usize() as *mut u8) },
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), PAGE_LAYOUT) };
    }
}

static KERNEL_SPACE: SpinLock<Option<MemorySpace>> = SpinLock::new(None);

/// Sets up the kernel-only address space used when no process is active.
pub fn init() {
    let space = MemorySpace::new().expect("no memory for the kernel address space");
    let mut guard = KERNEL_SPACE.lock();
    *guard = Some(space);
    guard.unlock();
}

/// Switches translation to the kernel-only address space.
///
/// Used to deactivate a process's space before reclaiming it.
pub fn switch_to_kernel_space() {
    let guard = KERNEL_SPACE.lock();
    if let Some(space) = guard.as_ref() {
        space.switch_to();
    }
    guard.unlock();
}

/// Is `[lo, hi)` contained in the user window?
#[inline]
pub fn is_user_range(lo: usize, hi: usize) -> bool {
    lo >= USER_LO && hi <= USER_HI && lo <= hi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_zeroed_and_writable() {
        let mut page = Page::new().unwrap();
        assert!(page.inner().iter().all(|&b| b == 0));
        page.inner_mut()[123] = 0xAB;
        assert_eq!(page.inner()[123], 0xAB);
    }

    #[test]
    fn raw_round_trip_preserves_contents() {
        let mut page = Page::new().unwrap();
        page.inner_mut()[0] = 0x42;
        let pa = page.into_raw();
        let page = unsafe { Page::from_pa(pa) };
        assert_eq!(page.inner()[0], 0x42);
        assert_eq!(page.pa(), pa);
    }

    #[test]
    fn user_range_bounds() {
        assert!(is_user_range(USER_LO, USER_HI));
        assert!(!is_user_range(USER_LO - 1, USER_HI));
        assert!(!is_user_range(USER_LO, USER_HI + 1));
        assert!(is_user_range(USER_LO + 0x1000, USER_LO + 0x2000));
    }
}
