//! Validated access to user memory.
//!
//! The kernel never believes a user pointer. Every accessor here validates
//! the full byte range against the current process's address space before a
//! single byte moves; a failure is [`KernelError::BadAddress`] and nothing
//! has been touched.
//!
//! The pointer types are one-shot: `get`/`put` consume them, so a value is
//! validated at the moment it is used and cannot be replayed after the
//! address space has changed.

use crate::KernelError;
use crate::thread::with_current_process;
use alloc::string::String;
use core::mem::{MaybeUninit, size_of};
use smode::addressing::Va;

/// A one-shot, read-only user pointer to a `T`.
#[derive(Debug)]
pub struct UserPtrRO<T: Copy> {
    addr: usize,
    _ty: core::marker::PhantomData<T>,
}

impl<T: Copy> UserPtrRO<T> {
    /// Wraps the user address `addr`.
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            _ty: core::marker::PhantomData,
        }
    }

    /// Reads the `T` behind the pointer.
    pub fn get(self) -> Result<T, KernelError> {
        let va = Va::new(self.addr).ok_or(KernelError::BadAddress)?;
        with_current_process(|p| {
            let mut val = MaybeUninit::<T>::uninit();
            let dst = unsafe {
                core::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, size_of::<T>())
            };
            p.space.copy_from_user(va, dst)?;
            Ok(unsafe { val.assume_init() })
        })
    }
}

/// A one-shot, write-only user pointer to a `T`.
#[derive(Debug)]
pub struct UserPtrWO<T: Copy> {
    addr: usize,
    _ty: core::marker::PhantomData<T>,
}

impl<T: Copy> UserPtrWO<T> {
    /// Wraps the user address `addr`.
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            _ty: core::marker::PhantomData,
        }
    }

    /// Writes `value` behind the pointer.
    pub fn put(self, value: T) -> Result<usize, KernelError> {
        let va = Va::new(self.addr).ok_or(KernelError::BadAddress)?;
        with_current_process(|p| {
            let src = unsafe {
                core::slice::from_raw_parts(&value as *const T as *const u8, size_of::<T>())
            };
            p.space.copy_to_user(va, src)?;
            Ok(size_of::<T>())
        })
    }
}

/// A NUL-terminated string in user memory.
#[derive(Debug)]
pub struct UserCString {
    addr: usize,
}

impl UserCString {
    /// Wraps the user address `addr`.
    pub fn new(addr: usize) -> Self {
        Self { addr }
    }

    /// Reads the string, scanning page by page up to the kernel's limit.
    pub fn read(self) -> Result<String, KernelError> {
        let va = Va::new(self.addr).ok_or(KernelError::BadAddress)?;
        with_current_process(|p| p.space.read_user_str(va))
    }
}

/// Turns a validated user range into a byte slice.
///
/// # Safety
/// The caller must have validated `[ptr, ptr + len)` against the current
/// address space with the appropriate permission, and that space must be
/// the active one for as long as the slice lives.
pub unsafe fn user_bytes<'a>(ptr: usize, len: usize) -> &'a [u8] {
    unsafe { core::slice::from_raw_parts(ptr as *const u8, len) }
}

/// Mutable variant of [`user_bytes`].
///
/// # Safety
/// As [`user_bytes`], with write permission validated.
pub unsafe fn user_bytes_mut<'a>(ptr: usize, len: usize) -> &'a mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) }
}
