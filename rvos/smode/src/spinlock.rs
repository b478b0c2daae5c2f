//! Interrupt-disabling lock with an explicit-unlock guard.
//!
//! On a single hart, holding a lock means holding off interrupts; a lock that
//! is already taken when `lock()` runs can never be released by anyone else,
//! so re-acquisition is reported as a deadlock instead of spinning.
//!
//! The guard does **not** release the lock on drop. Call
//! [`SpinLockGuard::unlock`] explicitly; dropping a live guard panics. This
//! keeps every critical section visible at the call site.

use crate::interrupt::InterruptGuard;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A mutual exclusion primitive protecting shared data.
///
/// The data can only be accessed through the guard returned from [`lock`] or
/// [`try_lock`], and the guard masks interrupts for as long as it lives.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new lock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, returning a guard with interrupts masked.
    ///
    /// On the hart, finding the lock held is a deadlock (with interrupts
    /// masked nobody else could ever release it) and panics immediately.
    /// Host test threads run in parallel, so there the acquisition spins.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let guard = InterruptGuard::new();
        if self.locked.swap(true, Ordering::SeqCst) {
            #[cfg(all(target_arch = "riscv64", target_os = "none"))]
            panic!("deadlock: lock already held at acquisition");
            #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
            while self.locked.swap(true, Ordering::SeqCst) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            _guard: guard,
            _not_send: core::marker::PhantomData,
        }
    }

    /// Attempts to acquire this lock without blocking.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the lock is already held.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = InterruptGuard::new();
        if self.locked.swap(true, Ordering::SeqCst) {
            drop(guard);
            Err(WouldBlock)
        } else {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
                _guard: guard,
                _not_send: core::marker::PhantomData,
            })
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// A scoped guard for a [`SpinLock`].
///
/// The lock must be explicitly released with [`unlock`]; dropping the guard
/// without it panics, naming the site that took the lock.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    _guard: InterruptGuard,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    pub fn unlock(self) {
        self.lock.locked.store(false, Ordering::SeqCst);
        let this = core::mem::ManuallyDrop::new(self);
        // Run the interrupt-guard drop without running our own.
        unsafe { core::ptr::read(&this._guard) };
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        panic!(
            "`.unlock()` must be called before dropping a SpinLockGuard; taken at {:?}",
            self.caller
        );
    }
}
