//! Interrupt masking.
//!
//! The kernel is single-hart; masking interrupts is its one and only
//! mutual-exclusion mechanism against its own interrupt handlers. The
//! [`InterruptGuard`] nests: the outermost guard records whether interrupts
//! were enabled when it was created, and only the drop of that outermost
//! guard restores them.

use crate::csr;
use core::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

static INITIAL_STATE: AtomicBool = AtomicBool::new(true);
static DEPTH: AtomicIsize = AtomicIsize::new(0);

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state.
    pub fn current() -> Self {
        if csr::interrupts_enabled() {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// An RAII guard that masks interrupts for its lifetime.
///
/// Creating a guard disables interrupts; dropping the outermost guard
/// restores the state observed when it was created. Guards must be dropped
/// in reverse order of creation, which Rust's scoping upholds unless a guard
/// is stored away.
pub struct InterruptGuard {
    _not_send: core::marker::PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Creates a new guard, disabling interrupts.
    pub fn new() -> Self {
        let was_on = csr::interrupts_enabled();
        unsafe { csr::disable_interrupts() };
        if DEPTH.fetch_add(1, Ordering::SeqCst) == 0 {
            INITIAL_STATE.store(was_on, Ordering::SeqCst);
        }
        Self {
            _not_send: core::marker::PhantomData,
        }
    }

    /// Returns whether any guard is currently live.
    pub fn is_guarded() -> bool {
        DEPTH.load(Ordering::SeqCst) > 0
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let prev = DEPTH.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "mismatched InterruptGuard drop: {prev}");
        if prev == 1 && INITIAL_STATE.load(Ordering::SeqCst) {
            unsafe { csr::enable_interrupts() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_restores_outermost_state() {
        let _serial = crate::test_serial();
        assert_eq!(InterruptState::current(), InterruptState::On);
        {
            let _outer = InterruptGuard::new();
            assert_eq!(InterruptState::current(), InterruptState::Off);
            {
                let _inner = InterruptGuard::new();
                assert_eq!(InterruptState::current(), InterruptState::Off);
            }
            // The inner drop must not re-enable.
            assert_eq!(InterruptState::current(), InterruptState::Off);
        }
        assert_eq!(InterruptState::current(), InterruptState::On);
    }
}
