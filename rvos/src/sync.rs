//! Synchronization primitives.
//!
//! The lock is the interrupt-disabling [`SpinLock`] from the architecture
//! layer; blocking coordination is the [`Condition`], whose wait lists feed
//! the scheduler's ready list directly.

pub use crate::thread::Condition;
pub use smode::interrupt::{InterruptGuard, InterruptState};
pub use smode::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
