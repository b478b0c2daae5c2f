//! # rvOS
//!
//! A small teaching operating system for RISC-V (RV64, supervisor mode).
//!
//! The kernel is built from four tightly coupled subsystems:
//!
//! 1. A **thread manager** with a fixed-slot thread table, cooperative
//!    scheduling, and condition variables ([`thread`]).
//! 2. A **process model** with per-process Sv39 address spaces and a
//!    kernel-stack-cloning `fork` ([`process`]).
//! 3. A **virtual-memory subsystem**: page tables, address-space cloning,
//!    demand mapping, and validation of user-supplied pointers ([`mm`]).
//! 4. A polymorphic **I/O layer** with reference-counted objects, including
//!    a shared bounded **pipe** ([`io`]).
//!
//! User programs reach the kernel through the environment-call trap; the
//! dispatcher in [`syscall`] validates every user pointer before touching it
//! and folds results or [`KernelError`] codes back into `a0`.
//!
//! Everything architecture-bound (CSRs, the trap vector, context switching,
//! the console) lives in the [`smode`] crate; this crate contains no
//! assembly. On non-RISC-V hosts the machine touchpoints are stubbed, which
//! is what lets the unit tests here run under a stock `cargo test`.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

#[macro_use]
extern crate smode;

pub mod interrupt;
pub mod io;
mod loader;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod thread;

#[cfg(all(not(test), target_os = "none"))]
mod lang;

pub use smode::{addressing, trap::TrapFrame};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific failure a kernel operation can
/// report. The numeric encoding ([`KernelError::into_usize`]) is what user
/// programs observe as a negative syscall return value.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file, device, or directory entry. (ENOENT)
    NoSuchEntry,
    /// I/O error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// No child matches the wait. (ECHILD)
    NoChild,
    /// Resource temporarily unavailable; out of thread or process slots.
    /// (EAGAIN)
    TryAgain,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address: a user pointer out of range or unmapped. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// Broken pipe. (EPIPE)
    BrokenPipe,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// Operation is not supported by this object. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the error into the corresponding negative error code, cast
    /// to `usize` for use as a syscall return value.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoChild => -10,
            KernelError::TryAgain => -11,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::BrokenPipe => -32,
            KernelError::NoSuchSyscall => -38,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// The given `isize` does not encode a [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    _e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -8 => Ok(Self::NoExec),
            -9 => Ok(Self::BadFileDescriptor),
            -10 => Ok(Self::NoChild),
            -11 => Ok(Self::TryAgain),
            -12 => Ok(Self::NoMemory),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            -22 => Ok(Self::InvalidArgument),
            -24 => Ok(Self::TooManyOpenFile),
            -32 => Ok(Self::BrokenPipe),
            -38 => Ok(Self::NoSuchSyscall),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { _e: e }),
        }
    }
}

/// Timer tick length in timebase cycles (10 ms on the `virt` machine's
/// 10 MHz timebase).
pub const TICK_CYCLES: u64 = 100_000;

/// The entry of the kernel, called by the boot collaborator with the MMU on
/// and an identity-mapped kernel window.
///
/// Brings up the heap, the trap vector, and the thread manager, then calls
/// the externally-provided `main` hook on the main thread. When `main`
/// returns, the main thread exits, which powers the machine off.
#[cfg(all(not(test), target_os = "none"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rust_main(hart_id: usize) -> ! {
    info!("rvOS starting on hart {}", hart_id);
    unsafe {
        lang::init_heap();
    }
    smode::trap::init();
    mm::init();
    thread::init();
    io::dev::init();
    unsafe {
        smode::csr::enable_timer_interrupt();
    }
    smode::csr::set_timer(TICK_CYCLES);
    unsafe {
        smode::csr::enable_interrupts();
    }

    unsafe extern "Rust" {
        fn main();
    }
    unsafe { main() };

    // Exiting the main thread powers the machine off.
    thread::exit();
}

#[cfg(test)]
mod tests {
    use super::KernelError;

    #[test]
    fn errno_round_trip() {
        for e in [
            KernelError::OperationNotPermitted,
            KernelError::NoSuchEntry,
            KernelError::IOError,
            KernelError::NoExec,
            KernelError::BadFileDescriptor,
            KernelError::NoChild,
            KernelError::TryAgain,
            KernelError::NoMemory,
            KernelError::BadAddress,
            KernelError::Busy,
            KernelError::InvalidArgument,
            KernelError::TooManyOpenFile,
            KernelError::BrokenPipe,
            KernelError::NoSuchSyscall,
            KernelError::NotSupportedOperation,
        ] {
            let encoded = e.into_usize() as isize;
            assert!(encoded < 0);
            assert_eq!(KernelError::try_from(encoded), Ok(e));
        }
    }

    #[test]
    fn unknown_errno_is_rejected() {
        assert!(KernelError::try_from(-1000).is_err());
        assert!(KernelError::try_from(0).is_err());
        assert!(KernelError::try_from(1).is_err());
    }
}
