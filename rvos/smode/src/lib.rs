//! S-mode architecture layer of rvOS.
//!
//! Everything in this crate is tied to the RISC-V privileged architecture:
//! CSR access, the trap vector and its frame layout, the context-switch
//! primitives, the interrupt-masking discipline, and the boot console. The
//! kernel proper (`rvos`) is written entirely against this crate's interface
//! and contains no assembly of its own.
//!
//! The crate builds for two configurations:
//!
//! - `riscv64` / `target_os = "none"`: the real thing. CSRs are touched, the
//!   trap vector is emitted, `wfi` halts the hart.
//! - anything else (the host): every machine touchpoint is replaced by a stub
//!   so the kernel's logic-level unit tests run under a stock `cargo test`.

#![no_std]
#![warn(missing_docs)]

pub mod addressing;

// Host tests share the emulated interrupt/CSR state; the modules that assert
// on it serialize through this lock.
#[cfg(test)]
static TEST_SERIAL: spin::Mutex<()> = spin::Mutex::new(());

#[cfg(test)]
pub(crate) fn test_serial() -> spin::MutexGuard<'static, ()> {
    TEST_SERIAL.lock()
}

pub mod context;
pub mod csr;
pub mod interrupt;
pub mod spinlock;
pub mod trap;
pub mod uart;

/// Prints to the console.
///
/// Uses the `format!` syntax. The console lock is held for the duration of a
/// single `print!`.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::uart::_print(format_args!($($arg)*)));
}

/// Prints to the console, with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Displays an informational message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::print!("[INFO] {}\n", format_args!($($arg)*)));
}

/// Displays a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::print!("[WARN] {}\n", format_args!($($arg)*)));
}

/// Displays a debug trace message.
///
/// Compiles to nothing unless the `trace` feature is enabled.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(feature = "trace") {
            $crate::print!("[DEBUG] {}\n", format_args!($($arg)*));
        }
    };
}
