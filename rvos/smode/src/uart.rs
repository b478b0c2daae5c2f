//! Boot console.
//!
//! An NS16550A at the `virt` machine's usual address, driven by polling. The
//! console exists for kernel diagnostics; user-visible character I/O goes
//! through the kernel's device layer, which writes through [`putc`]/[`try_getc`].

use core::fmt::{self, Write};
use spin::Mutex;

/// Address of the first UART on the `virt` machine.
const UART0_BASE: usize = 0x1000_0000;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const UART_THR: usize = 0x0;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const UART_RBR: usize = 0x0;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const UART_LSR: usize = 0x5;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const LSR_RX_READY: u8 = 1 << 0;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const LSR_TX_IDLE: u8 = 1 << 5;

static UART0: Mutex<Ns16550a> = Mutex::new(Ns16550a::new(UART0_BASE));

/// A polled NS16550A.
struct Ns16550a {
    #[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
    base: usize,
}

impl Ns16550a {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    fn putb(&mut self, byte: u8) {
        unsafe {
            while core::ptr::read_volatile((self.base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
            core::ptr::write_volatile((self.base + UART_THR) as *mut u8, byte);
        }
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    fn getb(&mut self) -> Option<u8> {
        unsafe {
            if core::ptr::read_volatile((self.base + UART_LSR) as *const u8) & LSR_RX_READY != 0 {
                Some(core::ptr::read_volatile((self.base + UART_RBR) as *const u8))
            } else {
                None
            }
        }
    }

    // Host stubs: the console swallows output and never has input.
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    fn putb(&mut self, _byte: u8) {}

    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    fn getb(&mut self) -> Option<u8> {
        None
    }
}

impl Write for Ns16550a {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.putb(b'\r');
            }
            self.putb(byte);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(fmt: fmt::Arguments<'_>) {
    let mut uart = UART0.lock();
    let _ = uart.write_fmt(fmt);
}

/// Writes one raw byte to the console.
pub fn putc(byte: u8) {
    UART0.lock().putb(byte);
}

/// Reads one raw byte from the console, if one is pending.
pub fn try_getc() -> Option<u8> {
    UART0.lock().getb()
}
