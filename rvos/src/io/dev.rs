//! Character devices.
//!
//! A small registry maps `(name, instance)` pairs to open functions; the
//! `devopen` syscall resolves through it. Devices are exclusive-open: a
//! second open while the first descriptor chain is alive reports
//! [`KernelError::Busy`], and the claim is dropped when the last reference
//! closes.

use super::{Io, IoRef, term::IoTerm};
use crate::KernelError;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use smode::spinlock::SpinLock;

struct DevEntry {
    name: &'static str,
    instno: usize,
    open: fn() -> Result<IoRef, KernelError>,
}

static DEVTAB: SpinLock<Vec<DevEntry>> = SpinLock::new(Vec::new());

/// Registers device `name` instance `instno` with its open function.
pub fn register(name: &'static str, instno: usize, open: fn() -> Result<IoRef, KernelError>) {
    let mut tab = DEVTAB.lock();
    tab.push(DevEntry { name, instno, open });
    tab.unlock();
}

/// Opens device `name` instance `instno`.
///
/// # Errors
/// - [`KernelError::NoSuchEntry`]: no such device.
/// - [`KernelError::Busy`]: the device is already open.
pub fn open(name: &str, instno: usize) -> Result<IoRef, KernelError> {
    let tab = DEVTAB.lock();
    let open = tab
        .iter()
        .find(|d| d.name == name && d.instno == instno)
        .map(|d| d.open);
    tab.unlock();
    open.ok_or(KernelError::NoSuchEntry)?()
}

static UART_CLAIMED: AtomicBool = AtomicBool::new(false);

/// The console UART as an I/O object.
///
/// Writes drain to the console; reads poll it. Exclusive-open: the claim is
/// released when the last descriptor goes away.
struct Uart;

impl Io for Uart {
    fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut n = 0;
        while n < buf.len() {
            match smode::uart::try_getc() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None if n == 0 => {
                    // Nothing pending; let the caller's loop decide whether
                    // to come back.
                    crate::thread::scheduler::yield_now();
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        for &b in buf {
            smode::uart::putc(b);
        }
        Ok(buf.len())
    }

    fn close(&self) {
        UART_CLAIMED.store(false, Ordering::SeqCst);
    }
}

fn open_uart() -> Result<IoRef, KernelError> {
    if UART_CLAIMED.swap(true, Ordering::SeqCst) {
        return Err(KernelError::Busy);
    }
    Ok(IoRef::new(Uart))
}

fn open_console() -> Result<IoRef, KernelError> {
    // The terminal is the UART behind the line discipline.
    Ok(IoRef::new(IoTerm::new(open_uart()?)))
}

/// Registers the built-in devices.
pub fn init() {
    register("uart", 0, open_uart);
    register("console", 0, open_console);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_open() -> Result<IoRef, KernelError> {
        struct Stub;
        impl Io for Stub {}
        Ok(IoRef::new(Stub))
    }

    #[test]
    fn lookup_matches_name_and_instance() {
        register("blk", 2, stub_open);
        assert!(open("blk", 2).is_ok());
        assert_eq!(open("blk", 0).err(), Some(KernelError::NoSuchEntry));
        assert_eq!(open("nosuch", 2).err(), Some(KernelError::NoSuchEntry));
    }

    #[test]
    fn uart_is_exclusive_until_closed() {
        let first = open_uart().unwrap();
        assert_eq!(open_uart().err(), Some(KernelError::Busy));
        // A duplicated descriptor keeps the claim alive.
        let dup = first.clone();
        drop(first);
        assert_eq!(open_uart().err(), Some(KernelError::Busy));
        drop(dup);
        let reopened = open_uart();
        assert!(reopened.is_ok());
        drop(reopened);
    }
}
