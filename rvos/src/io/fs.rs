//! The filesystem seam.
//!
//! The real filesystem is a collaborator: the kernel only needs "open a
//! named file, get an I/O object". A backing implementation registers
//! itself at boot; [`MemFs`] is the in-tree implementation backing boot
//! images and tests with in-memory files.

use super::{IoRef, lit::IoLit};
use crate::KernelError;
use alloc::{boxed::Box, string::String, vec::Vec};
use smode::spinlock::SpinLock;

/// A filesystem: a namespace of openable byte streams.
pub trait Filesystem: Send + Sync {
    /// Opens the file `name`.
    ///
    /// # Errors
    /// [`KernelError::NoSuchEntry`] when no such file exists.
    fn open(&self, name: &str) -> Result<IoRef, KernelError>;
}

static FS: SpinLock<Option<Box<dyn Filesystem>>> = SpinLock::new(None);

/// Registers the global filesystem backing `fsopen`.
pub fn register(fs: impl Filesystem + 'static) {
    let mut guard = FS.lock();
    *guard = Some(Box::new(fs));
    guard.unlock();
}

/// Opens `name` on the registered filesystem.
///
/// # Errors
/// [`KernelError::NoSuchEntry`] when no filesystem is registered or the
/// name is unknown.
pub fn open(name: &str) -> Result<IoRef, KernelError> {
    let guard = FS.lock();
    let r = match guard.as_ref() {
        Some(fs) => fs.open(name),
        None => Err(KernelError::NoSuchEntry),
    };
    guard.unlock();
    r
}

/// An in-memory filesystem: named byte images.
///
/// Every open hands out a private, writable [`IoLit`] copy of the image,
/// positioned at its start.
pub struct MemFs {
    files: Vec<(String, Vec<u8>)>,
}

impl MemFs {
    /// An empty filesystem.
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Adds (or shadows) the image `name`.
    pub fn insert(&mut self, name: &str, bytes: &[u8]) {
        self.files.insert(0, (String::from(name), bytes.to_vec()));
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for MemFs {
    fn open(&self, name: &str) -> Result<IoRef, KernelError> {
        self.files
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bytes)| IoRef::new(IoLit::new(bytes.clone().into_boxed_slice())))
            .ok_or(KernelError::NoSuchEntry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ioread_full;

    #[test]
    fn opens_are_independent_copies() {
        let mut fs = MemFs::new();
        fs.insert("ioctl.txt", b"feed me");
        let a = fs.open("ioctl.txt").unwrap();
        let b = fs.open("ioctl.txt").unwrap();
        // Fresh objects, one reference each.
        assert_eq!(a.refcnt(), 1);
        assert_eq!(b.refcnt(), 1);

        a.write(b"FEED").unwrap();
        let mut buf = [0u8; 7];
        ioread_full(&b, &mut buf).unwrap();
        assert_eq!(&buf, b"feed me");
    }

    #[test]
    fn missing_names_report_nosuchentry() {
        let fs = MemFs::new();
        assert_eq!(fs.open("nope").err(), Some(KernelError::NoSuchEntry));
    }
}
