//! The generic I/O interface.
//!
//! Every descriptor names an **I/O object**: a polymorphic byte-oriented
//! handle with the capability set `{close, read, write, ctl}`. Objects are
//! shared by reference counting, one count per descriptor-table slot that
//! names the object across all processes, and an object lives exactly as
//! long as its longest-held descriptor.
//!
//! Concrete kinds: an in-memory literal ([`lit`]), the line-discipline
//! wrapper ([`term`]), the pipe ([`pipe`]), character devices ([`dev`]), and
//! filesystem-backed files reached through [`fs`].

pub mod dev;
pub mod fs;
pub mod lit;
pub mod pipe;
pub mod term;

use crate::KernelError;
use alloc::sync::Arc;

/// `ctl`: query the object's length (bytes stored / available).
pub const IOCTL_GETLEN: usize = 1;
/// `ctl`: set the position of a positioned object.
pub const IOCTL_SETPOS: usize = 2;
/// `ctl`: query the position of a positioned object.
pub const IOCTL_GETPOS: usize = 3;
/// `ctl`: query the preferred block size.
pub const IOCTL_GETBLKSZ: usize = 4;
/// `ctl`: query the object's reference count.
pub const IOCTL_GETREFCNT: usize = 5;

/// A polymorphic I/O object.
///
/// Implementations use interior locking: the methods take `&self`, and an
/// object that blocks (the pipe) must release its own lock around the wait.
/// Unimplemented capabilities report
/// [`KernelError::NotSupportedOperation`].
pub trait Io: Send + Sync {
    /// Reads up to `buf.len()` bytes, returning how many were transferred.
    /// `Ok(0)` signals end-of-file or no possible progress.
    fn read(&self, _buf: &mut [u8]) -> Result<usize, KernelError> {
        Err(KernelError::NotSupportedOperation)
    }

    /// Writes up to `buf.len()` bytes, returning how many were transferred.
    fn write(&self, _buf: &[u8]) -> Result<usize, KernelError> {
        Err(KernelError::NotSupportedOperation)
    }

    /// Performs a control operation. `arg` is both input and output,
    /// depending on the command.
    fn ctl(&self, _cmd: usize, _arg: &mut usize) -> Result<usize, KernelError> {
        Err(KernelError::NotSupportedOperation)
    }

    /// Called when the last reference is dropped, before the object itself
    /// is destroyed.
    fn close(&self) {}
}

/// A counted reference to an I/O object.
///
/// Cloning is how descriptor tables share objects across `fork`; the count
/// visible through [`IOCTL_GETREFCNT`] is exactly the number of live
/// references.
pub struct IoRef(Arc<dyn Io>);

impl IoRef {
    /// Wraps a fresh object into its first reference.
    pub fn new(io: impl Io + 'static) -> Self {
        Self(Arc::new(io))
    }

    /// The number of references to the underlying object.
    pub fn refcnt(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Reads from the object. See [`Io::read`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.0.read(buf)
    }

    /// Writes to the object. See [`Io::write`].
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        self.0.write(buf)
    }

    /// Performs a control operation.
    ///
    /// [`IOCTL_GETREFCNT`] is answered here, since the object cannot see
    /// its own reference count; everything else is the object's business.
    pub fn ctl(&self, cmd: usize, arg: &mut usize) -> Result<usize, KernelError> {
        if cmd == IOCTL_GETREFCNT {
            *arg = self.refcnt();
            return Ok(0);
        }
        self.0.ctl(cmd, arg)
    }
}

impl Clone for IoRef {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Drop for IoRef {
    fn drop(&mut self) {
        if Arc::strong_count(&self.0) == 1 {
            self.0.close();
        }
    }
}

/// Reads until `buf` is full, an error occurs, or the object reports no
/// progress. Returns the number of bytes actually read.
pub fn ioread_full(io: &IoRef, buf: &mut [u8]) -> Result<usize, KernelError> {
    let mut acc = 0;
    while acc < buf.len() {
        match io.read(&mut buf[acc..])? {
            0 => break,
            n => acc += n,
        }
    }
    Ok(acc)
}

/// Writes until all of `buf` is transferred, an error occurs, or the object
/// reports no progress. Returns the number of bytes actually written.
pub fn iowrite(io: &IoRef, buf: &[u8]) -> Result<usize, KernelError> {
    let mut acc = 0;
    while acc < buf.len() {
        match io.write(&buf[acc..])? {
            0 => break,
            n => acc += n,
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Yields bytes in dribs to exercise the full-transfer loops.
    struct Dribbler {
        served: AtomicUsize,
        limit: usize,
        closed: Arc<AtomicBool>,
    }

    impl Io for Dribbler {
        fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
            let served = self.served.load(Ordering::SeqCst);
            if served >= self.limit || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = served as u8;
            self.served.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }

        fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
            Ok(buf.len().min(2))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn dribbler(limit: usize) -> (IoRef, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            IoRef::new(Dribbler {
                served: AtomicUsize::new(0),
                limit,
                closed: closed.clone(),
            }),
            closed,
        )
    }

    #[test]
    fn ioread_full_loops_until_filled() {
        let (io, _) = dribbler(16);
        let mut buf = [0u8; 5];
        assert_eq!(ioread_full(&io, &mut buf).unwrap(), 5);
        assert_eq!(buf, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn ioread_full_stops_at_eof() {
        let (io, _) = dribbler(3);
        let mut buf = [0xFFu8; 8];
        assert_eq!(ioread_full(&io, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[0, 1, 2]);
    }

    #[test]
    fn iowrite_loops_over_partial_writes() {
        let (io, _) = dribbler(0);
        assert_eq!(iowrite(&io, &[9u8; 7]).unwrap(), 7);
    }

    #[test]
    fn refcnt_tracks_clones_and_close_runs_last() {
        let (io, closed) = dribbler(0);
        assert_eq!(io.refcnt(), 1);
        let dup = io.clone();
        assert_eq!(io.refcnt(), 2);

        let mut arg = 0usize;
        io.ctl(IOCTL_GETREFCNT, &mut arg).unwrap();
        assert_eq!(arg, 2);

        drop(dup);
        assert!(!closed.load(Ordering::SeqCst));
        drop(io);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn unimplemented_capabilities_report_notsup() {
        struct Mute;
        impl Io for Mute {}
        let io = IoRef::new(Mute);
        let mut arg = 0;
        assert_eq!(
            io.read(&mut []).err(),
            Some(KernelError::NotSupportedOperation)
        );
        assert_eq!(io.write(&[]).err(), Some(KernelError::NotSupportedOperation));
        assert_eq!(
            io.ctl(IOCTL_GETLEN, &mut arg).err(),
            Some(KernelError::NotSupportedOperation)
        );
    }
}
