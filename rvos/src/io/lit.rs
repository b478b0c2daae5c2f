//! In-memory literal I/O.
//!
//! An I/O literal treats a block of memory as a file: reads and writes move
//! a position through a fixed-size buffer, and `ctl` exposes length and
//! seeking. Both transfers return the number of bytes moved; at the end of
//! the buffer they return 0 rather than failing, which is what the generic
//! full-transfer loops key on.

use super::{IOCTL_GETBLKSZ, IOCTL_GETLEN, IOCTL_GETPOS, IOCTL_SETPOS, Io};
use crate::KernelError;
use alloc::boxed::Box;
use smode::spinlock::SpinLock;

struct LitState {
    buf: Box<[u8]>,
    pos: usize,
}

/// A file-like view of a fixed-size buffer.
pub struct IoLit {
    state: SpinLock<LitState>,
}

impl IoLit {
    /// Wraps `buf` into a literal positioned at its start.
    pub fn new(buf: Box<[u8]>) -> Self {
        Self {
            state: SpinLock::new(LitState { buf, pos: 0 }),
        }
    }
}

impl Io for IoLit {
    fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.buf.len() - state.pos);
        let pos = state.pos;
        buf[..n].copy_from_slice(&state.buf[pos..pos + n]);
        state.pos += n;
        state.unlock();
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.buf.len() - state.pos);
        let pos = state.pos;
        state.buf[pos..pos + n].copy_from_slice(&buf[..n]);
        state.pos += n;
        state.unlock();
        Ok(n)
    }

    fn ctl(&self, cmd: usize, arg: &mut usize) -> Result<usize, KernelError> {
        let mut state = self.state.lock();
        let r = match cmd {
            IOCTL_GETLEN => {
                *arg = state.buf.len();
                Ok(0)
            }
            IOCTL_SETPOS => {
                if *arg > state.buf.len() {
                    Err(KernelError::InvalidArgument)
                } else {
                    state.pos = *arg;
                    Ok(0)
                }
            }
            IOCTL_GETPOS => {
                *arg = state.pos;
                Ok(0)
            }
            IOCTL_GETBLKSZ => {
                *arg = smode::addressing::PAGE_SIZE;
                Ok(0)
            }
            _ => Err(KernelError::NotSupportedOperation),
        };
        state.unlock();
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{IOCTL_GETREFCNT, IoRef, ioread_full, iowrite};
    use alloc::vec;

    fn lit(bytes: &[u8]) -> IoRef {
        IoRef::new(IoLit::new(bytes.to_vec().into_boxed_slice()))
    }

    #[test]
    fn read_advances_and_reports_bytes() {
        let io = lit(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(io.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(io.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        // End of buffer: zero bytes, not an error.
        assert_eq!(io.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_is_bounded_by_the_buffer() {
        let io = lit(&[0; 4]);
        assert_eq!(io.write(b"xyzzy").unwrap(), 4);
        assert_eq!(io.write(b"q").unwrap(), 0);

        let mut pos = 0usize;
        io.ctl(IOCTL_SETPOS, &mut pos).unwrap();
        let mut back = vec![0u8; 4];
        assert_eq!(ioread_full(&io, &mut back).unwrap(), 4);
        assert_eq!(&back, b"xyzz");
    }

    #[test]
    fn seek_bounds_are_enforced() {
        let io = lit(b"0123456789");
        let mut arg = 10usize;
        assert_eq!(io.ctl(IOCTL_SETPOS, &mut arg).unwrap(), 0);
        let mut arg = 11usize;
        assert_eq!(
            io.ctl(IOCTL_SETPOS, &mut arg),
            Err(KernelError::InvalidArgument)
        );
        let mut pos = 0usize;
        io.ctl(IOCTL_GETPOS, &mut pos).unwrap();
        assert_eq!(pos, 10);
    }

    #[test]
    fn ctl_reports_length_and_refcnt() {
        let io = lit(b"hello");
        let mut arg = 0usize;
        io.ctl(IOCTL_GETLEN, &mut arg).unwrap();
        assert_eq!(arg, 5);
        let dup = io.clone();
        io.ctl(IOCTL_GETREFCNT, &mut arg).unwrap();
        assert_eq!(arg, 2);
        drop(dup);
    }

    #[test]
    fn full_write_then_full_read_round_trips() {
        let io = lit(&[0; 8]);
        assert_eq!(iowrite(&io, b"payload!").unwrap(), 8);
        let mut pos = 0usize;
        io.ctl(IOCTL_SETPOS, &mut pos).unwrap();
        let mut back = [0u8; 8];
        assert_eq!(ioread_full(&io, &mut back).unwrap(), 8);
        assert_eq!(&back, b"payload!");
    }
}
