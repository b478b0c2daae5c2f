//! Line-discipline wrapper.
//!
//! `IoTerm` wraps a raw character device and provides:
//!
//! 1. Input CRLF normalization: `\r\n`, a lone `\r`, and a lone `\n` all
//!    arrive as a single `\n`.
//! 2. Output CRLF normalization: a lone `\n` or `\r` leaves as `\r\n`; an
//!    existing `\r\n` is passed through.
//! 3. Line editing: [`IoTerm::getsn`] reads one line with rub-out handling.
//!
//! Input normalization keeps one bit of state, `cr_in`. When a byte `ch`
//! arrives: if `cr_in` is clear, `\r` yields `\n` and sets it, anything else
//! passes; if set, `\r` yields `\n`, `\n` is swallowed and clears it, and
//! any other byte passes and clears it. Output keeps the mirror bit
//! `cr_out` for the `\r\n` pair it has already emitted.

use super::{IOCTL_SETPOS, Io, IoRef, iowrite};
use crate::KernelError;
use smode::spinlock::SpinLock;

struct TermState {
    cr_in: bool,
    cr_out: bool,
}

/// A CRLF-normalizing, line-editing wrapper around a raw byte device.
pub struct IoTerm {
    raw: IoRef,
    state: SpinLock<TermState>,
}

impl IoTerm {
    /// Wraps the raw device `raw`.
    pub fn new(raw: IoRef) -> Self {
        Self {
            raw,
            state: SpinLock::new(TermState {
                cr_in: false,
                cr_out: false,
            }),
        }
    }

    fn emit(&self, bytes: &[u8]) -> Result<usize, KernelError> {
        iowrite(&self.raw, bytes)
    }

    /// Reads one line into `buf` with echo and rub-out editing, returning
    /// its length. The terminator is echoed as `\r\n` and not stored.
    pub fn getsn(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut len = 0;
        loop {
            let mut byte = [0u8; 1];
            if self.read(&mut byte)? == 0 {
                // The device dried up; hand back what we have.
                return Ok(len);
            }
            match byte[0] {
                // Escape: drop any half-seen CR.
                0x1b => {
                    let mut state = self.state.lock();
                    state.cr_in = false;
                    state.unlock();
                }
                b'\n' | b'\r' => {
                    self.emit(b"\r\n")?;
                    return Ok(len);
                }
                // Backspace and delete rub out one byte.
                0x08 | 0x7f => {
                    if len > 0 {
                        len -= 1;
                        self.emit(b"\x08 \x08")?;
                    } else {
                        self.emit(b"\x07")?;
                    }
                }
                ch => {
                    if len < buf.len() {
                        buf[len] = ch;
                        len += 1;
                        self.emit(&[ch])?;
                    } else {
                        // Line full: beep.
                        self.emit(b"\x07")?;
                    }
                }
            }
        }
    }
}

impl Io for IoTerm {
    fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        loop {
            let cnt = self.raw.read(buf)?;
            if cnt == 0 {
                return Ok(0);
            }
            // Fix up line endings in place; the output never outgrows the
            // input, so a write cursor trailing the read cursor suffices.
            let mut state = self.state.lock();
            let mut wp = 0;
            for rp in 0..cnt {
                let ch = buf[rp];
                if state.cr_in {
                    match ch {
                        b'\r' => {
                            buf[wp] = b'\n';
                            wp += 1;
                        }
                        b'\n' => state.cr_in = false,
                        _ => {
                            state.cr_in = false;
                            buf[wp] = ch;
                            wp += 1;
                        }
                    }
                } else if ch == b'\r' {
                    state.cr_in = true;
                    buf[wp] = b'\n';
                    wp += 1;
                } else {
                    buf[wp] = ch;
                    wp += 1;
                }
            }
            state.unlock();
            // Everything may have been swallowed (a lone `\n` completing a
            // `\r\n`); the caller asked for at least one byte.
            if wp > 0 {
                return Ok(wp);
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let mut state = self.state.lock();
        let mut cr_out = state.cr_out;
        state.unlock();

        let mut acc = 0;
        for &ch in buf {
            let done = match ch {
                b'\r' => {
                    // Stands for a full newline on the wire.
                    cr_out = true;
                    self.emit(b"\r\n")?
                }
                b'\n' => {
                    if cr_out {
                        // Second half of a `\r\n` already emitted.
                        cr_out = false;
                        1
                    } else {
                        self.emit(b"\r\n")?
                    }
                }
                _ => {
                    cr_out = false;
                    self.emit(&[ch])?
                }
            };
            if done == 0 {
                break;
            }
            acc += 1;
        }

        let mut state = self.state.lock();
        state.cr_out = cr_out;
        state.unlock();
        Ok(acc)
    }

    fn ctl(&self, cmd: usize, arg: &mut usize) -> Result<usize, KernelError> {
        // Seeking makes no sense through the line discipline; everything
        // else belongs to the wrapped device.
        if cmd == IOCTL_SETPOS {
            return Err(KernelError::NotSupportedOperation);
        }
        self.raw.ctl(cmd, arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    /// A scripted tty: a fixed input tape and a captured output stream,
    /// kept apart the way a real UART keeps rx and tx apart.
    struct Duplex {
        input: SpinLock<(Vec<u8>, usize)>,
        output: SpinLock<Vec<u8>>,
    }

    impl Duplex {
        fn new(input: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                input: SpinLock::new((input.to_vec(), 0)),
                output: SpinLock::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<u8> {
            let out = self.output.lock();
            let v = out.clone();
            out.unlock();
            v
        }
    }

    struct DuplexPort(Arc<Duplex>);

    impl Io for DuplexPort {
        fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
            let mut input = self.0.input.lock();
            let (tape, idx) = &mut *input;
            let n = buf.len().min(tape.len() - *idx);
            buf[..n].copy_from_slice(&tape[*idx..*idx + n]);
            *idx += n;
            input.unlock();
            Ok(n)
        }

        fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
            let mut out = self.0.output.lock();
            out.extend_from_slice(buf);
            out.unlock();
            Ok(buf.len())
        }
    }

    fn term_over(input: &[u8]) -> (IoTerm, Arc<Duplex>) {
        let tty = Duplex::new(input);
        (IoTerm::new(IoRef::new(DuplexPort(tty.clone()))), tty)
    }

    fn read_all(term: &IoTerm, n: usize) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; n];
        let mut got = 0;
        while got < n {
            match term.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(k) => got += k,
                Err(_) => break,
            }
        }
        buf.truncate(got);
        buf
    }

    #[test]
    fn input_newlines_are_normalized() {
        // \r\n, lone \r, and lone \n each arrive as a single \n.
        let (term, _) = term_over(b"a\r\nb\rc\nd");
        assert_eq!(read_all(&term, 7), b"a\nb\nc\nd");
    }

    #[test]
    fn consecutive_carriage_returns_each_count() {
        let (term, _) = term_over(b"\r\r\r\n");
        assert_eq!(read_all(&term, 3), b"\n\n\n");
    }

    #[test]
    fn a_swallowed_newline_does_not_end_the_read() {
        // A one-byte read can land on the \n completing a \r\n; the wrapper
        // must go back for more rather than return zero bytes.
        let (term, _) = term_over(b"\r\nq");
        let mut one = [0u8; 1];
        assert_eq!(term.read(&mut one).unwrap(), 1);
        assert_eq!(one[0], b'\n');
        assert_eq!(term.read(&mut one).unwrap(), 1);
        assert_eq!(one[0], b'q');
    }

    #[test]
    fn output_newlines_grow_a_carriage_return() {
        let (term, tty) = term_over(b"");
        assert_eq!(term.write(b"x\ny").unwrap(), 3);
        assert_eq!(tty.sent(), b"x\r\ny");
    }

    #[test]
    fn output_crlf_is_not_doubled() {
        let (term, tty) = term_over(b"");
        assert_eq!(term.write(b"a\r\nb").unwrap(), 4);
        assert_eq!(tty.sent(), b"a\r\nb");
    }

    #[test]
    fn getsn_edits_a_line() {
        // "abX<backspace>c<CR>" becomes "abc".
        let (term, tty) = term_over(b"abX\x08c\r");
        let mut line = [0u8; 16];
        let n = term.getsn(&mut line).unwrap();
        assert_eq!(&line[..n], b"abc");
        // The rub-out echo erases the X on the wire.
        assert_eq!(tty.sent(), b"abX\x08 \x08c\r\n");
    }

    #[test]
    fn getsn_rings_the_bell_on_empty_rubout() {
        let (term, tty) = term_over(b"\x08z\n");
        let mut line = [0u8; 16];
        let n = term.getsn(&mut line).unwrap();
        assert_eq!(&line[..n], b"z");
        assert_eq!(tty.sent()[0], 0x07);
    }

    #[test]
    fn seeking_the_terminal_is_refused() {
        let (term, _) = term_over(b"");
        let mut arg = 0usize;
        assert_eq!(
            term.ctl(IOCTL_SETPOS, &mut arg),
            Err(KernelError::NotSupportedOperation)
        );
    }
}
