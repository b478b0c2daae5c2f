//! System calls.
//!
//! The environment-call trap lands here with the caller's trap frame. The
//! ABI follows the platform convention: the syscall number rides in `a7`,
//! arguments in `a0..a5`, and the result replaces `a0`: a non-negative
//! value on success, a negative [`KernelError`] code on failure.
//!
//! Every handler that receives a user pointer validates it through
//! [`uaccess`] (or the address-space checks behind it) before dereferencing.

pub mod uaccess;

use crate::io::{IOCTL_SETPOS, IoRef, dev, fs, pipe::Pipe};
use crate::thread::with_current_process;
use crate::{KernelError, process};
use smode::addressing::Va;
use smode::trap::TrapFrame;
use uaccess::{UserCString, UserPtrRO, UserPtrWO};

/// The system call numbers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Print a NUL-terminated message to the console.
    Msgout = 0,
    /// Terminate the calling process.
    Exit = 1,
    /// Open a device into a chosen descriptor.
    Devopen = 2,
    /// Open a file into a chosen descriptor.
    Fsopen = 3,
    /// Close a descriptor.
    Close = 4,
    /// Read from a descriptor.
    Read = 5,
    /// Write to a descriptor.
    Write = 6,
    /// Control operation on a descriptor.
    Ioctl = 7,
    /// Replace the process image with the ELF behind a descriptor.
    Exec = 8,
    /// Duplicate the calling process.
    Fork = 9,
    /// Wait for a child process (0 waits for any).
    Wait = 10,
    /// Create a pipe at a chosen descriptor.
    Pipe = 11,
}

impl TryFrom<usize> for SyscallNumber {
    type Error = KernelError;

    fn try_from(v: usize) -> Result<Self, KernelError> {
        Ok(match v {
            0 => Self::Msgout,
            1 => Self::Exit,
            2 => Self::Devopen,
            3 => Self::Fsopen,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Ioctl,
            8 => Self::Exec,
            9 => Self::Fork,
            10 => Self::Wait,
            11 => Self::Pipe,
            _ => return Err(KernelError::NoSuchSyscall),
        })
    }
}

/// The decoded system-call ABI: number, arguments, and the frame the result
/// goes back into.
pub struct SyscallAbi<'a> {
    /// The system call number (`a7`).
    pub sysno: usize,
    /// First argument (`a0`).
    pub arg1: usize,
    /// Second argument (`a1`).
    pub arg2: usize,
    /// Third argument (`a2`).
    pub arg3: usize,
    /// The caller's trap frame.
    pub regs: &'a mut TrapFrame,
}

impl<'a> SyscallAbi<'a> {
    /// Decodes the ABI out of a trap frame.
    pub fn from_frame(regs: &'a mut TrapFrame) -> Self {
        Self {
            sysno: regs.sysno(),
            arg1: regs.arg(0),
            arg2: regs.arg(1),
            arg3: regs.arg(2),
            regs,
        }
    }

    /// Folds the handler's result into the return-value register.
    pub fn set_return_value(self, ret: Result<usize, KernelError>) {
        *self.regs.a0_mut() = match ret {
            Ok(v) => v,
            Err(e) => e.into_usize(),
        };
    }
}

/// Handles one environment call. `sepc` has already been advanced.
pub(crate) fn handle_syscall(frame: &mut TrapFrame) {
    let abi = SyscallAbi::from_frame(frame);
    let ret = match SyscallNumber::try_from(abi.sysno) {
        Ok(SyscallNumber::Msgout) => sys_msgout(&abi),
        Ok(SyscallNumber::Exit) => process::exit(),
        Ok(SyscallNumber::Devopen) => sys_devopen(&abi),
        Ok(SyscallNumber::Fsopen) => sys_fsopen(&abi),
        Ok(SyscallNumber::Close) => with_current_process(|p| p.close(abi.arg1).map(|()| 0)),
        Ok(SyscallNumber::Read) => sys_read(&abi),
        Ok(SyscallNumber::Write) => sys_write(&abi),
        Ok(SyscallNumber::Ioctl) => sys_ioctl(&abi),
        Ok(SyscallNumber::Exec) => sys_exec(&abi),
        Ok(SyscallNumber::Fork) => process::fork(&*abi.regs),
        Ok(SyscallNumber::Wait) => process::wait(abi.arg1),
        Ok(SyscallNumber::Pipe) => sys_pipe(&abi),
        Err(e) => Err(e),
    };
    abi.set_return_value(ret);
}

fn sys_msgout(abi: &SyscallAbi<'_>) -> Result<usize, KernelError> {
    let msg = UserCString::new(abi.arg1).read()?;
    let name = crate::thread::with_current(|th| th.name.clone());
    println!("{}: {}", name, msg);
    Ok(0)
}

fn sys_devopen(abi: &SyscallAbi<'_>) -> Result<usize, KernelError> {
    let fd = abi.arg1;
    let name = UserCString::new(abi.arg2).read()?;
    let io = dev::open(&name, abi.arg3)?;
    with_current_process(|p| p.install_at(fd, io).map(|()| 0))
}

fn sys_fsopen(abi: &SyscallAbi<'_>) -> Result<usize, KernelError> {
    let fd = abi.arg1;
    let name = UserCString::new(abi.arg2).read()?;
    let io = fs::open(&name)?;
    with_current_process(|p| p.install_at(fd, io).map(|()| 0))
}

/// Checks a user buffer and hands the matching slice to `f`.
///
/// The slice aliases user memory in the current (active) address space;
/// validation happened the moment before, and with one thread per process
/// it stays stable across a blocking `f`.
fn with_user_buffer<R>(
    ptr: usize,
    len: usize,
    writable: bool,
    f: impl FnOnce(&mut crate::process::Process, &mut [u8]) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    with_current_process(|p| {
        let lo = Va::new(ptr).ok_or(KernelError::BadAddress)?;
        let hi = ptr
            .checked_add(len)
            .and_then(Va::new)
            .ok_or(KernelError::BadAddress)?;
        if !p.space.access_ok(lo..hi, writable) {
            return Err(KernelError::BadAddress);
        }
        let buf = unsafe { uaccess::user_bytes_mut(ptr, len) };
        f(p, buf)
    })
}

fn sys_read(abi: &SyscallAbi<'_>) -> Result<usize, KernelError> {
    let (fd, ptr, n) = (abi.arg1, abi.arg2, abi.arg3);
    if n == 0 {
        return Ok(0);
    }
    with_user_buffer(ptr, n, true, |p, buf| p.get(fd)?.read(buf))
}

fn sys_write(abi: &SyscallAbi<'_>) -> Result<usize, KernelError> {
    let (fd, ptr, n) = (abi.arg1, abi.arg2, abi.arg3);
    if n == 0 {
        return Ok(0);
    }
    with_user_buffer(ptr, n, false, |p, buf| p.get(fd)?.write(buf))
}

fn sys_ioctl(abi: &SyscallAbi<'_>) -> Result<usize, KernelError> {
    let (fd, cmd, argp) = (abi.arg1, abi.arg2, abi.arg3);
    let mut arg = UserPtrRO::<usize>::new(argp).get()?;
    let ret = with_current_process(|p| p.get(fd)?.ctl(cmd, &mut arg))?;
    if cmd != IOCTL_SETPOS {
        UserPtrWO::<usize>::new(argp).put(arg)?;
    }
    Ok(ret)
}

fn sys_exec(abi: &SyscallAbi<'_>) -> Result<usize, KernelError> {
    let io: IoRef = with_current_process(|p| Ok(p.get(abi.arg1)?.clone()))?;
    let image = crate::loader::load(&io)?;
    drop(io);
    process::exec_image(image).map(|never| match never {})
}

fn sys_pipe(abi: &SyscallAbi<'_>) -> Result<usize, KernelError> {
    with_current_process(|p| p.install_at(abi.arg1, IoRef::new(Pipe::new())).map(|()| 0))
}
