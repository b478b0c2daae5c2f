//! Processes.
//!
//! A process is a user address space plus a table of open I/O objects,
//! owned by the one thread that executes it. Process identifiers coincide
//! with the owning thread's id; the process table tracks which ids are live
//! and bounds how many processes exist at once.
//!
//! `fork` duplicates everything the spec of a process consists of: the user
//! address space (physically, page by page), the descriptor table (sharing
//! the objects, bumping their reference counts), and the in-flight trap
//! frame via the kernel-stack clone in
//! [`fork_to_user`](crate::thread::fork_to_user).

use crate::io::IoRef;
use crate::mm::page_table::Permission;
use crate::mm::{MemorySpace, USER_HI};
use crate::thread::{self, Tid};
use crate::{KernelError, loader};
use alloc::boxed::Box;
use core::convert::Infallible;
use smode::addressing::Va;
use smode::spinlock::SpinLock;
use smode::trap::TrapFrame;

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// Number of descriptor slots per process.
pub const NOFILE: usize = 16;

/// A process identifier. Coincides with the id of the process's thread.
pub type Pid = Tid;

/// Eagerly mapped user stack: 4 pages below [`USER_HI`].
const USER_STACK_EAGER: usize = 4 * 0x1000;

/// Demand-mapped stack growth region below the eager part.
const USER_STACK_LAZY: usize = 60 * 0x1000;

static PROCTAB: SpinLock<[Option<Pid>; NPROC]> = SpinLock::new([None; NPROC]);

pub(crate) fn register_pid(pid: Pid) -> Result<(), KernelError> {
    let mut tab = PROCTAB.lock();
    let slot = tab.iter_mut().find(|s| s.is_none());
    let r = match slot {
        Some(s) => {
            *s = Some(pid);
            Ok(())
        }
        None => Err(KernelError::TryAgain),
    };
    tab.unlock();
    r
}

pub(crate) fn unregister_pid(pid: Pid) {
    let mut tab = PROCTAB.lock();
    for slot in tab.iter_mut() {
        if *slot == Some(pid) {
            *slot = None;
        }
    }
    tab.unlock();
}

/// A user process: an address space and an open-object table.
pub struct Process {
    /// The process id.
    pub pid: Pid,
    /// The user address space.
    pub space: MemorySpace,
    files: [Option<IoRef>; NOFILE],
}

impl Process {
    /// Creates a process with a fresh, empty address space and no open
    /// descriptors.
    pub fn new(pid: Pid) -> Result<Box<Self>, KernelError> {
        Ok(Box::new(Self {
            pid,
            space: MemorySpace::new()?,
            files: [const { None }; NOFILE],
        }))
    }

    /// Installs `io` at the lowest free descriptor.
    ///
    /// # Errors
    /// [`KernelError::TooManyOpenFile`] when every slot is taken.
    pub fn install(&mut self, io: IoRef) -> Result<usize, KernelError> {
        match self.files.iter().position(|f| f.is_none()) {
            Some(fd) => {
                self.files[fd] = Some(io);
                Ok(fd)
            }
            None => Err(KernelError::TooManyOpenFile),
        }
    }

    /// Installs `io` at descriptor `fd`.
    ///
    /// # Errors
    /// - [`KernelError::BadFileDescriptor`]: `fd` out of range.
    /// - [`KernelError::Busy`]: the slot is occupied.
    pub fn install_at(&mut self, fd: usize, io: IoRef) -> Result<(), KernelError> {
        let slot = self
            .files
            .get_mut(fd)
            .ok_or(KernelError::BadFileDescriptor)?;
        if slot.is_some() {
            return Err(KernelError::Busy);
        }
        *slot = Some(io);
        Ok(())
    }

    /// The object behind descriptor `fd`.
    ///
    /// # Errors
    /// [`KernelError::BadFileDescriptor`] when the slot is out of range or
    /// unused.
    pub fn get(&self, fd: usize) -> Result<&IoRef, KernelError> {
        self.files
            .get(fd)
            .and_then(|f| f.as_ref())
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Closes descriptor `fd`, dropping the table's reference.
    pub fn close(&mut self, fd: usize) -> Result<(), KernelError> {
        self.files
            .get_mut(fd)
            .and_then(|f| f.take())
            .map(drop)
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Copies the descriptor table for a child, bumping every object's
    /// reference count.
    fn duplicate_files(&self) -> [Option<IoRef>; NOFILE] {
        core::array::from_fn(|i| self.files[i].clone())
    }
}

/// Forks the calling process.
///
/// The child gets a physical copy of the user address space, a copy of the
/// descriptor table sharing the parent's objects, and a cloned kernel stack.
/// Returns the child's pid to the parent; the child observes `0` out of the
/// same syscall.
///
/// # Errors
/// - [`KernelError::TryAgain`]: out of thread or process slots.
/// - [`KernelError::NoMemory`]: the address-space copy ran out of pages.
pub fn fork(tfr: &TrapFrame) -> Result<usize, KernelError> {
    let child = thread::with_current_process(|p| {
        Ok(Box::new(Process {
            pid: 0, // assigned once the thread slot is known
            space: p.space.try_clone()?,
            files: p.duplicate_files(),
        }))
    })?;
    thread::fork_to_user(child, tfr)
}

/// Replaces the calling process's user image with the ELF in `io` and
/// enters it. Only returns on failure.
pub fn exec(io: &IoRef) -> Result<Infallible, KernelError> {
    let image = loader::load(io)?;
    exec_image(image)
}

/// Installs a loaded image and enters user mode. Only returns on failure.
pub(crate) fn exec_image(image: loader::LoadedImage) -> Result<Infallible, KernelError> {
    let mut space = image.space;
    let stack_perm = Permission::READ | Permission::WRITE | Permission::USER;
    space.alloc_and_map_range(
        Va::new(USER_HI - USER_STACK_EAGER).unwrap(),
        USER_STACK_EAGER,
        stack_perm,
    )?;
    space.declare_lazy_range(
        Va::new(USER_HI - USER_STACK_EAGER - USER_STACK_LAZY).unwrap(),
        USER_STACK_LAZY,
        stack_perm,
    )?;

    thread::with_current_process(move |p| {
        let old = core::mem::replace(&mut p.space, space);
        p.space.switch_to();
        old.reclaim();
        Ok(())
    })?;
    thread::jump_to_user(USER_HI, image.entry)
}

/// Spawns a thread that becomes a user process running the ELF in `io`.
///
/// This is how the boot hook starts `init`: the image is loaded on the new
/// thread, so a malformed image costs only that thread.
pub fn spawn_user(name: &str, io: IoRef) -> Result<Tid, KernelError> {
    thread::spawn(name, move || {
        let pid = thread::running_thread();
        let started: Result<(), KernelError> = register_pid(pid).and_then(|()| {
            let proc = Process::new(pid)?;
            thread::thread_set_process(pid, proc)?;
            let image = loader::load(&io)?;
            drop(io);
            exec_image(image).map(|never| match never {})
        });
        if let Err(e) = started {
            warning!("failed to start user program: {:?}", e);
            exit();
        }
    })
}

/// Terminates the calling process: releases every descriptor, reclaims the
/// address space, and exits the thread.
pub fn exit() -> ! {
    let space = thread::with_current(|th| th.process.take()).map(|p| {
        unregister_pid(p.pid);
        // Dropping the table releases every descriptor reference.
        let Process { space, .. } = *p;
        space
    });
    if let Some(space) = space {
        // The space must not be active while it is torn down.
        crate::mm::switch_to_kernel_space();
        space.reclaim();
    }
    thread::exit()
}

/// Waits for a child to exit and returns its id. `tid` 0 waits for any
/// child.
///
/// # Errors
/// - [`KernelError::NoChild`]: nothing to wait for.
/// - [`KernelError::InvalidArgument`]: `tid` out of range.
pub fn wait(tid: usize) -> Result<usize, KernelError> {
    if tid == 0 {
        if !thread::has_children(thread::running_thread()) {
            return Err(KernelError::NoChild);
        }
        Ok(thread::join_any())
    } else {
        thread::join(tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lit::IoLit;

    fn some_io() -> IoRef {
        IoRef::new(IoLit::new(alloc::vec![0u8; 16].into_boxed_slice()))
    }

    fn proc() -> Box<Process> {
        Process::new(1).unwrap()
    }

    #[test]
    fn descriptors_fill_lowest_first() {
        let mut p = proc();
        assert_eq!(p.install(some_io()).unwrap(), 0);
        assert_eq!(p.install(some_io()).unwrap(), 1);
        p.close(0).unwrap();
        assert_eq!(p.install(some_io()).unwrap(), 0);
    }

    #[test]
    fn table_is_bounded() {
        let mut p = proc();
        for _ in 0..NOFILE {
            p.install(some_io()).unwrap();
        }
        assert_eq!(p.install(some_io()), Err(KernelError::TooManyOpenFile));
    }

    #[test]
    fn install_at_respects_occupancy() {
        let mut p = proc();
        p.install_at(3, some_io()).unwrap();
        assert_eq!(p.install_at(3, some_io()), Err(KernelError::Busy));
        assert_eq!(
            p.install_at(NOFILE, some_io()),
            Err(KernelError::BadFileDescriptor)
        );
        assert!(p.get(3).is_ok());
        assert_eq!(p.get(4).err(), Some(KernelError::BadFileDescriptor));
    }

    #[test]
    fn close_rejects_unused_slots() {
        let mut p = proc();
        assert_eq!(p.close(0), Err(KernelError::BadFileDescriptor));
        p.install(some_io()).unwrap();
        p.close(0).unwrap();
        assert_eq!(p.close(0), Err(KernelError::BadFileDescriptor));
    }

    #[test]
    fn duplicated_tables_share_objects() {
        // The refcount-across-fork invariant, at the table level: one count
        // per descriptor slot, across all copies of the table.
        let mut parent = proc();
        let fd = parent.install(some_io()).unwrap();
        assert_eq!(parent.get(fd).unwrap().refcnt(), 1);

        let child_files = parent.duplicate_files();
        assert_eq!(parent.get(fd).unwrap().refcnt(), 2);

        drop(child_files);
        assert_eq!(parent.get(fd).unwrap().refcnt(), 1);
    }
}
