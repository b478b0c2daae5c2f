//! Threads.
//!
//! A thread is the unit of kernel execution: one kernel stack, one saved
//! register context, and a slot in the fixed-size thread table. The table
//! has [`NTHR`] slots with dense ids; the main thread occupies slot 0 and
//! the idle thread the last slot, for the lifetime of the system.
//!
//! The current thread is always reachable through the `tp` register, and
//! every thread's kernel stack carries a [`StackAnchor`] at its top so the
//! trap path can recover `tp` when entering from user mode.
//!
//! Blocking is built from [`Condition`]: a wait-list with broadcast wakeup
//! and no stored predicate, so waiters re-check their condition on wake.

pub mod scheduler;

use crate::KernelError;
use crate::mm::Page;
use crate::process::Process;
use alloc::{boxed::Box, collections::VecDeque, string::String};
use core::mem::size_of;
use smode::addressing::PAGE_SIZE;
use smode::context::ThreadContext;
use smode::interrupt::InterruptGuard;
use smode::spinlock::{SpinLock, SpinLockGuard};
use smode::trap::TrapFrame;

/// Maximum number of threads.
pub const NTHR: usize = 16;

/// Thread id of the main thread.
pub const MAIN_TID: Tid = 0;

/// Thread id of the idle thread.
pub const IDLE_TID: Tid = NTHR - 1;

/// A thread identifier: a dense index into the thread table.
pub type Tid = usize;

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Slot claimed, thread not yet runnable.
    Uninit,
    /// Suspended indefinitely; not waiting on any condition.
    Stopped,
    /// Waiting on a condition.
    Waiting,
    /// Executing on the CPU.
    Running,
    /// Runnable; queued on the ready list.
    Ready,
    /// Finished; waiting to be reaped by its parent.
    Exited,
}

impl ThreadState {
    /// The state's name, for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ThreadState::Uninit => "UNINIT",
            ThreadState::Stopped => "STOPPED",
            ThreadState::Waiting => "WAITING",
            ThreadState::Running => "RUNNING",
            ThreadState::Ready => "READY",
            ThreadState::Exited => "EXITED",
        }
    }
}

/// The record at the top of every kernel stack.
///
/// The trap vector reads the back-pointer at offset 0 to recover the current
/// thread when entering from user mode, and the trap frame is built
/// immediately below this record.
#[repr(C)]
pub struct StackAnchor {
    /// Back-pointer to the owning thread.
    pub thread: *mut Thread,
    /// Reserved; keeps the anchor 16 bytes.
    pub reserved: usize,
}

/// A thread of kernel execution.
#[repr(C)]
pub struct Thread {
    // Must stay the first field: the switch primitives address the context
    // at offset 0 of the thread pointer.
    pub(crate) context: ThreadContext,
    /// This thread's id.
    pub tid: Tid,
    /// This thread's name.
    pub name: String,
    pub(crate) state: ThreadState,
    pub(crate) parent: Tid,
    pub(crate) process: Option<Box<Process>>,
    pub(crate) stack: Option<Page>,
    pub(crate) stack_base: usize,
    /// Broadcast whenever one of this thread's children exits.
    pub child_exit: Condition,
    entry: Option<Box<dyn FnOnce() + Send>>,
}

impl Thread {
    pub(crate) fn new(tid: Tid, name: &str, parent: Tid) -> Self {
        Self {
            context: ThreadContext::zeroed(),
            tid,
            name: String::from(name),
            state: ThreadState::Uninit,
            parent,
            process: None,
            stack: None,
            stack_base: 0,
            child_exit: Condition::new(),
            entry: None,
        }
    }

    fn give_stack(&mut self, stack: Page) {
        self.stack_base = stack.kva().into_usize() + PAGE_SIZE - size_of::<StackAnchor>();
        self.context.sp = self.stack_base;
        self.stack = Some(stack);
    }

    /// Writes the stack anchor once the thread has its final address.
    ///
    /// # Safety
    /// `this` must be the stable address of the installed thread, and the
    /// stack must be live.
    unsafe fn write_anchor(this: *mut Thread) {
        unsafe {
            let base = (*this).stack_base;
            core::ptr::write(
                base as *mut StackAnchor,
                StackAnchor {
                    thread: this,
                    reserved: 0,
                },
            );
        }
    }
}

pub(crate) struct ThreadTable {
    slots: [Option<Box<Thread>>; NTHR],
}

impl ThreadTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { None }; NTHR],
        }
    }

    fn free_slot(&self) -> Option<Tid> {
        (1..NTHR).find(|&tid| self.slots[tid].is_none())
    }

    fn install(&mut self, th: Box<Thread>) -> *mut Thread {
        let tid = th.tid;
        debug_assert!(self.slots[tid].is_none(), "thread slot {tid} occupied");
        self.slots[tid] = Some(th);
        self.slots[tid].as_mut().unwrap().as_mut() as *mut Thread
    }

    fn get_ptr(&mut self, tid: Tid) -> Option<*mut Thread> {
        self.slots
            .get_mut(tid)?
            .as_mut()
            .map(|th| th.as_mut() as *mut Thread)
    }

    fn slot(&self, tid: Tid) -> Option<&Thread> {
        self.slots.get(tid)?.as_deref()
    }

    /// Reclaims an exited thread's slot and reparents its children to its
    /// parent, so no parent link ever dangles.
    fn recycle(&mut self, tid: Tid) {
        let th = self.slots[tid].take().expect("recycling an empty slot");
        assert_eq!(th.state, ThreadState::Exited, "recycling a live thread");
        for slot in self.slots.iter_mut().flatten() {
            if slot.parent == tid {
                slot.parent = th.parent;
            }
        }
    }

    fn exited_child_of(&self, parent: Tid) -> Option<Tid> {
        self.slots.iter().flatten().find_map(|th| {
            (th.parent == parent && th.tid != parent && th.state == ThreadState::Exited)
                .then_some(th.tid)
        })
    }

    fn has_child(&self, parent: Tid) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|th| th.parent == parent && th.tid != parent)
    }
}

pub(crate) static THRTAB: SpinLock<ThreadTable> = SpinLock::new(ThreadTable::new());

/// The current thread, through `tp`.
pub(crate) fn current() -> *mut Thread {
    let ptr = smode::csr::read_tp() as *mut Thread;
    debug_assert!(!ptr.is_null(), "thread manager not initialized");
    ptr
}

/// Runs `f` with the current thread.
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    unsafe { f(&mut *current()) }
}

/// The id of the running thread.
pub fn running_thread() -> Tid {
    with_current(|th| th.tid)
}

/// The name of thread `tid`, if the slot is live.
pub fn thread_name(tid: Tid) -> Option<String> {
    let tab = THRTAB.lock();
    let name = tab.slot(tid).map(|th| th.name.clone());
    tab.unlock();
    name
}

/// Runs `f` with thread `tid`'s process, if the slot is live.
pub fn thread_process<R>(tid: Tid, f: impl FnOnce(Option<&mut Process>) -> R) -> Option<R> {
    let mut tab = THRTAB.lock();
    let ptr = tab.get_ptr(tid);
    tab.unlock();
    ptr.map(|p| unsafe { f((*p).process.as_deref_mut()) })
}

/// Attaches a process to thread `tid`.
pub fn thread_set_process(tid: Tid, proc: Box<Process>) -> Result<(), KernelError> {
    let mut tab = THRTAB.lock();
    let ptr = tab.get_ptr(tid);
    tab.unlock();
    match ptr {
        Some(p) => {
            unsafe { (*p).process = Some(proc) };
            Ok(())
        }
        None => Err(KernelError::InvalidArgument),
    }
}

/// Runs `f` with the current thread's process.
///
/// # Errors
/// [`KernelError::OperationNotPermitted`] when the current thread has no
/// process.
pub fn with_current_process<R>(
    f: impl FnOnce(&mut Process) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    with_current(|th| match th.process.as_deref_mut() {
        Some(p) => f(p),
        None => Err(KernelError::OperationNotPermitted),
    })
}

pub(crate) fn has_children(tid: Tid) -> bool {
    let tab = THRTAB.lock();
    let r = tab.has_child(tid);
    tab.unlock();
    r
}

/// Initializes the thread manager: the main thread (slot 0, running on the
/// boot stack) and the idle thread (last slot).
pub fn init() {
    let mut tab = THRTAB.lock();

    let mut main = Box::new(Thread::new(MAIN_TID, "main", MAIN_TID));
    main.state = ThreadState::Running;
    let main_ptr = tab.install(main);

    let mut idle = Box::new(Thread::new(IDLE_TID, "idle", MAIN_TID));
    idle.entry = Some(Box::new(scheduler::idle_loop));
    idle.give_stack(Page::new().expect("no memory for the idle stack"));
    idle.context.ra = thread_start as usize;
    idle.state = ThreadState::Ready;
    let idle_ptr = tab.install(idle);
    unsafe { Thread::write_anchor(idle_ptr) };

    tab.unlock();
    scheduler::ready_push(IDLE_TID);
    unsafe { smode::csr::write_tp(main_ptr as usize) };
}

/// The first frame of every spawned thread.
extern "C" fn thread_start() -> ! {
    let f = with_current(|th| th.entry.take()).expect("thread started without an entry");
    f();
    exit()
}

/// Spawns a kernel thread running `f`, as a child of the caller.
///
/// # Errors
/// - [`KernelError::TryAgain`]: no free slot in the thread table.
/// - [`KernelError::NoMemory`]: no page for the kernel stack.
pub fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<Tid, KernelError> {
    let mut th = Box::new(Thread::new(0, name, running_thread()));
    th.entry = Some(Box::new(f));
    th.give_stack(Page::new()?);
    th.context.ra = thread_start as usize;
    th.state = ThreadState::Ready;

    let mut tab = THRTAB.lock();
    let Some(tid) = tab.free_slot() else {
        tab.unlock();
        return Err(KernelError::TryAgain);
    };
    th.tid = tid;
    let ptr = tab.install(th);
    unsafe { Thread::write_anchor(ptr) };
    tab.unlock();

    scheduler::ready_push(tid);
    debug!("spawned thread {} \"{}\"", tid, thread_name(tid).unwrap());
    Ok(tid)
}

/// Terminates the calling thread.
///
/// Broadcasts the parent's [`Thread::child_exit`] condition and never
/// returns. The main thread exiting powers the machine off.
pub fn exit() -> ! {
    let (tid, parent) = with_current(|th| (th.tid, th.parent));
    if tid == MAIN_TID {
        info!("main thread exited; powering off");
        smode::csr::halt_success();
    }
    with_current(|th| th.state = ThreadState::Exited);

    let parent_ptr = {
        let mut tab = THRTAB.lock();
        let p = tab.get_ptr(parent).expect("exiting thread has no live parent");
        tab.unlock();
        p
    };
    unsafe { &(*parent_ptr).child_exit }.broadcast();

    scheduler::suspend_self();
    unreachable!("an exited thread was rescheduled")
}

/// Waits for child `tid` to exit, then reclaims its slot.
///
/// # Errors
/// - [`KernelError::InvalidArgument`]: `tid` out of range.
/// - [`KernelError::NoChild`]: `tid` is not a live child of the caller.
pub fn join(tid: Tid) -> Result<Tid, KernelError> {
    if tid == 0 || tid >= NTHR {
        return Err(KernelError::InvalidArgument);
    }
    let me = running_thread();
    loop {
        let state = {
            let tab = THRTAB.lock();
            let state = match tab.slot(tid) {
                Some(th) if th.parent == me => Ok(th.state),
                _ => Err(KernelError::NoChild),
            };
            tab.unlock();
            state?
        };
        if state == ThreadState::Exited {
            break;
        }
        unsafe { &(*current()).child_exit }.wait();
    }
    let mut tab = THRTAB.lock();
    tab.recycle(tid);
    tab.unlock();
    Ok(tid)
}

/// Waits for any child to exit and reclaims exactly one.
///
/// Already-exited children are reaped without blocking. Panics when called
/// by a childless thread; a syscall must check first.
pub fn join_any() -> Tid {
    let me = running_thread();
    {
        let tab = THRTAB.lock();
        let exited = tab.exited_child_of(me);
        let childless = !tab.has_child(me);
        tab.unlock();
        if let Some(tid) = exited {
            return join(tid).expect("exited child vanished");
        }
        if childless {
            panic!("join_any called by a childless thread");
        }
    }
    unsafe { &(*current()).child_exit }.wait();

    let mut tab = THRTAB.lock();
    let tid = tab
        .exited_child_of(me)
        .expect("spurious child_exit broadcast");
    tab.recycle(tid);
    tab.unlock();
    tid
}

/// Creates the child thread of a `fork` and switches execution to it.
///
/// The child gets a fresh kernel stack holding a byte-for-byte copy of the
/// in-use portion of the parent's stack (the trap frame included), and
/// resumes from this very call via the half context switch. Both the child
/// (immediately) and the parent (when next scheduled) return the child's id;
/// the child's own trap frame is patched so that its `sret` delivers 0.
pub(crate) fn fork_to_user(
    mut child_proc: Box<Process>,
    parent_tfr: &TrapFrame,
) -> Result<Tid, KernelError> {
    let me = running_thread();
    let stack = Page::new()?;

    let mut tab = THRTAB.lock();
    let Some(tid) = tab.free_slot() else {
        tab.unlock();
        return Err(KernelError::TryAgain);
    };
    if let Err(e) = crate::process::register_pid(tid) {
        tab.unlock();
        return Err(e);
    }
    child_proc.pid = tid;

    let mut th = Box::new(Thread::new(tid, "forked", me));
    th.give_stack(stack);
    th.process = Some(child_proc);
    th.state = ThreadState::Running;
    let child = tab.install(th);
    unsafe { Thread::write_anchor(child) };

    // The parent steps aside for the child.
    unsafe { (*current()).state = ThreadState::Ready };
    tab.unlock();
    scheduler::ready_push(me);

    unsafe {
        // Interrupts stay off from here until the child's sret (or the
        // parent's trap return) re-enables them; a trap between the stack
        // snapshot and the switch would invalidate the copy.
        smode::csr::disable_interrupts();
        (*child).process.as_ref().unwrap().space.switch_to();

        let sp = smode::csr::read_sp();
        let parent_base = (*current()).stack_base;
        let used = parent_base - sp;
        let child_base = (*child).stack_base;
        let child_ksp = child_base - used;
        core::ptr::copy_nonoverlapping(sp as *const u8, child_ksp as *mut u8, used);

        smode::context::_thread_finish_fork(
            child as *mut u8,
            child_ksp,
            parent_tfr as *const TrapFrame as *const u8,
        );
    }

    // Two threads run the rest of this function: the child right away on
    // its cloned stack, the parent when it is next scheduled.
    if running_thread() == tid {
        let base = with_current(|th| th.stack_base);
        let tf = (base - size_of::<TrapFrame>()) as *mut TrapFrame;
        unsafe { *(*tf).a0_mut() = 0 };
    }
    Ok(tid)
}

/// Enters user mode at `upc` with user stack `usp`. Never returns.
pub fn jump_to_user(usp: usize, upc: usize) -> ! {
    let base = with_current(|th| th.stack_base);
    assert_ne!(base, 0, "jump_to_user from a thread without a kernel stack");
    unsafe {
        smode::csr::disable_interrupts();
        smode::context::_thread_finish_jump(base as *const u8, usp, upc)
    }
}

/// A condition: a wait-queue with broadcast semantics.
///
/// No predicate is stored; a woken waiter must re-check its own predicate.
pub struct Condition {
    waiters: SpinLock<VecDeque<Tid>>,
}

impl Condition {
    /// Creates a condition with no waiters.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Blocks the calling thread until the next [`broadcast`].
    ///
    /// [`broadcast`]: Self::broadcast
    pub fn wait(&self) {
        let cur = current();
        {
            let ig = InterruptGuard::new();
            unsafe {
                assert_eq!((*cur).state, ThreadState::Running);
                (*cur).state = ThreadState::Waiting;
                let mut q = self.waiters.lock();
                q.push_back((*cur).tid);
                q.unlock();
            }
            drop(ig);
        }
        scheduler::suspend_self();
    }

    /// Blocks like [`wait`], releasing `guard` only after the caller is on
    /// the wait list, so the wakeup cannot be lost in between. The caller
    /// re-acquires the lock and re-checks its predicate on wake.
    ///
    /// [`wait`]: Self::wait
    pub fn wait_releasing<T>(&self, guard: SpinLockGuard<'_, T>) {
        let cur = current();
        {
            let ig = InterruptGuard::new();
            unsafe {
                assert_eq!((*cur).state, ThreadState::Running);
                (*cur).state = ThreadState::Waiting;
                let mut q = self.waiters.lock();
                q.push_back((*cur).tid);
                q.unlock();
            }
            guard.unlock();
            drop(ig);
        }
        scheduler::suspend_self();
    }

    /// Wakes every waiter, preserving their wait order on the ready list.
    pub fn broadcast(&self) {
        let mut q = self.waiters.lock();
        if q.is_empty() {
            q.unlock();
            return;
        }
        let ig = InterruptGuard::new();
        let mut tab = THRTAB.lock();
        for tid in q.drain(..) {
            let th = tab.get_ptr(tid).expect("waiter not in the thread table");
            unsafe {
                assert_eq!((*th).state, ThreadState::Waiting);
                (*th).state = ThreadState::Ready;
            }
            scheduler::ready_push(tid);
        }
        tab.unlock();
        drop(ig);
        q.unlock();
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(tid: Tid, parent: Tid) -> Box<Thread> {
        let mut th = Box::new(Thread::new(tid, "t", parent));
        th.state = ThreadState::Exited;
        th
    }

    #[test]
    fn slots_are_dense_and_bounded() {
        let mut tab = ThreadTable::new();
        // Slot 0 is the main thread's; allocation starts at 1.
        for expect in 1..NTHR {
            let tid = tab.free_slot().unwrap();
            assert_eq!(tid, expect);
            tab.install(Box::new(Thread::new(tid, "t", MAIN_TID)));
        }
        assert_eq!(tab.free_slot(), None);
    }

    #[test]
    fn recycle_reparents_grandchildren() {
        let mut tab = ThreadTable::new();
        // main(0) -> parent(1) -> child(2)
        tab.install(exited(1, MAIN_TID));
        tab.install(Box::new(Thread::new(2, "grandchild", 1)));
        tab.recycle(1);
        assert!(tab.slot(1).is_none());
        assert_eq!(tab.slot(2).unwrap().parent, MAIN_TID);
        // The freed slot is reusable.
        assert_eq!(tab.free_slot(), Some(1));
    }

    #[test]
    fn finds_exited_children_only() {
        let mut tab = ThreadTable::new();
        tab.install(Box::new(Thread::new(1, "live", MAIN_TID)));
        assert_eq!(tab.exited_child_of(MAIN_TID), None);
        assert!(tab.has_child(MAIN_TID));
        tab.install(exited(2, MAIN_TID));
        tab.install(exited(3, 1));
        assert_eq!(tab.exited_child_of(MAIN_TID), Some(2));
        assert_eq!(tab.exited_child_of(1), Some(3));
    }

    #[test]
    fn anchor_sits_at_the_stack_top() {
        let mut th = Thread::new(5, "t", MAIN_TID);
        th.give_stack(Page::new().unwrap());
        let stack_lo = th.stack.as_ref().unwrap().kva().into_usize();
        assert_eq!(
            th.stack_base,
            stack_lo + PAGE_SIZE - size_of::<StackAnchor>()
        );
        assert_eq!(th.context.sp, th.stack_base);
        assert_eq!(th.stack_base % 16, 0);
    }
}
