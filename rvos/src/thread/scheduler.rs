//! The ready list and the scheduler core.
//!
//! Scheduling is cooperative inside the kernel: [`suspend_self`] and the
//! switch primitive it calls are the only suspension points. The ready list
//! is FIFO and is only ever touched with interrupts disabled.

use super::{THRTAB, Thread, ThreadState, current};
use alloc::collections::VecDeque;
use smode::interrupt::InterruptGuard;
use smode::spinlock::SpinLock;

use super::Tid;

static READY: SpinLock<VecDeque<Tid>> = SpinLock::new(VecDeque::new());

pub(crate) fn ready_push(tid: Tid) {
    let mut q = READY.lock();
    q.push_back(tid);
    q.unlock();
}

fn ready_pop() -> Option<Tid> {
    let mut q = READY.lock();
    let tid = q.pop_front();
    q.unlock();
    tid
}

pub(crate) fn ready_is_empty() -> bool {
    let q = READY.lock();
    let empty = q.is_empty();
    q.unlock();
    empty
}

/// Yields the CPU to the next ready thread.
pub fn yield_now() {
    debug_assert_eq!(
        super::with_current(|th| th.state),
        ThreadState::Running,
        "yield from a thread that is not running"
    );
    suspend_self();
}

/// Suspends the calling thread and resumes the ready-list head.
///
/// With interrupts disabled: dequeue the next thread, mark it running, and,
/// if the caller is still `Running` (yielding rather than blocking),
/// mark the caller ready and queue it at the tail. Interrupts are re-enabled
/// before the switch; the switch itself is the suspension point. Returns
/// when the caller is next scheduled.
///
/// The idle thread is always runnable, so the ready list can only be empty
/// if the scheduler's invariants are already broken.
pub(crate) fn suspend_self() {
    let next: *mut Thread;
    {
        let ig = InterruptGuard::new();
        let next_tid = ready_pop().expect("ready list empty in suspend_self");
        let mut tab = THRTAB.lock();
        next = tab
            .get_ptr(next_tid)
            .expect("ready thread not in the thread table");
        tab.unlock();
        unsafe {
            assert_eq!((*next).state, ThreadState::Ready);
            (*next).state = ThreadState::Running;
            let cur = current();
            if (*cur).state == ThreadState::Running {
                (*cur).state = ThreadState::Ready;
                ready_push((*cur).tid);
            }
        }
        drop(ig);
    }
    unsafe {
        if let Some(p) = (*next).process.as_ref() {
            p.space.switch_to();
        }
        let prev = smode::context::_thread_swtch(next as *mut u8) as *mut Thread;
        // Back on this thread's stack. If the thread we displaced had
        // exited, its kernel stack can go now; its slot waits for a join.
        if (*prev).state == ThreadState::Exited {
            drop((*prev).stack.take());
            (*prev).stack_base = 0;
        }
    }
}

/// The idle thread's body: yield while anything is runnable, then sleep.
///
/// The emptiness re-check under disabled interrupts closes the race where an
/// interrupt readies a thread between the first check and the sleep; `wfi`
/// wakes on a pending interrupt even while interrupts are masked.
pub(crate) fn idle_loop() {
    loop {
        while !ready_is_empty() {
            yield_now();
        }
        let ig = InterruptGuard::new();
        if ready_is_empty() {
            smode::csr::wait_for_interrupt();
        }
        drop(ig);
    }
}
