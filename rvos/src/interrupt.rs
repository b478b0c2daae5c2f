//! Trap dispatch.
//!
//! The trap vector in `smode` builds the frame and calls [`do_handle_trap`].
//! Policy lives here: environment calls go to the syscall dispatcher, timer
//! ticks re-arm and preempt only at the return-to-user boundary, user page
//! faults are offered to the owning address space, and anything the kernel
//! cannot answer for a user thread terminates that process rather than the
//! machine. A fault in kernel mode is fatal.

use crate::{KernelError, TICK_CYCLES, process, syscall, thread};
use smode::trap::{SCAUSE_INTERRUPT, TrapFrame, cause};

#[unsafe(no_mangle)]
extern "C" fn do_handle_trap(frame: &mut TrapFrame) {
    let scause = smode::csr::scause();
    let code = scause & !SCAUSE_INTERRUPT;

    if scause & SCAUSE_INTERRUPT != 0 {
        match code {
            cause::TIMER_INTERRUPT => {
                smode::csr::set_timer(TICK_CYCLES);
                // Preemption happens only at the trap boundary, and only
                // against user code.
                if frame.from_user() {
                    thread::scheduler::yield_now();
                }
            }
            cause::EXTERNAL_INTERRUPT => {
                // No external devices are routed yet; spurious claims are
                // harmless.
                debug!("spurious external interrupt");
            }
            _ => panic!("unexpected interrupt: scause {:#x}", scause),
        }
        return;
    }

    match code {
        cause::ECALL_FROM_UMODE => {
            frame.sepc += 4;
            // Syscalls run with interrupts on; ticks nest through the
            // kernel-mode vector and the frame's sstatus masks them again
            // on the way out.
            unsafe { smode::csr::enable_interrupts() };
            syscall::handle_syscall(frame);
        }
        cause::INST_PAGE_FAULT | cause::LOAD_PAGE_FAULT | cause::STORE_PAGE_FAULT => {
            let va = TrapFrame::fault_va();
            if !frame.from_user() {
                panic!(
                    "kernel page fault at {:?}, sepc {:#x}",
                    va, frame.sepc
                );
            }
            let served = va
                .ok_or(KernelError::BadAddress)
                .and_then(|va| {
                    thread::with_current_process(|p| p.space.handle_page_fault(va))
                });
            if let Err(e) = served {
                warning!(
                    "thread {} faulted at {:?} ({:?}); terminating",
                    thread::running_thread(),
                    va,
                    e
                );
                process::exit();
            }
        }
        _ if frame.from_user() => {
            warning!(
                "thread {} trapped with scause {:#x}, sepc {:#x}; terminating",
                thread::running_thread(),
                scause,
                frame.sepc
            );
            process::exit();
        }
        _ => panic!(
            "unhandled kernel trap: scause {:#x}, sepc {:#x}",
            scause, frame.sepc
        ),
    }
}
