//! Control and status register access.
//!
//! Thin wrappers over the handful of S-mode CSRs the kernel touches, plus the
//! SBI calls for the timer and for powering off. On non-RISC-V builds the
//! stateful registers (`satp`, `tp`, the interrupt enable) are emulated with
//! atomics so that kernel code exercising them can run under `cargo test`.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod imp {
    use core::arch::asm;

    pub fn interrupts_enabled() -> bool {
        riscv::register::sstatus::read().sie()
    }

    pub unsafe fn enable_interrupts() {
        unsafe { riscv::register::sstatus::set_sie() }
    }

    pub unsafe fn disable_interrupts() {
        unsafe { riscv::register::sstatus::clear_sie() }
    }

    pub fn scause() -> usize {
        let v: usize;
        unsafe { asm!("csrr {}, scause", out(reg) v) };
        v
    }

    pub fn stval() -> usize {
        let v: usize;
        unsafe { asm!("csrr {}, stval", out(reg) v) };
        v
    }

    pub fn read_satp() -> usize {
        let v: usize;
        unsafe { asm!("csrr {}, satp", out(reg) v) };
        v
    }

    pub unsafe fn write_satp(v: usize) {
        unsafe {
            asm!("csrw satp, {}", "sfence.vma", in(reg) v);
        }
    }

    pub fn read_tp() -> usize {
        let v: usize;
        unsafe { asm!("mv {}, tp", out(reg) v) };
        v
    }

    pub unsafe fn write_tp(v: usize) {
        unsafe { asm!("mv tp, {}", in(reg) v) };
    }

    pub fn read_sp() -> usize {
        let v: usize;
        unsafe { asm!("mv {}, sp", out(reg) v) };
        v
    }

    pub unsafe fn enable_timer_interrupt() {
        unsafe { asm!("csrs sie, {}", in(reg) 1usize << 5) };
    }

    pub fn set_timer(delta_cycles: u64) {
        let now = riscv::register::time::read() as u64;
        sbi_rt::set_timer(now.wrapping_add(delta_cycles));
    }

    pub fn wait_for_interrupt() {
        riscv::asm::wfi();
    }

    pub fn halt_success() -> ! {
        sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::NoReason);
        loop {
            riscv::asm::wfi();
        }
    }

    pub fn halt_failure() -> ! {
        sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::SystemFailure);
        loop {
            riscv::asm::wfi();
        }
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod imp {
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    static INTERRUPTS: AtomicBool = AtomicBool::new(true);
    static SATP: AtomicUsize = AtomicUsize::new(0);
    static TP: AtomicUsize = AtomicUsize::new(0);

    pub fn interrupts_enabled() -> bool {
        INTERRUPTS.load(Ordering::SeqCst)
    }

    pub unsafe fn enable_interrupts() {
        INTERRUPTS.store(true, Ordering::SeqCst);
    }

    pub unsafe fn disable_interrupts() {
        INTERRUPTS.store(false, Ordering::SeqCst);
    }

    pub fn scause() -> usize {
        0
    }

    pub fn stval() -> usize {
        0
    }

    pub fn read_satp() -> usize {
        SATP.load(Ordering::SeqCst)
    }

    pub unsafe fn write_satp(v: usize) {
        SATP.store(v, Ordering::SeqCst);
    }

    pub fn read_tp() -> usize {
        TP.load(Ordering::SeqCst)
    }

    pub unsafe fn write_tp(v: usize) {
        TP.store(v, Ordering::SeqCst);
    }

    pub fn read_sp() -> usize {
        let probe = 0u8;
        &probe as *const u8 as usize
    }

    pub unsafe fn enable_timer_interrupt() {}

    pub fn set_timer(_delta_cycles: u64) {}

    pub fn wait_for_interrupt() {
        core::hint::spin_loop();
    }

    pub fn halt_success() -> ! {
        panic!("halt_success() on the host");
    }

    pub fn halt_failure() -> ! {
        panic!("halt_failure() on the host");
    }
}

/// Reads whether S-mode interrupts are globally enabled (`sstatus.SIE`).
pub fn interrupts_enabled() -> bool {
    imp::interrupts_enabled()
}

/// Enables S-mode interrupts.
///
/// # Safety
/// The caller must be prepared for an interrupt to be taken immediately.
pub unsafe fn enable_interrupts() {
    unsafe { imp::enable_interrupts() }
}

/// Disables S-mode interrupts.
///
/// # Safety
/// Pair with [`enable_interrupts`], or use
/// [`InterruptGuard`](crate::interrupt::InterruptGuard) which restores the
/// previous state automatically.
pub unsafe fn disable_interrupts() {
    unsafe { imp::disable_interrupts() }
}

/// Reads the trap cause register.
pub fn scause() -> usize {
    imp::scause()
}

/// Reads the trap value register (the faulting address for page faults).
pub fn stval() -> usize {
    imp::stval()
}

/// Reads the current address-translation register.
pub fn read_satp() -> usize {
    imp::read_satp()
}

/// Installs a new address translation and fences the TLB.
///
/// # Safety
/// `v` must name a page-table root that maps the executing kernel.
pub unsafe fn write_satp(v: usize) {
    unsafe { imp::write_satp(v) }
}

/// Reads the current-thread register.
pub fn read_tp() -> usize {
    imp::read_tp()
}

/// Sets the current-thread register.
///
/// # Safety
/// `v` must point at a live thread structure; every kernel code path relies
/// on it.
pub unsafe fn write_tp(v: usize) {
    unsafe { imp::write_tp(v) }
}

/// Reads the stack pointer of the caller.
pub fn read_sp() -> usize {
    imp::read_sp()
}

/// Unmasks the S-mode timer interrupt (`sie.STIE`).
///
/// # Safety
/// A timer handler must be installed before the first tick fires.
pub unsafe fn enable_timer_interrupt() {
    unsafe { imp::enable_timer_interrupt() }
}

/// Arms the SBI timer `delta_cycles` from now.
pub fn set_timer(delta_cycles: u64) {
    imp::set_timer(delta_cycles)
}

/// Stalls the hart until an interrupt is pending.
///
/// Wakes even when interrupts are globally masked, which is exactly what the
/// idle loop needs to close its sleep/wake race.
pub fn wait_for_interrupt() {
    imp::wait_for_interrupt()
}

/// Powers the machine off, reporting success.
pub fn halt_success() -> ! {
    imp::halt_success()
}

/// Powers the machine off, reporting failure.
pub fn halt_failure() -> ! {
    imp::halt_failure()
}
