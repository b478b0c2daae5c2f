//! Trap frame and trap vector.
//!
//! The frame holds the 31 general-purpose registers `x1..x31`, the trapping
//! `sstatus` and `sepc`, and one reserved slot, in that order. The vector
//! builds it directly below the stack anchor on the invoking thread's kernel
//! stack and hands it to `do_handle_trap`, which the kernel crate exports.
//!
//! `sscratch` discipline: while a thread runs in user mode, `sscratch` holds
//! the address of its stack anchor; on trap entry from user mode the vector
//! swaps it with `sp`, parks the user stack pointer in the frame, and
//! recovers `tp` from the anchor's back-pointer. While in kernel mode,
//! `sscratch` briefly holds the user stack pointer and is rewritten with the
//! anchor on the way back out.

use crate::addressing::Va;

/// Number of saved general-purpose registers (`x1..x31`).
pub const TRAP_FRAME_GPRS: usize = 31;

/// Size of a [`TrapFrame`] in bytes. Kept a multiple of 16 so the stack
/// pointer stays ABI-aligned across trap entry.
pub const TRAP_FRAME_SIZE: usize = (TRAP_FRAME_GPRS + 3) * 8;

/// `sstatus.SPP`: the privilege level the trap came from (0 = user).
pub const SSTATUS_SPP: usize = 1 << 8;

/// `sstatus.SPIE`: interrupt-enable to restore on `sret`.
pub const SSTATUS_SPIE: usize = 1 << 5;

/// Interrupt bit of `scause`.
pub const SCAUSE_INTERRUPT: usize = 1 << 63;

/// `scause` exception codes the kernel dispatches on.
pub mod cause {
    /// Environment call from U-mode.
    pub const ECALL_FROM_UMODE: usize = 8;
    /// Instruction page fault.
    pub const INST_PAGE_FAULT: usize = 12;
    /// Load page fault.
    pub const LOAD_PAGE_FAULT: usize = 13;
    /// Store/AMO page fault.
    pub const STORE_PAGE_FAULT: usize = 15;
    /// Supervisor timer interrupt (code, without the interrupt bit).
    pub const TIMER_INTERRUPT: usize = 5;
    /// Supervisor external interrupt (code, without the interrupt bit).
    pub const EXTERNAL_INTERRUPT: usize = 9;
}

/// Saved register state of a trap, as laid out by the trap vector.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    /// `x1..x31`; index `i` holds `x(i + 1)`. `x0` is hardwired zero and
    /// never saved.
    pub x: [usize; TRAP_FRAME_GPRS],
    /// `sstatus` at the time of the trap.
    pub sstatus: usize,
    /// `sepc`: the faulting/trapping program counter.
    pub sepc: usize,
    /// Reserved. Keeps the frame 16-byte aligned.
    pub reserved: usize,
}

impl TrapFrame {
    /// An all-zero frame.
    pub const fn zeroed() -> Self {
        Self {
            x: [0; TRAP_FRAME_GPRS],
            sstatus: 0,
            sepc: 0,
            reserved: 0,
        }
    }

    /// Did this trap come from user mode?
    #[inline]
    pub fn from_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP == 0
    }

    #[inline]
    fn x_reg(&self, n: usize) -> usize {
        self.x[n - 1]
    }

    #[inline]
    fn x_reg_mut(&mut self, n: usize) -> &mut usize {
        &mut self.x[n - 1]
    }

    /// The stack pointer (`x2`).
    #[inline]
    pub fn sp(&self) -> usize {
        self.x_reg(2)
    }

    /// Argument register `a0..a5` (`x10..x15`).
    #[inline]
    pub fn arg(&self, n: usize) -> usize {
        debug_assert!(n < 6);
        self.x_reg(10 + n)
    }

    /// The syscall-number register `a7` (`x17`).
    #[inline]
    pub fn sysno(&self) -> usize {
        self.x_reg(17)
    }

    /// Mutable access to the return-value register `a0` (`x10`).
    #[inline]
    pub fn a0_mut(&mut self) -> &mut usize {
        self.x_reg_mut(10)
    }

    /// The faulting address of a page-fault frame, as a [`Va`].
    #[inline]
    pub fn fault_va() -> Option<Va> {
        Va::new(crate::csr::stval())
    }
}

// The trap vector itself. Register save/restore offsets must match the
// `TrapFrame` layout above; the layout test below pins them.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text
    .globl _trap_entry_from_umode
    .align 2
_trap_entry_from_umode:
    # sscratch holds the stack anchor while in user mode.
    csrrw sp, sscratch, sp
    addi sp, sp, -{tf_size}
    sd x1, 0*8(sp)
    sd x3, 2*8(sp)
    sd x4, 3*8(sp)
    sd x5, 4*8(sp)
    sd x6, 5*8(sp)
    sd x7, 6*8(sp)
    sd x8, 7*8(sp)
    sd x9, 8*8(sp)
    sd x10, 9*8(sp)
    sd x11, 10*8(sp)
    sd x12, 11*8(sp)
    sd x13, 12*8(sp)
    sd x14, 13*8(sp)
    sd x15, 14*8(sp)
    sd x16, 15*8(sp)
    sd x17, 16*8(sp)
    sd x18, 17*8(sp)
    sd x19, 18*8(sp)
    sd x20, 19*8(sp)
    sd x21, 20*8(sp)
    sd x22, 21*8(sp)
    sd x23, 22*8(sp)
    sd x24, 23*8(sp)
    sd x25, 24*8(sp)
    sd x26, 25*8(sp)
    sd x27, 26*8(sp)
    sd x28, 27*8(sp)
    sd x29, 28*8(sp)
    sd x30, 29*8(sp)
    sd x31, 30*8(sp)
    # The user stack pointer was parked in sscratch by the csrrw above.
    csrr t0, sscratch
    sd t0, 1*8(sp)
    csrr t0, sstatus
    sd t0, 31*8(sp)
    csrr t0, sepc
    sd t0, 32*8(sp)
    # Recover the current thread from the anchor back-pointer.
    ld tp, {tf_size}(sp)
    # Nested traps now come from S-mode.
    la t0, _trap_entry_from_smode
    csrw stvec, t0
    mv a0, sp
    call do_handle_trap
    .globl _trap_return_to_umode
_trap_return_to_umode:
    ld t0, 31*8(sp)
    csrw sstatus, t0
    ld t0, 32*8(sp)
    csrw sepc, t0
    # Re-arm the anchor for the next trap from user mode.
    addi t0, sp, {tf_size}
    csrw sscratch, t0
    la t0, _trap_entry_from_umode
    csrw stvec, t0
    ld x1, 0*8(sp)
    ld x3, 2*8(sp)
    ld x4, 3*8(sp)
    ld x5, 4*8(sp)
    ld x6, 5*8(sp)
    ld x7, 6*8(sp)
    ld x8, 7*8(sp)
    ld x9, 8*8(sp)
    ld x10, 9*8(sp)
    ld x11, 10*8(sp)
    ld x12, 11*8(sp)
    ld x13, 12*8(sp)
    ld x14, 13*8(sp)
    ld x15, 14*8(sp)
    ld x16, 15*8(sp)
    ld x17, 16*8(sp)
    ld x18, 17*8(sp)
    ld x19, 18*8(sp)
    ld x20, 19*8(sp)
    ld x21, 20*8(sp)
    ld x22, 21*8(sp)
    ld x23, 22*8(sp)
    ld x24, 23*8(sp)
    ld x25, 24*8(sp)
    ld x26, 25*8(sp)
    ld x27, 26*8(sp)
    ld x28, 27*8(sp)
    ld x29, 28*8(sp)
    ld x30, 29*8(sp)
    ld x31, 30*8(sp)
    ld sp, 1*8(sp)
    sret

    .globl _trap_entry_from_smode
    .align 2
_trap_entry_from_smode:
    addi sp, sp, -{tf_size}
    sd x1, 0*8(sp)
    sd x3, 2*8(sp)
    sd x4, 3*8(sp)
    sd x5, 4*8(sp)
    sd x6, 5*8(sp)
    sd x7, 6*8(sp)
    sd x8, 7*8(sp)
    sd x9, 8*8(sp)
    sd x10, 9*8(sp)
    sd x11, 10*8(sp)
    sd x12, 11*8(sp)
    sd x13, 12*8(sp)
    sd x14, 13*8(sp)
    sd x15, 14*8(sp)
    sd x16, 15*8(sp)
    sd x17, 16*8(sp)
    sd x18, 17*8(sp)
    sd x19, 18*8(sp)
    sd x20, 19*8(sp)
    sd x21, 20*8(sp)
    sd x22, 21*8(sp)
    sd x23, 22*8(sp)
    sd x24, 23*8(sp)
    sd x25, 24*8(sp)
    sd x26, 25*8(sp)
    sd x27, 26*8(sp)
    sd x28, 27*8(sp)
    sd x29, 28*8(sp)
    sd x30, 29*8(sp)
    sd x31, 30*8(sp)
    addi t0, sp, {tf_size}
    sd t0, 1*8(sp)
    csrr t0, sstatus
    sd t0, 31*8(sp)
    csrr t0, sepc
    sd t0, 32*8(sp)
    mv a0, sp
    call do_handle_trap
    ld t0, 31*8(sp)
    csrw sstatus, t0
    ld t0, 32*8(sp)
    csrw sepc, t0
    ld x1, 0*8(sp)
    ld x3, 2*8(sp)
    ld x4, 3*8(sp)
    ld x5, 4*8(sp)
    ld x6, 5*8(sp)
    ld x7, 6*8(sp)
    ld x8, 7*8(sp)
    ld x9, 8*8(sp)
    ld x10, 9*8(sp)
    ld x11, 10*8(sp)
    ld x12, 11*8(sp)
    ld x13, 12*8(sp)
    ld x14, 13*8(sp)
    ld x15, 14*8(sp)
    ld x16, 15*8(sp)
    ld x17, 16*8(sp)
    ld x18, 17*8(sp)
    ld x19, 18*8(sp)
    ld x20, 19*8(sp)
    ld x21, 20*8(sp)
    ld x22, 21*8(sp)
    ld x23, 22*8(sp)
    ld x24, 23*8(sp)
    ld x25, 24*8(sp)
    ld x26, 25*8(sp)
    ld x27, 26*8(sp)
    ld x28, 27*8(sp)
    ld x29, 28*8(sp)
    ld x30, 29*8(sp)
    ld x31, 30*8(sp)
    addi sp, sp, {tf_size}
    sret
"#,
    tf_size = const TRAP_FRAME_SIZE,
);

/// Installs the S-mode trap vector. Call once during early boot, before
/// interrupts are enabled.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn init() {
    unsafe extern "C" {
        fn _trap_entry_from_smode();
    }
    unsafe {
        riscv::register::sscratch::write(0);
        riscv::register::stvec::write(
            _trap_entry_from_smode as usize,
            riscv::register::mtvec::TrapMode::Direct,
        );
    }
}

/// Host stub; there is no trap vector to install.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn init() {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_matches_the_vector() {
        // The save/restore offsets in the trap vector are written against
        // this exact layout.
        assert_eq!(size_of::<TrapFrame>(), TRAP_FRAME_SIZE);
        assert_eq!(TRAP_FRAME_SIZE % 16, 0);
        assert_eq!(offset_of!(TrapFrame, x), 0);
        assert_eq!(offset_of!(TrapFrame, sstatus), 31 * 8);
        assert_eq!(offset_of!(TrapFrame, sepc), 32 * 8);
        assert_eq!(offset_of!(TrapFrame, reserved), 33 * 8);
    }

    #[test]
    fn register_accessors() {
        let mut frame = TrapFrame::zeroed();
        frame.x[1] = 0xDEAD;   // x2 = sp
        frame.x[9] = 7;        // x10 = a0
        frame.x[16] = 11;      // x17 = a7
        assert_eq!(frame.sp(), 0xDEAD);
        assert_eq!(frame.arg(0), 7);
        assert_eq!(frame.sysno(), 11);
        *frame.a0_mut() = 99;
        assert_eq!(frame.arg(0), 99);
    }

    #[test]
    fn privilege_of_origin() {
        let mut frame = TrapFrame::zeroed();
        assert!(frame.from_user());
        frame.sstatus = SSTATUS_SPP;
        assert!(!frame.from_user());
    }
}
