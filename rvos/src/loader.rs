//! ELF64 program loading.
//!
//! Just enough of the format to carry a statically linked RV64 executable
//! into a fresh address space: header validation and `PT_LOAD` segments.
//! Anything surprising in the image is an exec-format error; the caller's
//! old address space is untouched until loading has fully succeeded.

use crate::KernelError;
use crate::io::{IOCTL_SETPOS, IoRef, ioread_full};
use crate::mm::page_table::Permission;
use crate::mm::{MemorySpace, Page, is_user_range};
use smode::addressing::{PAGE_SIZE, Va};

/// ELF file header (64-bit).
#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    /// `0x7F` followed by `ELF`.
    magic: [u8; 4],
    /// 1 = 32-bit, 2 = 64-bit.
    class: u8,
    /// 1 = little-endian.
    data: u8,
    version: u8,
    abi: u8,
    abi_version: u8,
    pad: [u8; 7],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// ELF program header (64-bit).
#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 0xF3;
const PT_LOAD: u32 = 1;

bitflags::bitflags! {
    /// Segment permission flags of a program header.
    struct PFlags: u32 {
        const X = 1 << 0;
        const W = 1 << 1;
        const R = 1 << 2;
    }
}

impl PFlags {
    fn permission(self) -> Permission {
        let mut perm = Permission::USER;
        if self.contains(PFlags::R) {
            perm |= Permission::READ;
        }
        if self.contains(PFlags::W) {
            perm |= Permission::WRITE;
        }
        if self.contains(PFlags::X) {
            perm |= Permission::EXECUTABLE;
        }
        perm
    }
}

/// A program image loaded into its own address space.
pub(crate) struct LoadedImage {
    /// The populated address space.
    pub space: MemorySpace,
    /// The entry point.
    pub entry: usize,
}

fn seek(io: &IoRef, pos: usize) -> Result<(), KernelError> {
    let mut arg = pos;
    io.ctl(IOCTL_SETPOS, &mut arg).map(|_| ())
}

fn read_exact(io: &IoRef, buf: &mut [u8]) -> Result<(), KernelError> {
    if ioread_full(io, buf)? == buf.len() {
        Ok(())
    } else {
        Err(KernelError::NoExec)
    }
}

/// Loads the ELF executable in `io` into a fresh address space.
pub(crate) fn load(io: &IoRef) -> Result<LoadedImage, KernelError> {
    seek(io, 0)?;
    let mut raw = [0u8; core::mem::size_of::<Elf64Ehdr>()];
    read_exact(io, &mut raw)?;
    let ehdr: Elf64Ehdr = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Elf64Ehdr) };

    if &ehdr.magic != b"\x7FELF"
        || ehdr.class != ELF_CLASS_64
        || ehdr.data != ELF_DATA_LSB
        || ehdr.e_type != ET_EXEC
        || ehdr.e_machine != EM_RISCV
        || (ehdr.e_phentsize as usize) < core::mem::size_of::<Elf64Phdr>()
    {
        return Err(KernelError::NoExec);
    }

    let mut space = MemorySpace::new()?;
    for i in 0..ehdr.e_phnum as usize {
        seek(io, ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize)?;
        let mut raw = [0u8; core::mem::size_of::<Elf64Phdr>()];
        read_exact(io, &mut raw)?;
        let phdr: Elf64Phdr =
            unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Elf64Phdr) };

        if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
            continue;
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(KernelError::NoExec);
        }
        load_segment(io, &mut space, &phdr)?;
    }

    let entry = ehdr.e_entry as usize;
    if !is_user_range(entry, entry) {
        return Err(KernelError::NoExec);
    }
    Ok(LoadedImage { space, entry })
}

/// Maps one `PT_LOAD` segment, reading file-backed bytes and zero-filling
/// the rest (the BSS tail of a segment arrives zeroed with its frame).
fn load_segment(
    io: &IoRef,
    space: &mut MemorySpace,
    phdr: &Elf64Phdr,
) -> Result<(), KernelError> {
    let vaddr = phdr.p_vaddr as usize;
    let memsz = phdr.p_memsz as usize;
    let filesz = phdr.p_filesz as usize;
    let seg_lo = vaddr & !(PAGE_SIZE - 1);
    let seg_hi = vaddr
        .checked_add(memsz)
        .map(|hi| (hi + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
        .ok_or(KernelError::NoExec)?;
    if !is_user_range(seg_lo, seg_hi) {
        return Err(KernelError::NoExec);
    }

    let perm = PFlags::from_bits_truncate(phdr.p_flags).permission();
    let mut page_va = seg_lo;
    while page_va < seg_hi {
        let mut page = Page::new()?;

        // Bytes of [vaddr, vaddr + filesz) falling into this page.
        let copy_lo = page_va.max(vaddr);
        let copy_hi = (page_va + PAGE_SIZE).min(vaddr + filesz);
        if copy_lo < copy_hi {
            seek(io, phdr.p_offset as usize + (copy_lo - vaddr))?;
            let at = copy_lo - page_va;
            read_exact(io, &mut page.inner_mut()[at..at + (copy_hi - copy_lo)])?;
        }

        space
            .map_page(Va::new(page_va).unwrap(), page, perm)
            .map_err(|e| match e {
                KernelError::NoMemory => KernelError::NoMemory,
                // Overlapping segments and friends are format problems.
                _ => KernelError::NoExec,
            })?;
        page_va += PAGE_SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoRef;
    use crate::io::lit::IoLit;
    use crate::mm::USER_LO;
    use alloc::vec;
    use alloc::vec::Vec;

    fn struct_bytes<T: Copy>(v: &T) -> Vec<u8> {
        let p = v as *const T as *const u8;
        unsafe { core::slice::from_raw_parts(p, core::mem::size_of::<T>()) }.to_vec()
    }

    fn ehdr(entry: usize, phnum: u16) -> Elf64Ehdr {
        Elf64Ehdr {
            magic: *b"\x7FELF",
            class: ELF_CLASS_64,
            data: ELF_DATA_LSB,
            version: 1,
            abi: 0,
            abi_version: 0,
            pad: [0; 7],
            e_type: ET_EXEC,
            e_machine: EM_RISCV,
            e_version: 1,
            e_entry: entry as u64,
            e_phoff: 64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: 64,
            e_phentsize: 0x38,
            e_phnum: phnum,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    /// One PT_LOAD at USER_LO + 0x1000 with 16 file bytes and a BSS tail.
    fn tiny_image() -> Vec<u8> {
        let payload = b"execve me please";
        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: (PFlags::R | PFlags::X).bits(),
            p_offset: 0x100,
            p_vaddr: (USER_LO + 0x1000) as u64,
            p_paddr: 0,
            p_filesz: payload.len() as u64,
            p_memsz: 0x2000,
            p_align: 0x1000,
        };
        let mut image = struct_bytes(&ehdr(USER_LO + 0x1000, 1));
        image.extend_from_slice(&struct_bytes(&phdr));
        image.resize(0x100, 0);
        image.extend_from_slice(payload);
        image
    }

    fn as_io(bytes: Vec<u8>) -> IoRef {
        IoRef::new(IoLit::new(bytes.into_boxed_slice()))
    }

    #[test]
    fn loads_a_minimal_executable() {
        let image = load(&as_io(tiny_image())).unwrap();
        assert_eq!(image.entry, USER_LO + 0x1000);

        let mut got = [0u8; 16];
        image
            .space
            .copy_from_user(Va::new(USER_LO + 0x1000).unwrap(), &mut got)
            .unwrap();
        assert_eq!(&got, b"execve me please");

        // The BSS tail of the segment is mapped and zeroed.
        let mut tail = [0xFFu8; 4];
        image
            .space
            .copy_from_user(Va::new(USER_LO + 0x2ff0).unwrap(), &mut tail)
            .unwrap();
        assert_eq!(tail, [0; 4]);
        // And the segment ends where p_memsz says.
        assert!(!image.space.access_ok(
            Va::new(USER_LO + 0x3000).unwrap()..Va::new(USER_LO + 0x3004).unwrap(),
            false
        ));
    }

    #[test]
    fn rejects_foreign_binaries() {
        let mut bad = tiny_image();
        bad[18] = 0x3E; // x86-64 machine id
        assert_eq!(load(&as_io(bad)).err(), Some(KernelError::NoExec));

        let mut bad = tiny_image();
        bad[0] = 0;
        assert_eq!(load(&as_io(bad)).err(), Some(KernelError::NoExec));
    }

    #[test]
    fn rejects_truncated_images() {
        let mut short = tiny_image();
        short.truncate(0x40);
        assert_eq!(load(&as_io(short)).err(), Some(KernelError::NoExec));
        assert_eq!(load(&as_io(vec![0; 8])).err(), Some(KernelError::NoExec));
    }

    #[test]
    fn rejects_segments_outside_the_user_window() {
        let mut image = tiny_image();
        // Point the segment's vaddr at the kernel window.
        let vaddr_off = 64 + 16;
        image[vaddr_off..vaddr_off + 8].copy_from_slice(&0x8000_0000u64.to_le_bytes());
        assert_eq!(load(&as_io(image)).err(), Some(KernelError::NoExec));
    }
}
