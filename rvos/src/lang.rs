//! Language items and the kernel heap.

use core::ptr::addr_of_mut;
use linked_list_allocator::LockedHeap;

const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[unsafe(link_section = ".bss.heap")]
static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hands the static heap arena to the allocator.
///
/// # Safety
/// Must be called exactly once, before the first allocation.
pub(crate) unsafe fn init_heap() {
    unsafe {
        ALLOCATOR
            .lock()
            .init(addr_of_mut!(HEAP) as *mut u8, HEAP_SIZE);
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    println!("kernel panic: {}", info);
    smode::csr::halt_failure()
}
