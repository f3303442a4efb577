//! Kernel heap
//!
//! A buddy allocator over a fixed slab of kernel memory. Only built for the
//! real target; hosted builds use the host allocator.

use buddy_system_allocator::LockedHeap;
use minos_paging::VirtRegion;

use super::{Memory, MemoryFlags};

#[global_allocator]
static HEAP: LockedHeap<32> = LockedHeap::<32>::empty();

/// Kernel heap size.
const HEAP_SIZE: usize = 4 * 1024 * 1024;

pub(super) fn init(memory: &mut Memory) {
    let base = memory
        .alloc_kernel(HEAP_SIZE, MemoryFlags::CLEAR)
        .expect("kernel heap allocation failed");

    // SAFETY: The range was just allocated for exclusive heap use and is
    // mapped in every address space through the shared kernel region.
    unsafe {
        HEAP.lock().init(base.as_u32() as usize, HEAP_SIZE);
    }

    log::debug!(
        "heap: {} at {:?}",
        HEAP_SIZE / 1024,
        VirtRegion::new(base, HEAP_SIZE)
    );
}
