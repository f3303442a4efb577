//! Test scaffolding shared by the kernel's unit tests.
//!
//! Physical memory is an arena allocated once per test process and
//! registered as the paging crate's access window, so allocators, page
//! walkers, address spaces and the scheduler all run against real memory
//! through their production code paths.

pub mod arena {
    use core::sync::atomic::{AtomicU32, Ordering};

    use minos_common::memory::{page, MemoryRegion, MemoryRegionKind};
    use minos_common::{MemoryMap, PhysAddr};

    use crate::memory::frame::FrameAllocator;
    use crate::memory::Memory;

    /// First simulated physical address, like RAM above the legacy hole.
    const ARENA_PHYS_BASE: u32 = 0x0010_0000;

    /// Simulated physical memory size.
    const ARENA_SIZE: usize = 256 * 1024 * 1024;

    static NEXT: AtomicU32 = AtomicU32::new(ARENA_PHYS_BASE);

    fn init() {
        static ARENA: spin::Once<usize> = spin::Once::new();

        let base = *ARENA.call_once(|| {
            let storage = vec![0u8; ARENA_SIZE + page::SIZE].leak();
            let addr = storage.as_mut_ptr() as usize;
            (addr + page::SIZE - 1) & !(page::SIZE - 1)
        });

        minos_paging::set_phys_window(base - ARENA_PHYS_BASE as usize);
    }

    /// Claim a fresh run of `frames` frames of simulated physical memory.
    pub fn claim(frames: usize) -> PhysAddr {
        init();

        let bytes = (frames * page::SIZE) as u32;
        let base = NEXT.fetch_add(bytes, Ordering::Relaxed);
        assert!(
            (base + bytes - ARENA_PHYS_BASE) as usize <= ARENA_SIZE,
            "test arena exhausted"
        );
        PhysAddr::new(base)
    }

    /// A frame allocator over a fresh arena run of `frames` frames.
    pub fn frame_allocator(frames: usize) -> FrameAllocator {
        let base = claim(frames);

        let mut map = MemoryMap::empty();
        map.regions[0] = MemoryRegion {
            base,
            size: (frames * page::SIZE) as u32,
            kind: MemoryRegionKind::Available,
        };
        map.entry_count = 1;

        let bitmap = vec![0u64; frames.div_ceil(64)].leak();
        FrameAllocator::new(bitmap, &map)
    }

    /// A full memory manager (frame allocator plus kernel space) over a
    /// fresh arena run. `frames` must cover the shared kernel tables with
    /// room to spare.
    pub fn memory(frames: usize) -> Memory {
        Memory::with_frames(frame_allocator(frames)).expect("test memory manager")
    }
}
