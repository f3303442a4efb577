//! Test scaffolding: an arena standing in for physical memory.
//!
//! The arena is allocated once per test process and registered as the
//! physical access window, so the walkers manipulate real memory through
//! the same path they use on the machine. "Physical" addresses start at
//! 1 MiB, like RAM handed over by the loader.

use core::sync::atomic::{AtomicU32, Ordering};

use minos_common::PhysAddr;

use crate::tables::PageDirectory;
use crate::traits::TableAllocator;
use crate::PAGE_SIZE;

/// First simulated physical address.
const ARENA_PHYS_BASE: u32 = 0x0010_0000;

/// Simulated physical memory size.
const ARENA_SIZE: usize = 16 * 1024 * 1024;

/// Next frame the bump cursor will hand out.
static NEXT_FRAME: AtomicU32 = AtomicU32::new(ARENA_PHYS_BASE);

/// Register the arena as the physical window, once per process.
fn arena_init() {
    static ARENA: spin::Once<usize> = spin::Once::new();

    let base = *ARENA.call_once(|| {
        let storage = vec![0u8; ARENA_SIZE + PAGE_SIZE].leak();
        let addr = storage.as_mut_ptr() as usize;
        (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    });

    crate::set_phys_window(base - ARENA_PHYS_BASE as usize);
}

/// Claim `count` fresh frames from the arena.
pub fn claim_frames(count: usize) -> PhysAddr {
    arena_init();

    let bytes = (count * PAGE_SIZE) as u32;
    let base = NEXT_FRAME.fetch_add(bytes, Ordering::Relaxed);
    assert!(
        (base + bytes - ARENA_PHYS_BASE) as usize <= ARENA_SIZE,
        "test arena exhausted"
    );
    PhysAddr::new(base)
}

/// A bounded table allocator over the arena, with a free list so frame
/// accounting tests can watch balance.
pub struct ArenaAllocator {
    remaining: usize,
    free_list: Vec<PhysAddr>,
    outstanding: usize,
}

impl ArenaAllocator {
    /// An allocator that may hand out at most `capacity` frames at a time.
    pub fn new(capacity: usize) -> Self {
        arena_init();
        Self {
            remaining: capacity,
            free_list: Vec::new(),
            outstanding: 0,
        }
    }

    /// Frames currently handed out and not returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl TableAllocator for ArenaAllocator {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        let frame = if let Some(frame) = self.free_list.pop() {
            frame
        } else {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            claim_frames(1)
        };

        // Fresh tables must come back zeroed even when recycled.
        // SAFETY: The frame belongs to the arena and is page-sized.
        unsafe {
            core::ptr::write_bytes(crate::phys_to_ptr::<u8>(frame), 0, PAGE_SIZE);
        }

        self.outstanding += 1;
        Some(frame)
    }

    fn free_table(&mut self, frame: PhysAddr) {
        self.outstanding -= 1;
        self.free_list.push(frame);
    }
}

/// Allocate and zero a page directory for a test.
pub fn alloc_dir(allocator: &mut ArenaAllocator) -> &'static mut PageDirectory {
    let frame = allocator
        .allocate_table()
        .expect("arena allocator exhausted while creating a directory");
    // SAFETY: The frame was just allocated for exclusive use and zeroed.
    unsafe { PageDirectory::from_phys(frame) }
}
