//! # minos-paging
//!
//! Two-level x86-32 page table management: typed entries, table structures,
//! page ranges, and the walkers that map, unmap and translate. The crate
//! manipulates tables through their physical addresses and a configurable
//! physical access window, and takes the table-frame allocator as a
//! parameter, so it has no dependency on the kernel proper and its logic
//! runs unchanged in hosted tests.
//!
//! # Physical access window
//!
//! Page tables live in physical frames. To edit a table the kernel needs a
//! pointer to it, which is `window + physical`. On the real machine the
//! kernel runs with physical memory reachable at a fixed offset (identity
//! mapped during early boot), so the window is zero or a constant. Hosted
//! tests back "physical memory" with an arena and register the arena's
//! address as the window.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use minos_common::PhysAddr;
use spin::Once;

pub mod entry;
pub mod mapping;
pub mod region;
pub mod tables;
pub mod traits;

#[cfg(test)]
mod tests_support;

pub use entry::{Entry, EntryFlags};
pub use region::{PhysRegion, VirtRegion};
pub use tables::{PageDirectory, PageTable};
pub use traits::{MapError, TableAllocator};

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Entries per page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

// Compile-time verification: two 10-bit levels and a 12-bit offset must
// cover the whole 32-bit space. Widened so the product is representable on
// the 32-bit target itself.
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(
    (ENTRIES_PER_TABLE as u64) * (ENTRIES_PER_TABLE as u64) * (PAGE_SIZE as u64) == 1u64 << 32
);

/// Offset added to a physical address to reach it through the kernel's
/// mapping of physical memory. Set once during memory initialisation.
static PHYS_WINDOW: Once<usize> = Once::new();

/// Register the physical access window. Only the first call takes effect.
pub fn set_phys_window(offset: usize) {
    PHYS_WINDOW.call_once(|| offset);
}

/// The registered window, zero (identity) if none was registered.
#[inline]
#[must_use]
pub fn phys_window() -> usize {
    PHYS_WINDOW.get().copied().unwrap_or(0)
}

/// Get a pointer to physical memory through the access window.
///
/// # Safety
///
/// The caller must ensure `pa` names real, kernel-owned memory and that the
/// resulting pointer is used in accordance with `T`'s alignment and aliasing
/// rules.
#[inline]
#[must_use]
pub unsafe fn phys_to_ptr<T>(pa: PhysAddr) -> *mut T {
    (phys_window() + pa.as_u32() as usize) as *mut T
}
