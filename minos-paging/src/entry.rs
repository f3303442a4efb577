//! Page table entries
//!
//! One `u32` per entry at both levels: the top 20 bits name a frame, the
//! low 12 carry flags. Directory entries point at page tables, table entries
//! at data frames; the flag encoding is the same.

use bitflags::bitflags;
use minos_common::PhysAddr;

bitflags! {
    /// Hardware flag bits of a page directory or page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

/// A single page directory or page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    /// An empty, not-present entry.
    pub const EMPTY: Self = Self(0);

    /// Build an entry pointing at `frame` with `flags`.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is not page-aligned; a misaligned frame address
    /// would silently corrupt the flag bits.
    #[must_use]
    pub fn new(frame: PhysAddr, flags: EntryFlags) -> Self {
        assert!(frame.is_page_aligned(), "entry frame must be page-aligned");
        Self(frame.as_u32() | flags.bits())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// The frame this entry points at.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & !0xFFF)
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Clear the entry to not-present.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 & EntryFlags::USER.bits() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_packing() {
        let e = Entry::new(
            PhysAddr::new(0x0012_3000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        );
        assert!(e.is_present());
        assert!(!e.is_user());
        assert_eq!(e.frame(), PhysAddr::new(0x0012_3000));
        assert_eq!(e.flags(), EntryFlags::PRESENT | EntryFlags::WRITABLE);
    }

    #[test]
    fn test_clear() {
        let mut e = Entry::new(PhysAddr::new(0x1000), EntryFlags::PRESENT);
        e.clear();
        assert!(!e.is_present());
        assert_eq!(e, Entry::EMPTY);
    }

    #[test]
    #[should_panic(expected = "page-aligned")]
    fn test_misaligned_frame_rejected() {
        let _ = Entry::new(PhysAddr::new(0x1234), EntryFlags::PRESENT);
    }
}
