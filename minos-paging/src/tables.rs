//! Page directory and page table structures
//!
//! Both levels are 1024 entries of 4 bytes, exactly one page. The structures
//! are only ever manufactured over physical frames through the access
//! window; nothing constructs them by value.

use minos_common::{PhysAddr, VirtAddr};

use crate::entry::Entry;
use crate::{ENTRIES_PER_TABLE, PAGE_SIZE};

/// The root of one address space: 1024 entries, each covering 4 MiB.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [Entry; ENTRIES_PER_TABLE],
}

/// A second-level table: 1024 entries, each covering one page.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; ENTRIES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageDirectory>() == PAGE_SIZE);
const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

macro_rules! table_common {
    ($name:ident) => {
        impl $name {
            /// Borrow the table living in the frame at `pa`.
            ///
            /// # Safety
            ///
            /// `pa` must name a page-aligned frame that holds a table of
            /// this type for the duration of the borrow, with no aliasing
            /// mutable access.
            #[must_use]
            pub unsafe fn from_phys<'a>(pa: PhysAddr) -> &'a mut Self {
                debug_assert!(pa.is_page_aligned());
                // SAFETY: Deferred to the caller, plus the window contract
                // of `phys_to_ptr`.
                unsafe { &mut *crate::phys_to_ptr::<Self>(pa) }
            }

            /// Clear every entry.
            pub fn zero(&mut self) {
                for entry in self.entries.iter_mut() {
                    entry.clear();
                }
            }

            #[inline]
            #[must_use]
            pub fn entry(&self, index: usize) -> Entry {
                self.entries[index]
            }

            pub fn set_entry(&mut self, index: usize, entry: Entry) {
                self.entries[index] = entry;
            }

            /// True when no entry is present.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.entries.iter().all(|e| !e.is_present())
            }

            pub fn iter(&self) -> impl Iterator<Item = &Entry> {
                self.entries.iter()
            }
        }
    };
}

table_common!(PageDirectory);
table_common!(PageTable);

impl PageDirectory {
    /// The directory entry covering `va`.
    #[inline]
    #[must_use]
    pub fn entry_for(&self, va: VirtAddr) -> Entry {
        self.entries[va.directory_index()]
    }

    /// Bytes of virtual space covered by one directory entry (4 MiB).
    pub const ENTRY_SPAN: usize = ENTRIES_PER_TABLE * PAGE_SIZE;
}

impl PageTable {
    /// The table entry covering `va`.
    #[inline]
    #[must_use]
    pub fn entry_for(&self, va: VirtAddr) -> Entry {
        self.entries[va.table_index()]
    }
}
