//! Page table walkers
//!
//! Maps, unmaps and translates single pages and ranges against a
//! [`PageDirectory`]. Intermediate tables are created on demand through the
//! [`TableAllocator`] and zeroed before linking.

use minos_common::{PhysAddr, VirtAddr};

use crate::entry::{Entry, EntryFlags};
use crate::region::VirtRegion;
use crate::tables::{PageDirectory, PageTable};
use crate::traits::{MapError, TableAllocator};
use crate::PAGE_SIZE;

/// Get the table covering `va`, creating and linking it if absent.
///
/// The directory entry for a fresh table is writable, and user-accessible
/// when the leaf flags are: on x86 the effective permission is the AND of
/// both levels, so the leaf entry stays the deciding one.
fn table_for<A: TableAllocator>(
    dir: &mut PageDirectory,
    va: VirtAddr,
    leaf_flags: EntryFlags,
    allocator: &mut A,
) -> Result<&'static mut PageTable, MapError> {
    let index = va.directory_index();
    let dir_entry = dir.entry(index);

    if dir_entry.is_present() {
        // SAFETY: A present directory entry installed by this module always
        // points at a PageTable frame.
        return Ok(unsafe { PageTable::from_phys(dir_entry.frame()) });
    }

    let frame = allocator.allocate_table().ok_or(MapError::OutOfMemory)?;

    // SAFETY: The allocator handed us this frame for exclusive use as a
    // table; it is zeroed before the directory links to it.
    let table = unsafe { PageTable::from_phys(frame) };
    table.zero();

    let mut table_flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
    if leaf_flags.contains(EntryFlags::USER) {
        table_flags |= EntryFlags::USER;
    }
    dir.set_entry(index, Entry::new(frame, table_flags));

    Ok(table)
}

/// Look up the table covering `va` without creating it.
fn existing_table(dir: &PageDirectory, va: VirtAddr) -> Option<&'static mut PageTable> {
    let entry = dir.entry_for(va);
    if entry.is_present() {
        // SAFETY: As in `table_for`, present directory entries point at
        // tables owned by this directory.
        Some(unsafe { PageTable::from_phys(entry.frame()) })
    } else {
        None
    }
}

/// Map one page. Fails `AlreadyMapped` without touching anything if the
/// slot is occupied.
pub fn map_page<A: TableAllocator>(
    dir: &mut PageDirectory,
    va: VirtAddr,
    pa: PhysAddr,
    flags: EntryFlags,
    allocator: &mut A,
) -> Result<(), MapError> {
    if !va.is_page_aligned() || !pa.is_page_aligned() {
        return Err(MapError::NotAligned);
    }

    let table = table_for(dir, va, flags, allocator)?;
    let index = va.table_index();

    if table.entry(index).is_present() {
        return Err(MapError::AlreadyMapped);
    }

    table.set_entry(index, Entry::new(pa, flags | EntryFlags::PRESENT));
    Ok(())
}

/// Unmap one page, returning the frame it was mapped to.
///
/// The table itself stays in place even when it becomes empty; table frames
/// are reclaimed wholesale when the owning address space is destroyed.
pub fn unmap_page(dir: &mut PageDirectory, va: VirtAddr) -> Result<PhysAddr, MapError> {
    if !va.is_page_aligned() {
        return Err(MapError::NotAligned);
    }

    let table = existing_table(dir, va).ok_or(MapError::NotMapped)?;
    let index = va.table_index();
    let entry = table.entry(index);

    if !entry.is_present() {
        return Err(MapError::NotMapped);
    }

    table.set_entry(index, Entry::EMPTY);
    Ok(entry.frame())
}

/// Translate a virtual address to the physical address it maps to.
#[must_use]
pub fn translate(dir: &PageDirectory, va: VirtAddr) -> Option<PhysAddr> {
    let table = existing_table(dir, va)?;
    let entry = table.entry_for(va);

    if entry.is_present() {
        Some(entry.frame().offset(va.page_offset() as u32))
    } else {
        None
    }
}

/// True when at least one page of `region` is mapped.
#[must_use]
pub fn any_present(dir: &PageDirectory, region: VirtRegion) -> bool {
    region
        .pages()
        .any(|page| translate(dir, page.page_align_down()).is_some())
}

/// Find the lowest free run of `pages` pages inside `bounds`, first-fit.
#[must_use]
pub fn find_free_range(dir: &PageDirectory, bounds: VirtRegion, pages: usize) -> Option<VirtAddr> {
    if pages == 0 || !bounds.is_page_aligned() {
        return None;
    }

    let mut run_start = bounds.base();
    let mut run_length = 0usize;
    let mut va = bounds.base();

    while (va.as_u32() as u64) + PAGE_SIZE as u64 <= bounds.end() {
        // A missing directory entry makes the whole 4 MiB slot free, so the
        // table lookup only happens for slots that have one.
        let present = dir.entry_for(va).is_present()
            && existing_table(dir, va).is_some_and(|t| t.entry_for(va).is_present());

        if present {
            run_length = 0;
        } else {
            if run_length == 0 {
                run_start = va;
            }
            run_length += 1;
            if run_length >= pages {
                return Some(run_start);
            }
        }

        let next = va.as_u32().wrapping_add(PAGE_SIZE as u32);
        if next == 0 {
            // Wrapped around the top of the address space.
            return None;
        }
        va = VirtAddr::new(next);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{alloc_dir, ArenaAllocator};

    const USER_FLAGS: EntryFlags = EntryFlags::PRESENT
        .union(EntryFlags::WRITABLE)
        .union(EntryFlags::USER);

    #[test]
    fn test_map_translate_unmap() {
        let mut alloc = ArenaAllocator::new(32);
        let dir = alloc_dir(&mut alloc);

        let va = VirtAddr::new(0x4000_0000);
        let pa = alloc.allocate_table().unwrap();

        map_page(dir, va, pa, USER_FLAGS, &mut alloc).unwrap();
        assert_eq!(translate(dir, va), Some(pa));
        assert_eq!(
            translate(dir, va.offset(0x123)),
            Some(pa.offset(0x123)),
            "translation must preserve the page offset"
        );

        assert_eq!(unmap_page(dir, va).unwrap(), pa);
        assert_eq!(translate(dir, va), None);
    }

    #[test]
    fn test_double_map_fails() {
        let mut alloc = ArenaAllocator::new(32);
        let dir = alloc_dir(&mut alloc);

        let va = VirtAddr::new(0x4000_0000);
        let pa = alloc.allocate_table().unwrap();

        map_page(dir, va, pa, USER_FLAGS, &mut alloc).unwrap();
        assert_eq!(
            map_page(dir, va, pa, USER_FLAGS, &mut alloc),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn test_unmap_unmapped_fails() {
        let mut alloc = ArenaAllocator::new(32);
        let dir = alloc_dir(&mut alloc);

        assert_eq!(
            unmap_page(dir, VirtAddr::new(0x4000_0000)),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn test_misalignment_rejected() {
        let mut alloc = ArenaAllocator::new(32);
        let dir = alloc_dir(&mut alloc);

        assert_eq!(
            map_page(
                dir,
                VirtAddr::new(0x4000_0010),
                PhysAddr::new(0x1000),
                USER_FLAGS,
                &mut alloc
            ),
            Err(MapError::NotAligned)
        );
    }

    #[test]
    fn test_find_free_range_first_fit() {
        let mut alloc = ArenaAllocator::new(64);
        let dir = alloc_dir(&mut alloc);

        let bounds = VirtRegion::new(VirtAddr::new(0x4000_0000), 64 * PAGE_SIZE);

        // Empty directory: the very first page wins.
        assert_eq!(
            find_free_range(dir, bounds, 4),
            Some(VirtAddr::new(0x4000_0000))
        );

        // Occupy pages 0..3; a 4-page run must start at page 3.
        for i in 0..3 {
            let pa = alloc.allocate_table().unwrap();
            let va = VirtAddr::new(0x4000_0000 + (i * PAGE_SIZE) as u32);
            map_page(dir, va, pa, USER_FLAGS, &mut alloc).unwrap();
        }
        assert_eq!(
            find_free_range(dir, bounds, 4),
            Some(VirtAddr::new(0x4000_3000))
        );

        // A hole smaller than the request is skipped over.
        let pa = alloc.allocate_table().unwrap();
        map_page(dir, VirtAddr::new(0x4000_4000), pa, USER_FLAGS, &mut alloc).unwrap();
        assert_eq!(
            find_free_range(dir, bounds, 4),
            Some(VirtAddr::new(0x4000_5000))
        );
    }

    #[test]
    fn test_find_free_range_exhausted_bounds() {
        let mut alloc = ArenaAllocator::new(8);
        let dir = alloc_dir(&mut alloc);

        let bounds = VirtRegion::new(VirtAddr::new(0x4000_0000), 2 * PAGE_SIZE);
        assert_eq!(find_free_range(dir, bounds, 3), None);
    }

    #[test]
    fn test_any_present() {
        let mut alloc = ArenaAllocator::new(32);
        let dir = alloc_dir(&mut alloc);

        let region = VirtRegion::new(VirtAddr::new(0x4000_0000), 4 * PAGE_SIZE);
        assert!(!any_present(dir, region));

        let pa = alloc.allocate_table().unwrap();
        map_page(dir, VirtAddr::new(0x4000_2000), pa, USER_FLAGS, &mut alloc).unwrap();
        assert!(any_present(dir, region));
    }
}
