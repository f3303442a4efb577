//! Address spaces
//!
//! An [`AddressSpace`] owns one page directory. The kernel space is a boot
//! singleton whose low-region page tables are allocated once and shared by
//! reference into every user space, so a change to kernel mappings is
//! visible everywhere without fan-out. User spaces own everything from
//! [`USER_BASE`](super::USER_BASE) up.
//!
//! Kernel-region memory is identity mapped: a kernel allocation returns a
//! virtual address equal to its physical one. User-region memory is backed
//! by whatever frames the allocator hands out.

use bitflags::bitflags;
use minos_common::memory::page;
use minos_common::{PhysAddr, VirtAddr};
use minos_paging::{
    mapping, EntryFlags, MapError, PageDirectory, TableAllocator, VirtRegion, ENTRIES_PER_TABLE,
    PAGE_SIZE,
};

use super::frame::FrameAllocator;
use super::{MemoryError, KERNEL_TABLE_COUNT, USER_BASE};

bitflags! {
    /// Flags for mapping and allocation requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u32 {
        /// Accessible from ring 3.
        const USER = 1 << 0;
        /// Zero-fill the backing frames.
        const CLEAR = 1 << 1;
    }
}

/// Where the memory behind a mapping came from. Decides whether retiring
/// the mapping releases frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// Frames allocated privately for this mapping; freed with it.
    Private,
    /// Identity-mapped device or loader memory; never freed.
    Identity,
    /// A window onto a shared object owned elsewhere; unmapped only.
    Shared,
}

/// One named range of a task's virtual address space.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapping {
    pub region: VirtRegion,
    pub kind: MappingKind,
}

/// Adapter feeding the kernel frame allocator to the page-table walkers.
///
/// Table frames must live in the shared low region so every directory can
/// reach them through the identity map.
struct TableFrames<'a>(&'a mut FrameAllocator);

impl TableAllocator for TableFrames<'_> {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        self.0
            .alloc_contiguous_below(1, PhysAddr::new(USER_BASE))
            .ok()
    }

    fn free_table(&mut self, frame: PhysAddr) {
        let _ = self.0.free(frame, 1);
    }
}

/// One page directory and its ownership class.
pub struct AddressSpace {
    directory: PhysAddr,
    user: bool,
}

impl AddressSpace {
    /// Create the kernel space.
    ///
    /// All [`KERNEL_TABLE_COUNT`] page tables of the low region are
    /// allocated up front. User directories alias these tables, so no
    /// kernel mapping ever needs to touch a user directory afterwards.
    pub(super) fn create_kernel(frames: &mut FrameAllocator) -> Result<Self, MemoryError> {
        let directory = frames.alloc_contiguous_below(1, PhysAddr::new(USER_BASE))?;
        let dir = unsafe { dir_mut(directory) };
        dir.zero();

        let mut tables = TableFrames(frames);
        for slot in 0..KERNEL_TABLE_COUNT {
            let table = tables
                .allocate_table()
                .ok_or(MemoryError::OutOfMemory)?;
            // SAFETY: Fresh frame, exclusively ours.
            unsafe { minos_paging::PageTable::from_phys(table) }.zero();
            dir.set_entry(
                slot,
                minos_paging::Entry::new(table, EntryFlags::PRESENT | EntryFlags::WRITABLE),
            );
        }

        Ok(Self {
            directory,
            user: false,
        })
    }

    /// Create a user space sharing the kernel's low-region tables.
    pub(super) fn create_user(
        frames: &mut FrameAllocator,
        kernel: &AddressSpace,
    ) -> Result<Self, MemoryError> {
        let directory = frames.alloc_contiguous_below(1, PhysAddr::new(USER_BASE))?;
        let dir = unsafe { dir_mut(directory) };
        dir.zero();

        let kernel_dir = unsafe { dir_mut(kernel.directory) };
        for slot in 0..KERNEL_TABLE_COUNT {
            dir.set_entry(slot, kernel_dir.entry(slot));
        }

        Ok(Self {
            directory,
            user: true,
        })
    }

    /// Physical address of the page directory, the value loaded into CR3.
    #[inline]
    #[must_use]
    pub fn directory_phys(&self) -> PhysAddr {
        self.directory
    }

    #[inline]
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.user
    }

    /// Load this space's directory into the address-space root register.
    pub fn switch(&self) {
        minos_arch::cpu::load_page_directory(self.directory.as_u32());
    }

    /// Check a range for the boundary rules: page-aligned, non-wrapping,
    /// and entirely on one side of the kernel/user split.
    fn check_range(&self, region: VirtRegion, flags: MemoryFlags) -> Result<(), MemoryError> {
        if !region.is_page_aligned() || region.end() > 1u64 << 32 {
            return Err(MemoryError::Invalid);
        }

        let starts_in_kernel = region.base().as_u32() < USER_BASE;
        let ends_in_kernel = region.end() <= USER_BASE as u64;
        if starts_in_kernel != ends_in_kernel {
            // Crossing the kernel/user boundary.
            return Err(MemoryError::Invalid);
        }
        if starts_in_kernel && flags.contains(MemoryFlags::USER) {
            return Err(MemoryError::Invalid);
        }

        Ok(())
    }

    fn entry_flags(flags: MemoryFlags) -> EntryFlags {
        let mut entry = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if flags.contains(MemoryFlags::USER) {
            entry |= EntryFlags::USER;
        }
        entry
    }

    /// Map `region`, allocating a backing frame per page.
    ///
    /// Fails `AlreadyMapped` without side effects if any page of the range
    /// is already present.
    pub(super) fn map(
        &mut self,
        frames: &mut FrameAllocator,
        region: VirtRegion,
        flags: MemoryFlags,
    ) -> Result<(), MemoryError> {
        self.check_range(region, flags)?;

        let dir = unsafe { dir_mut(self.directory) };
        if mapping::any_present(dir, region) {
            return Err(MemoryError::AlreadyMapped);
        }

        let entry_flags = Self::entry_flags(flags);
        let mut mapped = 0usize;

        for va in region.pages() {
            let frame = match frames.alloc() {
                Ok(frame) => frame,
                Err(e) => {
                    self.unwind(frames, region, mapped, true);
                    return Err(e);
                }
            };

            if flags.contains(MemoryFlags::CLEAR) {
                // SAFETY: Fresh frame, exclusively ours until mapped.
                unsafe {
                    core::ptr::write_bytes(
                        minos_paging::phys_to_ptr::<u8>(frame),
                        0,
                        PAGE_SIZE,
                    );
                }
            }

            let mut tables = TableFrames(frames);
            if let Err(e) = mapping::map_page(dir, va, frame, entry_flags, &mut tables) {
                let _ = frames.free(frame, 1);
                self.unwind(frames, region, mapped, true);
                return Err(e.into());
            }
            mapped += 1;
        }

        Ok(())
    }

    /// Map `region` with virtual equal to physical.
    ///
    /// With `reserve_frames`, the covered frames are marked used when they
    /// fall inside managed RAM; device windows and loader carry-over want
    /// that. The boot-time identity map of RAM itself does not: those
    /// frames stay allocatable, and kernel allocations simply land on
    /// already-mapped addresses.
    pub(super) fn map_identity(
        &mut self,
        frames: &mut FrameAllocator,
        region: VirtRegion,
        flags: MemoryFlags,
        reserve_frames: bool,
    ) -> Result<(), MemoryError> {
        self.check_range(region, flags)?;

        let dir = unsafe { dir_mut(self.directory) };
        if mapping::any_present(dir, region) {
            return Err(MemoryError::AlreadyMapped);
        }

        if reserve_frames {
            frames.mark_used(
                PhysAddr::new(region.base().as_u32()),
                region.page_count(),
            );
        }

        let entry_flags = Self::entry_flags(flags);
        let mut mapped = 0usize;
        for va in region.pages() {
            let mut tables = TableFrames(frames);
            if let Err(e) = mapping::map_page(
                dir,
                va,
                PhysAddr::new(va.as_u32()),
                entry_flags,
                &mut tables,
            ) {
                self.unwind(frames, region, mapped, false);
                return Err(e.into());
            }
            mapped += 1;
        }

        Ok(())
    }

    /// Allocate `size` bytes of fresh memory in the appropriate half.
    ///
    /// Zero bytes succeeds without touching anything and returns the null
    /// address. Kernel allocations are identity placed, so the returned
    /// virtual address equals the physical one and is valid in every
    /// address space.
    pub(super) fn alloc(
        &mut self,
        frames: &mut FrameAllocator,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<VirtAddr, MemoryError> {
        if size == 0 {
            return Ok(VirtAddr::NULL);
        }
        let pages = page::count(size);

        if flags.contains(MemoryFlags::USER) {
            let dir = unsafe { dir_mut(self.directory) };
            let bounds = VirtRegion::new(
                VirtAddr::new(USER_BASE),
                (super::USER_STACK_BASE - USER_BASE) as usize,
            );
            let base = mapping::find_free_range(dir, bounds, pages)
                .ok_or(MemoryError::OutOfMemory)?;
            let region = VirtRegion::from_pages(base, pages);
            self.map(frames, region, flags)?;
            Ok(base)
        } else {
            // Identity placement: the free virtual run is the free physical
            // run.
            let base = frames.alloc_contiguous_below(pages, PhysAddr::new(USER_BASE))?;
            let region = VirtRegion::from_pages(VirtAddr::new(base.as_u32()), pages);

            if flags.contains(MemoryFlags::CLEAR) {
                // SAFETY: Freshly allocated run, exclusively ours.
                unsafe {
                    core::ptr::write_bytes(
                        minos_paging::phys_to_ptr::<u8>(base),
                        0,
                        pages * PAGE_SIZE,
                    );
                }
            }

            let dir = unsafe { dir_mut(self.directory) };
            let entry_flags = Self::entry_flags(flags);
            for va in region.pages() {
                let mut tables = TableFrames(frames);
                match mapping::map_page(
                    dir,
                    va,
                    PhysAddr::new(va.as_u32()),
                    entry_flags,
                    &mut tables,
                ) {
                    Ok(()) => {}
                    Err(MapError::AlreadyMapped) => {
                        // The kernel region is also reachable through
                        // earlier identity maps; a frame below an existing
                        // mapping stays usable as long as the translation
                        // agrees, which identity placement guarantees.
                    }
                    Err(e) => {
                        let _ = frames.free(base, pages);
                        return Err(e.into());
                    }
                }
            }

            Ok(VirtAddr::new(base.as_u32()))
        }
    }

    /// Unmap `region` and free the backing frames.
    pub(super) fn free(
        &mut self,
        frames: &mut FrameAllocator,
        region: VirtRegion,
    ) -> Result<(), MemoryError> {
        self.release(frames, region, true)
    }

    /// Unmap `region` without freeing frames (identity and shared
    /// mappings).
    pub(super) fn unmap(
        &mut self,
        frames: &mut FrameAllocator,
        region: VirtRegion,
    ) -> Result<(), MemoryError> {
        self.release(frames, region, false)
    }

    fn release(
        &mut self,
        frames: &mut FrameAllocator,
        region: VirtRegion,
        free_frames: bool,
    ) -> Result<(), MemoryError> {
        if !region.is_page_aligned() {
            return Err(MemoryError::Invalid);
        }

        let dir = unsafe { dir_mut(self.directory) };
        for va in region.pages() {
            match mapping::unmap_page(dir, va) {
                Ok(frame) => {
                    if free_frames {
                        let _ = frames.free(frame, 1);
                    }
                }
                // Tolerate holes: a partially built mapping is released the
                // same way as a complete one.
                Err(MapError::NotMapped) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.reclaim_empty_tables(frames, region);
        Ok(())
    }

    /// Free user-half page tables that `release` just emptied, so a
    /// map/free round trip restores the physical-used count exactly.
    fn reclaim_empty_tables(&mut self, frames: &mut FrameAllocator, region: VirtRegion) {
        if !self.user || region.is_empty() {
            return;
        }

        let dir = unsafe { dir_mut(self.directory) };
        let first_slot = region.base().directory_index();
        let last_va = (region.end() as u32).wrapping_sub(PAGE_SIZE as u32);
        let last_slot = VirtAddr::new(last_va).directory_index();

        for slot in first_slot..=last_slot {
            if slot < KERNEL_TABLE_COUNT {
                continue;
            }
            let entry = dir.entry(slot);
            if entry.is_present() {
                // SAFETY: Present user-half entries point at tables owned
                // by this directory.
                let table = unsafe { minos_paging::PageTable::from_phys(entry.frame()) };
                if table.is_empty() {
                    let _ = frames.free(entry.frame(), 1);
                    dir.set_entry(slot, minos_paging::Entry::EMPTY);
                }
            }
        }
    }

    /// Roll back the first `mapped` pages of a failed `map`.
    fn unwind(
        &mut self,
        frames: &mut FrameAllocator,
        region: VirtRegion,
        mapped: usize,
        free_frames: bool,
    ) {
        let dir = unsafe { dir_mut(self.directory) };
        for va in region.pages().take(mapped) {
            if let Ok(frame) = mapping::unmap_page(dir, va) {
                if free_frames {
                    let _ = frames.free(frame, 1);
                }
            }
        }
    }

    /// Translate a virtual address through this space.
    #[must_use]
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let dir = unsafe { dir_mut(self.directory) };
        mapping::translate(dir, va)
    }

    /// Copy `data` into this space at `va`, which must be mapped.
    ///
    /// Walks the tables and writes through the physical window, so it works
    /// on a space that is not the active one.
    pub fn write_bytes(&self, va: VirtAddr, data: &[u8]) -> Result<(), MemoryError> {
        let mut offset = 0usize;
        while offset < data.len() {
            let addr = va.offset(offset as u32);
            let pa = self.translate(addr).ok_or(MemoryError::Invalid)?;
            let chunk = (PAGE_SIZE - addr.page_offset()).min(data.len() - offset);
            // SAFETY: The translation proves the page is mapped and owned
            // by this space; the chunk stays inside one page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr().add(offset),
                    minos_paging::phys_to_ptr::<u8>(pa),
                    chunk,
                );
            }
            offset += chunk;
        }
        Ok(())
    }

    /// Destroy a user space: free the user-half page tables and the
    /// directory itself.
    ///
    /// The caller has already retired every mapping, so any frames still
    /// referenced from the user half would be a leak; only table frames are
    /// released here. The shared kernel tables are left alone.
    pub(super) fn destroy(self, frames: &mut FrameAllocator) {
        debug_assert!(self.user, "the kernel space is never destroyed");

        let dir = unsafe { dir_mut(self.directory) };
        for slot in KERNEL_TABLE_COUNT..ENTRIES_PER_TABLE {
            let entry = dir.entry(slot);
            if entry.is_present() {
                let _ = frames.free(entry.frame(), 1);
            }
        }
        let _ = frames.free(self.directory, 1);
    }

    /// True when the low-region directory entries are identical to the
    /// kernel space's. Holds for every live space at every instant.
    #[must_use]
    pub fn kernel_region_matches(&self, kernel: &AddressSpace) -> bool {
        let dir = unsafe { dir_mut(self.directory) };
        let kernel_dir = unsafe { dir_mut(kernel.directory) };
        (0..KERNEL_TABLE_COUNT).all(|slot| dir.entry(slot) == kernel_dir.entry(slot))
    }
}

/// Borrow the directory behind a root frame.
///
/// # Safety
///
/// Callers hold `&self`/`&mut self` of the owning `AddressSpace`, which is
/// the exclusive owner of the frame; directories are only reachable through
/// their space.
unsafe fn dir_mut(directory: PhysAddr) -> &'static mut PageDirectory {
    // SAFETY: See above.
    unsafe { PageDirectory::from_phys(directory) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{USER_STACK_BASE, USER_STACK_SIZE};
    use crate::tests_support::arena;

    #[test]
    fn test_map_free_restores_used_count() {
        let mut memory = arena::memory(1024);
        let mut space = memory.create_user_space().unwrap();

        let used_before = memory.used();
        let region = VirtRegion::new(VirtAddr::new(0x4000_0000), 4 * PAGE_SIZE);

        memory.map_user(&mut space, region, MemoryFlags::USER).unwrap();
        assert!(memory.used() > used_before);

        memory.free_user(&mut space, region).unwrap();
        assert_eq!(memory.used(), used_before);

        memory.destroy_user_space(space);
    }

    #[test]
    fn test_space_create_destroy_restores_used_count() {
        let mut memory = arena::memory(1024);
        let used_before = memory.used();

        let mut space = memory.create_user_space().unwrap();
        let region = VirtRegion::new(VirtAddr::new(0x5000_0000), 2 * PAGE_SIZE);
        memory.map_user(&mut space, region, MemoryFlags::USER).unwrap();
        memory.free_user(&mut space, region).unwrap();
        memory.destroy_user_space(space);

        assert_eq!(memory.used(), used_before);
    }

    #[test]
    fn test_kernel_region_shared_into_user_spaces() {
        let mut memory = arena::memory(1024);
        let space = memory.create_user_space().unwrap();

        assert!(space.kernel_region_matches(memory.kernel_space()));

        // A kernel allocation made after the user space exists must be
        // visible through it without any fan-out.
        let va = memory.alloc_kernel(PAGE_SIZE, MemoryFlags::CLEAR).unwrap();
        assert!(space.kernel_region_matches(memory.kernel_space()));
        assert_eq!(
            space.translate(va),
            Some(PhysAddr::new(va.as_u32())),
            "identity-placed kernel memory must translate in user spaces"
        );

        memory.free_kernel(VirtRegion::new(va, PAGE_SIZE)).unwrap();
        memory.destroy_user_space(space);
    }

    #[test]
    fn test_boundary_crossing_rejected() {
        let mut memory = arena::memory(1024);
        let mut space = memory.create_user_space().unwrap();

        // Straddles the kernel/user split.
        let region = VirtRegion::new(VirtAddr::new(USER_BASE - PAGE_SIZE as u32), 2 * PAGE_SIZE);
        assert_eq!(
            memory.map_user(&mut space, region, MemoryFlags::USER),
            Err(MemoryError::Invalid)
        );

        // USER pages cannot live in the kernel region.
        let region = VirtRegion::new(VirtAddr::new(0x0100_0000), PAGE_SIZE);
        assert_eq!(
            memory.map_user(&mut space, region, MemoryFlags::USER),
            Err(MemoryError::Invalid)
        );

        memory.destroy_user_space(space);
    }

    #[test]
    fn test_zero_byte_alloc_succeeds_without_frames() {
        let mut memory = arena::memory(1024);
        let mut space = memory.create_user_space().unwrap();
        let used_before = memory.used();

        let va = memory.alloc_user(&mut space, 0, MemoryFlags::empty()).unwrap();
        assert!(va.is_null());
        assert_eq!(memory.used(), used_before);

        memory.destroy_user_space(space);
    }

    #[test]
    fn test_double_map_rejected_without_side_effects() {
        let mut memory = arena::memory(1024);
        let mut space = memory.create_user_space().unwrap();

        let region = VirtRegion::new(VirtAddr::new(0x4000_0000), 2 * PAGE_SIZE);
        memory.map_user(&mut space, region, MemoryFlags::USER).unwrap();
        let used = memory.used();

        // Overlapping by one page is enough to fail the whole request.
        let overlap = VirtRegion::new(VirtAddr::new(0x4000_1000), 2 * PAGE_SIZE);
        assert_eq!(
            memory.map_user(&mut space, overlap, MemoryFlags::USER),
            Err(MemoryError::AlreadyMapped)
        );
        assert_eq!(memory.used(), used, "failed map must not leak frames");

        memory.free_user(&mut space, region).unwrap();
        memory.destroy_user_space(space);
    }

    #[test]
    fn test_user_alloc_first_fit() {
        let mut memory = arena::memory(1024);
        let mut space = memory.create_user_space().unwrap();

        let a = memory.alloc_user(&mut space, PAGE_SIZE, MemoryFlags::empty()).unwrap();
        let b = memory.alloc_user(&mut space, PAGE_SIZE, MemoryFlags::empty()).unwrap();
        assert_eq!(a, VirtAddr::new(USER_BASE));
        assert_eq!(b, VirtAddr::new(USER_BASE + PAGE_SIZE as u32));

        // Free the first page; the next single-page allocation reuses it.
        memory.free_user(&mut space, VirtRegion::new(a, PAGE_SIZE)).unwrap();
        let c = memory.alloc_user(&mut space, PAGE_SIZE, MemoryFlags::empty()).unwrap();
        assert_eq!(c, a);

        memory.destroy_user_space(space);
    }

    #[test]
    fn test_write_bytes_into_inactive_space() {
        let mut memory = arena::memory(1024);
        let mut space = memory.create_user_space().unwrap();

        let stack = VirtRegion::new(VirtAddr::new(USER_STACK_BASE), USER_STACK_SIZE);
        memory
            .map_user(&mut space, stack, MemoryFlags::USER | MemoryFlags::CLEAR)
            .unwrap();

        let payload = b"argv[0]";
        let va = VirtAddr::new(USER_STACK_BASE + 0x0F80);
        space.write_bytes(va, payload).unwrap();

        let pa = space.translate(va).unwrap();
        // SAFETY: The translation points into the test arena.
        let read = unsafe {
            core::slice::from_raw_parts(minos_paging::phys_to_ptr::<u8>(pa), payload.len())
        };
        assert_eq!(read, payload);

        // Writing through an unmapped address reports Invalid.
        assert_eq!(
            space.write_bytes(VirtAddr::new(0x9000_0000), payload),
            Err(MemoryError::Invalid)
        );

        memory.free_user(&mut space, stack).unwrap();
        memory.destroy_user_space(space);
    }

    #[test]
    fn test_identity_device_window_retire() {
        let mut memory = arena::memory(1024);
        let mut space = memory.create_user_space().unwrap();

        // A device window well outside managed RAM, mapped into user
        // space at its own address.
        let region = VirtRegion::new(VirtAddr::new(0xE000_0000), 2 * PAGE_SIZE);
        memory
            .map_identity_user(&mut space, region, MemoryFlags::USER)
            .unwrap();
        assert_eq!(
            space.translate(VirtAddr::new(0xE000_1000)),
            Some(PhysAddr::new(0xE000_1000))
        );

        // Retiring an identity mapping unmaps but never frees the device
        // frames; only the emptied page table comes back.
        let used = memory.used();
        memory
            .retire_mapping(
                &mut space,
                &MemoryMapping {
                    region,
                    kind: MappingKind::Identity,
                },
            )
            .unwrap();
        assert_eq!(memory.used(), used - PAGE_SIZE);
        assert_eq!(space.translate(VirtAddr::new(0xE000_1000)), None);

        memory.destroy_user_space(space);
    }

    #[test]
    fn test_clear_flag_zero_fills() {
        let mut memory = arena::memory(1024);

        // Dirty a frame, free it, then demand a cleared allocation and
        // check the recycled frame really is zeroed.
        let va = memory.alloc_kernel(PAGE_SIZE, MemoryFlags::empty()).unwrap();
        // SAFETY: Identity-placed kernel allocation inside the arena.
        unsafe {
            core::ptr::write_bytes(
                minos_paging::phys_to_ptr::<u8>(PhysAddr::new(va.as_u32())),
                0xAA,
                PAGE_SIZE,
            );
        }
        memory.free_kernel(VirtRegion::new(va, PAGE_SIZE)).unwrap();

        let va = memory.alloc_kernel(PAGE_SIZE, MemoryFlags::CLEAR).unwrap();
        // SAFETY: As above.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                minos_paging::phys_to_ptr::<u8>(PhysAddr::new(va.as_u32())),
                PAGE_SIZE,
            )
        };
        assert!(bytes.iter().all(|&b| b == 0));

        memory.free_kernel(VirtRegion::new(va, PAGE_SIZE)).unwrap();
    }
}
