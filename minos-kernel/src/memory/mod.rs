//! Memory management
//!
//! Owns the physical frame allocator and the kernel address space, and
//! mediates every mapping operation on user spaces. Initialised exactly
//! once from the boot handover; afterwards reachable through
//! [`with_memory`].
//!
//! # Layout
//!
//! ```text
//! 0x0000_0000 .. 0x4000_0000   kernel region: identity mapped, shared
//!                              (page tables allocated once at boot)
//! 0x4000_0000 .. 0xFF00_0000   user code, data and heap (per task)
//! 0xFF00_0000 .. 0xFF00_1000   user stack (per task, fixed address)
//! ```

use minos_arch::IrqSpinMutex;
use minos_common::memory::page;
use minos_common::{Handover, PhysAddr, VirtAddr};
use minos_paging::{MapError, VirtRegion};

pub mod frame;
pub mod space;

#[cfg(target_arch = "x86")]
mod heap;

pub use space::{AddressSpace, MappingKind, MemoryFlags, MemoryMapping};

use frame::FrameAllocator;

/// First user-space address; everything below is the shared kernel region.
pub const USER_BASE: u32 = 0x4000_0000;

/// Directory slots covered by the kernel region.
pub const KERNEL_TABLE_COUNT: usize = (USER_BASE >> 22) as usize;

/// Fixed virtual address of every user stack.
pub const USER_STACK_BASE: u32 = 0xFF00_0000;

/// Size of a user stack.
pub const USER_STACK_SIZE: usize = page::SIZE;

/// Size of a kernel stack.
pub const KERNEL_STACK_SIZE: usize = page::SIZE;

/// Result codes of memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No frames, or no free virtual run of the requested length.
    OutOfMemory,
    /// A page in the requested range is already mapped.
    AlreadyMapped,
    /// The page is not mapped.
    NotMapped,
    /// Misaligned, boundary-crossing or otherwise malformed request.
    Invalid,
}

impl From<MapError> for MemoryError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::AlreadyMapped => Self::AlreadyMapped,
            MapError::NotMapped => Self::NotMapped,
            MapError::NotAligned => Self::Invalid,
            MapError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// The memory manager: frame allocator plus kernel space.
pub struct Memory {
    frames: FrameAllocator,
    kernel: AddressSpace,
}

impl Memory {
    /// Build a manager over an already-constructed frame allocator.
    ///
    /// Creates the kernel space with its full set of shared page tables.
    /// Tests construct their managers through this; boot wraps it in
    /// [`init`].
    pub fn with_frames(mut frames: FrameAllocator) -> Result<Self, MemoryError> {
        let kernel = AddressSpace::create_kernel(&mut frames)?;
        Ok(Self { frames, kernel })
    }

    /// The kernel address space.
    #[must_use]
    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    /// Bytes of physical memory in use.
    #[must_use]
    pub fn used(&self) -> usize {
        self.frames.used()
    }

    /// Bytes of physical memory managed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.frames.total()
    }

    /// Allocate kernel memory. The address is identity placed and valid in
    /// every address space.
    pub fn alloc_kernel(
        &mut self,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<VirtAddr, MemoryError> {
        debug_assert!(!flags.contains(MemoryFlags::USER));
        self.kernel.alloc(&mut self.frames, size, flags)
    }

    /// Free a kernel allocation.
    pub fn free_kernel(&mut self, region: VirtRegion) -> Result<(), MemoryError> {
        self.kernel.free(&mut self.frames, region)
    }

    /// Map a range into the kernel region with virtual equal to physical,
    /// reserving the covered frames.
    pub fn map_identity_kernel(
        &mut self,
        region: VirtRegion,
        flags: MemoryFlags,
    ) -> Result<(), MemoryError> {
        self.kernel.map_identity(&mut self.frames, region, flags, true)
    }

    /// Boot-time identity map of managed RAM into the kernel region.
    ///
    /// The frames stay allocatable; kernel allocations land on addresses
    /// that are already mapped by this, which is exactly the identity
    /// placement contract.
    fn identity_map_ram(&mut self, region: VirtRegion) -> Result<(), MemoryError> {
        self.kernel
            .map_identity(&mut self.frames, region, MemoryFlags::empty(), false)
    }

    /// Create a fresh user address space.
    pub fn create_user_space(&mut self) -> Result<AddressSpace, MemoryError> {
        AddressSpace::create_user(&mut self.frames, &self.kernel)
    }

    /// Destroy a user address space whose mappings are already retired.
    pub fn destroy_user_space(&mut self, space: AddressSpace) {
        space.destroy(&mut self.frames);
    }

    /// Map a range into a user space.
    pub fn map_user(
        &mut self,
        space: &mut AddressSpace,
        region: VirtRegion,
        flags: MemoryFlags,
    ) -> Result<(), MemoryError> {
        space.map(&mut self.frames, region, flags)
    }

    /// Map a device or loader range into a user space, virtual equal to
    /// physical.
    pub fn map_identity_user(
        &mut self,
        space: &mut AddressSpace,
        region: VirtRegion,
        flags: MemoryFlags,
    ) -> Result<(), MemoryError> {
        space.map_identity(&mut self.frames, region, flags, true)
    }

    /// Allocate user memory at the lowest free range.
    pub fn alloc_user(
        &mut self,
        space: &mut AddressSpace,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<VirtAddr, MemoryError> {
        space.alloc(&mut self.frames, size, flags | MemoryFlags::USER)
    }

    /// Retire one mapping, releasing frames according to its kind.
    pub fn retire_mapping(
        &mut self,
        space: &mut AddressSpace,
        mapping: &MemoryMapping,
    ) -> Result<(), MemoryError> {
        match mapping.kind {
            MappingKind::Private => space.free(&mut self.frames, mapping.region),
            MappingKind::Identity | MappingKind::Shared => {
                space.unmap(&mut self.frames, mapping.region)
            }
        }
    }

    /// Free a range of a user space, releasing the backing frames.
    pub fn free_user(
        &mut self,
        space: &mut AddressSpace,
        region: VirtRegion,
    ) -> Result<(), MemoryError> {
        space.free(&mut self.frames, region)
    }

    /// Log a summary of physical memory usage.
    pub fn dump(&self) {
        log::info!(
            "memory: {} KiB used of {} KiB ({} frames free)",
            self.used() / 1024,
            self.total() / 1024,
            self.frames.free_count()
        );
    }
}

// -- Global instance

static MEMORY: IrqSpinMutex<Option<Memory>> = IrqSpinMutex::new(None);

/// Initialise memory management from the boot handover. A distinct boot
/// step, called exactly once before tasking starts.
///
/// # Panics
///
/// Panics on a corrupt handover or when the machine has no usable RAM;
/// there is nothing to fall back to this early.
pub fn init(handover: &Handover) {
    assert!(handover.is_valid(), "corrupt boot handover");

    // RAM above the user split cannot be reached through the kernel's
    // identity region, so this kernel does not manage it.
    let mut map = minos_common::MemoryMap::empty();
    for region in handover.memory_map.iter() {
        if region.base.as_u32() >= USER_BASE {
            continue;
        }
        let mut trimmed = *region;
        if trimmed.end() > USER_BASE as u64 {
            trimmed.size = USER_BASE - trimmed.base.as_u32();
        }
        map.regions[map.entry_count as usize] = trimmed;
        map.entry_count += 1;
    }
    if map.total_usable() < handover.memory_map.total_usable() {
        log::warn!("memory: ignoring RAM above {:#010x}", USER_BASE);
    }

    let bitmap = frame::take_static_bitmap();
    let mut frames = FrameAllocator::new(bitmap, &map);

    // The low megabyte (BIOS, loader structures) and the kernel image are
    // off limits.
    frames.mark_used(PhysAddr::NULL, 0x0010_0000 / page::SIZE);
    frames.mark_used(
        handover.kernel_start,
        page::count(handover.kernel_size() as usize),
    );

    let mut memory = Memory::with_frames(frames).expect("kernel address space creation failed");

    // Identity map everything the kernel must keep reaching once its
    // directory is live: the loader's low structures, the running image,
    // the page tables, and all of managed RAM up to the user split.
    let ram_top = map
        .max_usable_addr()
        .max(handover.kernel_end.as_u32() as u64)
        .min(USER_BASE as u64);
    let identity_end = page::align_up(ram_top as usize);
    memory
        .identity_map_ram(VirtRegion::new(VirtAddr::NULL, identity_end))
        .expect("identity mapping RAM failed");

    if handover.framebuffer.is_present() {
        let fb = &handover.framebuffer;
        let region = VirtRegion::new(
            VirtAddr::new(fb.base.as_u32()),
            page::align_up(fb.size()),
        );
        if let Err(e) = memory.map_identity_kernel(region, MemoryFlags::empty()) {
            log::warn!("memory: framebuffer mapping failed: {:?}", e);
        }
    }

    memory.kernel_space().switch();
    minos_arch::cpu::enable_paging();

    #[cfg(target_arch = "x86")]
    heap::init(&mut memory);

    log::info!(
        "memory: {} MiB usable, kernel image {} KiB",
        memory.total() / (1024 * 1024),
        handover.kernel_size() / 1024
    );

    *MEMORY.lock() = Some(memory);
}

/// Run `f` with the memory manager locked.
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn with_memory<R>(f: impl FnOnce(&mut Memory) -> R) -> R {
    let mut guard = MEMORY.lock();
    let memory = guard.as_mut().expect("memory manager not initialised");
    f(memory)
}

/// Bytes of physical memory in use.
#[must_use]
pub fn used() -> usize {
    with_memory(|m| m.used())
}

/// Bytes of physical memory managed.
#[must_use]
pub fn total() -> usize {
    with_memory(|m| m.total())
}
