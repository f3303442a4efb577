//! # minos-common
//!
//! Types shared between the minos loader and the kernel: address newtypes,
//! page constants, the physical memory map, and the boot handover structure.
//!
//! Everything in this crate is `#[repr(C)]` or a transparent newtype so the
//! loader and the kernel agree on layout even when built separately.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod handover;
pub mod memory;

pub use addr::{PhysAddr, VirtAddr};
pub use handover::Handover;
pub use memory::{MemoryMap, MemoryRegion, MemoryRegionKind};
