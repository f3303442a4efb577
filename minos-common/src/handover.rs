//! Boot Handover Protocol
//!
//! The loader hands the kernel a single `Handover` structure describing the
//! machine: the physical memory map, the framebuffer, the command line, and
//! the bounds of the loaded kernel image. It is consumed exactly once, during
//! memory initialisation.

use crate::addr::PhysAddr;
use crate::memory::MemoryMap;

/// Magic number for handover validation: "MNOS" as little-endian u32.
pub const HANDOVER_MAGIC: u32 = 0x534F_4E4D;

/// Handover structure version.
pub const HANDOVER_VERSION: u32 = 2;

/// Maximum length of the kernel command line, including the terminator.
pub const COMMAND_LINE_SIZE: usize = 256;

/// Early framebuffer description.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FramebufferInfo {
    /// Physical base address of the framebuffer, 0 if none.
    pub base: PhysAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per row.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u32,
}

impl FramebufferInfo {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            base: PhysAddr::NULL,
            width: 0,
            height: 0,
            pitch: 0,
            bpp: 0,
        }
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        !self.base.is_null() && self.width != 0 && self.height != 0
    }

    /// Size of the framebuffer in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        (self.pitch * self.height) as usize
    }
}

/// Boot handover passed from the loader to the kernel.
///
/// Fixed `#[repr(C)]` layout so the loader and the kernel agree even when
/// built separately.
#[derive(Debug)]
#[repr(C)]
pub struct Handover {
    /// Must equal [`HANDOVER_MAGIC`].
    pub magic: u32,
    /// Must equal [`HANDOVER_VERSION`].
    pub version: u32,
    /// Physical memory map.
    pub memory_map: MemoryMap,
    /// Early framebuffer, if the loader set one up.
    pub framebuffer: FramebufferInfo,
    /// NUL-terminated kernel command line.
    pub command_line: [u8; COMMAND_LINE_SIZE],
    /// Physical address of the first byte of the kernel image.
    pub kernel_start: PhysAddr,
    /// Physical address one past the last byte of the kernel image
    /// (including BSS).
    pub kernel_end: PhysAddr,
}

impl Handover {
    /// Check magic and version.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == HANDOVER_MAGIC && self.version == HANDOVER_VERSION
    }

    /// The command line as a string slice, up to the first NUL.
    #[must_use]
    pub fn command_line(&self) -> &str {
        let len = self
            .command_line
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.command_line.len());
        core::str::from_utf8(&self.command_line[..len]).unwrap_or("")
    }

    /// Size of the kernel image in bytes.
    #[must_use]
    pub const fn kernel_size(&self) -> u32 {
        self.kernel_end.as_u32() - self.kernel_start.as_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Handover {
        let mut h = Handover {
            magic: HANDOVER_MAGIC,
            version: HANDOVER_VERSION,
            memory_map: MemoryMap::empty(),
            framebuffer: FramebufferInfo::empty(),
            command_line: [0; COMMAND_LINE_SIZE],
            kernel_start: PhysAddr::new(0x0010_0000),
            kernel_end: PhysAddr::new(0x0018_0000),
        };
        h.command_line[..6].copy_from_slice(b"quiet\0");
        h
    }

    #[test]
    fn test_validation() {
        let mut h = sample();
        assert!(h.is_valid());
        h.magic = 0;
        assert!(!h.is_valid());
    }

    #[test]
    fn test_command_line() {
        let h = sample();
        assert_eq!(h.command_line(), "quiet");
        assert_eq!(h.kernel_size(), 0x0008_0000);
    }
}
