//! Physical frame allocator
//!
//! A bitmap over physical RAM, one bit per 4 KiB frame: 1 means allocated,
//! 0 means free. Allocation is first-fit from a search hint; freeing
//! re-arms the hint to the freed range, which keeps bursty allocate/free
//! patterns from crawling up the address space.

use minos_common::memory::page;
use minos_common::{MemoryMap, PhysAddr};

use super::MemoryError;

/// Bits per bitmap word.
const BITS_PER_WORD: usize = 64;

/// Bitmap words covering every frame the kernel can manage, which is the
/// identity-reachable region below the user split.
pub const BITMAP_WORDS: usize = super::USER_BASE as usize / page::SIZE / BITS_PER_WORD;

/// Hand out the boot-time bitmap storage, 128 KiB of BSS sized for the
/// largest supported machine.
///
/// # Panics
///
/// Panics on a second call; the storage has exactly one owner.
pub(super) fn take_static_bitmap() -> &'static mut [u64] {
    use core::sync::atomic::{AtomicBool, Ordering};

    static TAKEN: AtomicBool = AtomicBool::new(false);
    static mut BITMAP: [u64; BITMAP_WORDS] = [0; BITMAP_WORDS];

    assert!(
        !TAKEN.swap(true, Ordering::SeqCst),
        "frame bitmap already taken"
    );
    // SAFETY: The TAKEN flag guarantees exclusive access from here on.
    unsafe { &mut *core::ptr::addr_of_mut!(BITMAP) }
}

/// Physical frame allocator.
///
/// # Invariants
///
/// - `free_frames` equals the number of zero bits inside the managed range.
/// - `bitmap.len() * 64 >= frame span`.
pub struct FrameAllocator {
    /// One bit per frame, offset from `first_frame`.
    bitmap: &'static mut [u64],
    /// First frame number this allocator manages.
    first_frame: usize,
    /// Number of frames managed.
    total_frames: usize,
    /// Free frames remaining.
    free_frames: usize,
    /// Where the next first-fit search starts.
    search_hint: usize,
}

impl FrameAllocator {
    /// Build an allocator over the usable regions of `memory_map`.
    ///
    /// Every frame starts out allocated; usable regions are then freed, so
    /// holes in the map stay permanently reserved.
    ///
    /// # Panics
    ///
    /// Panics if the bitmap is too small for the usable span or the map has
    /// no usable memory.
    pub fn new(bitmap: &'static mut [u64], memory_map: &MemoryMap) -> Self {
        let mut min_addr = u64::MAX;
        let mut max_addr = 0u64;

        for region in memory_map.iter() {
            if region.kind.is_usable() {
                min_addr = min_addr.min(region.base.as_u32() as u64);
                max_addr = max_addr.max(region.end());
            }
        }
        assert!(min_addr < max_addr, "no usable memory in the handover map");

        // Frame numbers fit comfortably even on the 32-bit target; the u64
        // arithmetic only exists so a map touching 4 GiB works.
        let first_frame = (min_addr / page::SIZE as u64) as usize;
        let last_frame = (max_addr.div_ceil(page::SIZE as u64)) as usize;
        let total_frames = last_frame - first_frame;

        let required_words = total_frames.div_ceil(BITS_PER_WORD);
        assert!(
            bitmap.len() >= required_words,
            "frame bitmap too small: need {} words, have {}",
            required_words,
            bitmap.len()
        );

        // Allocated until proven usable.
        for word in bitmap.iter_mut() {
            *word = !0;
        }

        let mut allocator = Self {
            bitmap,
            first_frame,
            total_frames,
            free_frames: 0,
            search_hint: 0,
        };

        for region in memory_map.iter() {
            if region.kind.is_usable() {
                let start = page::align_up(region.base.as_u32() as usize) / page::SIZE;
                let end = (region.end() / page::SIZE as u64) as usize;
                if end > start {
                    allocator.release_frames(start, end - start);
                }
            }
        }

        allocator
    }

    #[inline]
    fn position(&self, relative: usize) -> (usize, usize) {
        (relative / BITS_PER_WORD, relative % BITS_PER_WORD)
    }

    #[inline]
    fn is_free(&self, relative: usize) -> bool {
        let (word, bit) = self.position(relative);
        (self.bitmap[word] >> bit) & 1 == 0
    }

    fn to_relative(&self, frame: usize, count: usize) -> Result<usize, MemoryError> {
        if frame < self.first_frame {
            return Err(MemoryError::Invalid);
        }
        let relative = frame - self.first_frame;
        if relative + count > self.total_frames {
            return Err(MemoryError::Invalid);
        }
        Ok(relative)
    }

    /// Allocate `count` contiguous frames, first-fit.
    pub fn alloc_contiguous(&mut self, count: usize) -> Result<PhysAddr, MemoryError> {
        self.alloc_contiguous_below(count, PhysAddr::new(u32::MAX))
    }

    /// Allocate `count` contiguous frames whose addresses stay below
    /// `limit`.
    ///
    /// Kernel-region allocations use this: they are identity mapped, so
    /// their frames must fit inside the shared low region.
    pub fn alloc_contiguous_below(
        &mut self,
        count: usize,
        limit: PhysAddr,
    ) -> Result<PhysAddr, MemoryError> {
        if count == 0 || self.free_frames < count {
            return Err(MemoryError::OutOfMemory);
        }

        let limit_frame = (limit.as_u32() as usize / page::SIZE)
            .saturating_sub(self.first_frame)
            .min(self.total_frames);
        let hint = self.search_hint.min(limit_frame);

        let found = self
            .find_run(hint, limit_frame, count)
            .or_else(|| self.find_run(0, hint, count));
        let relative = found.ok_or(MemoryError::OutOfMemory)?;

        for i in relative..relative + count {
            let (word, bit) = self.position(i);
            self.bitmap[word] |= 1 << bit;
        }
        self.free_frames -= count;

        self.search_hint = relative + count;
        if self.search_hint >= self.total_frames {
            self.search_hint = 0;
        }

        Ok(PhysAddr::from_frame_number(self.first_frame + relative))
    }

    /// Allocate a single frame.
    pub fn alloc(&mut self) -> Result<PhysAddr, MemoryError> {
        self.alloc_contiguous(1)
    }

    /// Find a run of `count` free frames inside `[start, end)`.
    fn find_run(&self, start: usize, end: usize, count: usize) -> Option<usize> {
        let mut run_start = start;
        let mut run_length = 0;
        let mut frame = start;

        while frame < end {
            let (word, _) = self.position(frame);

            // Skip fully-allocated words in one step.
            if self.bitmap[word] == !0 {
                frame = (word + 1) * BITS_PER_WORD;
                run_length = 0;
                continue;
            }

            if self.is_free(frame) {
                if run_length == 0 {
                    run_start = frame;
                }
                run_length += 1;
                if run_length >= count {
                    return Some(run_start);
                }
            } else {
                run_length = 0;
            }

            frame += 1;
        }

        None
    }

    /// Free `count` frames starting at `base`.
    ///
    /// Freeing an already-free frame is an accounting bug somewhere else in
    /// the kernel and trips a debug assertion.
    pub fn free(&mut self, base: PhysAddr, count: usize) -> Result<(), MemoryError> {
        let relative = self.to_relative(base.frame_number(), count)?;

        for i in relative..relative + count {
            let (word, bit) = self.position(i);
            debug_assert!(
                (self.bitmap[word] >> bit) & 1 == 1,
                "double free of frame {:#x}",
                (self.first_frame + i) * page::SIZE
            );
            if (self.bitmap[word] >> bit) & 1 == 1 {
                self.bitmap[word] &= !(1 << bit);
                self.free_frames += 1;
            }
        }

        // Re-arm the search at the freed range so it is found again before
        // the cursor walks off the end of memory.
        if relative < self.search_hint {
            self.search_hint = relative;
        }

        Ok(())
    }

    fn release_frames(&mut self, first: usize, count: usize) {
        let relative = first - self.first_frame;
        for i in relative..relative + count {
            let (word, bit) = self.position(i);
            if (self.bitmap[word] >> bit) & 1 == 1 {
                self.bitmap[word] &= !(1 << bit);
                self.free_frames += 1;
            }
        }
    }

    /// Mark `count` frames at `base` as allocated, tolerating frames that
    /// already are (used for the kernel image and identity-mapped devices).
    pub fn mark_used(&mut self, base: PhysAddr, count: usize) {
        let Ok(relative) = self.to_relative(base.frame_number(), count) else {
            // Outside managed RAM, nothing to track. Device windows land
            // here.
            return;
        };

        for i in relative..relative + count {
            let (word, bit) = self.position(i);
            if (self.bitmap[word] >> bit) & 1 == 0 {
                self.bitmap[word] |= 1 << bit;
                self.free_frames -= 1;
            }
        }
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn used(&self) -> usize {
        (self.total_frames - self.free_frames) * page::SIZE
    }

    /// Bytes managed in total.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total_frames * page::SIZE
    }

    /// Frames currently free.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::arena;

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut frames = arena::frame_allocator(64);
        let used_before = frames.used();

        let base = frames.alloc_contiguous(3).unwrap();
        assert!(base.is_page_aligned());
        assert_eq!(frames.used(), used_before + 3 * page::SIZE);

        frames.free(base, 3).unwrap();
        assert_eq!(frames.used(), used_before);
    }

    #[test]
    fn test_first_fit_reuses_freed_range() {
        let mut frames = arena::frame_allocator(64);

        let a = frames.alloc_contiguous(2).unwrap();
        let _b = frames.alloc_contiguous(2).unwrap();
        frames.free(a, 2).unwrap();

        // The hint was re-armed to the freed range, so it is handed out
        // again instead of fresh frames further up.
        let c = frames.alloc_contiguous(2).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_exhaustion() {
        let mut frames = arena::frame_allocator(8);
        let free = frames.free_count();

        assert!(frames.alloc_contiguous(free + 1).is_err());
        let base = frames.alloc_contiguous(free).unwrap();
        assert_eq!(frames.free_count(), 0);
        assert!(frames.alloc().is_err());

        frames.free(base, free).unwrap();
        assert_eq!(frames.free_count(), free);
    }

    #[test]
    fn test_zero_count_alloc_fails() {
        let mut frames = arena::frame_allocator(8);
        assert_eq!(frames.alloc_contiguous(0), Err(MemoryError::OutOfMemory));
    }

    #[test]
    fn test_free_out_of_range_rejected() {
        let mut frames = arena::frame_allocator(8);
        assert_eq!(
            frames.free(PhysAddr::new(0x1000), 1),
            Err(MemoryError::Invalid)
        );
    }

    #[test]
    fn test_mark_used_is_idempotent() {
        let mut frames = arena::frame_allocator(16);
        let base = frames.alloc().unwrap();
        let used = frames.used();

        frames.mark_used(base, 1);
        assert_eq!(frames.used(), used);
    }
}
