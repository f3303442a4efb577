//! Global Descriptor Table and TSS
//!
//! Flat 4 GiB segments for ring 0 and ring 3, plus one TSS whose only job is
//! to name the kernel stack the CPU switches to on a ring 3 to ring 0
//! transition. The selector values are part of the user ABI and live in
//! [`crate::frame`].

use core::arch::asm;
use core::mem::size_of;

use spin::Once;

/// A classic 8-byte segment descriptor.
#[derive(Clone, Copy)]
#[repr(C)]
struct Descriptor(u64);

impl Descriptor {
    const fn null() -> Self {
        Self(0)
    }

    /// Build a descriptor from base, limit, access byte and flags nibble.
    const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        let mut value = 0u64;
        value |= (limit & 0xFFFF) as u64;
        value |= ((base & 0xFFFF) as u64) << 16;
        value |= (((base >> 16) & 0xFF) as u64) << 32;
        value |= (access as u64) << 40;
        value |= (((limit >> 16) & 0xF) as u64) << 48;
        value |= ((flags & 0xF) as u64) << 52;
        value |= (((base >> 24) & 0xFF) as u64) << 56;
        Self(value)
    }
}

/// 32-bit Task State Segment. Only `ss0`/`esp0` matter to this kernel.
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct TaskStateSegment {
    prev: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 23],
}

impl TaskStateSegment {
    const fn new() -> Self {
        Self {
            prev: 0,
            esp0: 0,
            ss0: crate::frame::KERNEL_DATA_SELECTOR,
            unused: [0; 23],
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

struct Gdt {
    descriptors: [Descriptor; 6],
    // The CPU reads esp0 during ring transitions and the scheduler rewrites
    // it on task switches, so the TSS sits behind an UnsafeCell.
    tss: core::cell::UnsafeCell<TaskStateSegment>,
}

// SAFETY: The only mutation is the esp0 store in set_kernel_stack, done
// with interrupts masked on a uniprocessor.
unsafe impl Sync for Gdt {}

static GDT: Once<Gdt> = Once::new();

/// Granularity nibble: 4 KiB pages, 32-bit operands.
const FLAGS_4K_32BIT: u8 = 0b1100;

pub fn init() {
    let gdt = GDT.call_once(|| Gdt {
        descriptors: [Descriptor::null(); 6],
        tss: core::cell::UnsafeCell::new(TaskStateSegment::new()),
    });

    // The TSS descriptor needs the final address of the TSS, so the table
    // is patched in place after the `Once` has pinned it.
    // SAFETY: Runs once, before interrupts are enabled, with no other
    // reference to the descriptor array.
    unsafe {
        let descriptors = gdt.descriptors.as_ptr() as *mut [Descriptor; 6];

        // Access bytes: present | ring | code/data | type bits.
        (*descriptors)[1] = Descriptor::new(0, 0xFFFFF, 0x9A, FLAGS_4K_32BIT); // kernel code
        (*descriptors)[2] = Descriptor::new(0, 0xFFFFF, 0x92, FLAGS_4K_32BIT); // kernel data
        (*descriptors)[3] = Descriptor::new(0, 0xFFFFF, 0xFA, FLAGS_4K_32BIT); // user code
        (*descriptors)[4] = Descriptor::new(0, 0xFFFFF, 0xF2, FLAGS_4K_32BIT); // user data

        let tss_base = gdt.tss.get() as u32;
        let tss_limit = (size_of::<TaskStateSegment>() - 1) as u32;
        (*descriptors)[5] = Descriptor::new(tss_base, tss_limit, 0x89, 0);
    }

    let pointer = DescriptorTablePointer {
        limit: (size_of::<[Descriptor; 6]>() - 1) as u16,
        base: gdt.descriptors.as_ptr() as u32,
    };

    // SAFETY: The GDT lives in a `Once` for the lifetime of the kernel, the
    // pointer describes it exactly, and the selectors loaded below match the
    // descriptors installed above.
    unsafe {
        asm!(
            "lgdt ({ptr})",
            // Reload the data segments with the new kernel data selector.
            "mov $0x10, %ax",
            "mov %ax, %ds",
            "mov %ax, %es",
            "mov %ax, %fs",
            "mov %ax, %gs",
            "mov %ax, %ss",
            // Far jump to reload CS.
            "ljmp $0x8, $2f",
            "2:",
            // Load the task register with the TSS selector.
            "mov $0x28, %ax",
            "ltr %ax",
            ptr = in(reg) &raw const pointer,
            out("eax") _,
            options(att_syntax, nostack)
        );
    }

    log::debug!("gdt: loaded, tss at {:#x}", gdt.tss.get() as u32);
}

/// Point the TSS ring-0 stack at `esp0`.
///
/// Called by the scheduler on every switch to a user task so the next
/// interrupt out of ring 3 lands on that task's kernel stack.
pub fn set_kernel_stack(esp0: u32) {
    if let Some(gdt) = GDT.get() {
        // SAFETY: Only the scheduler writes this field, with interrupts
        // masked, and the CPU reads it only during a ring transition.
        unsafe {
            (*gdt.tss.get()).esp0 = esp0;
        }
    }
}
