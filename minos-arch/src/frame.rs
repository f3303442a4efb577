//! Interrupt stack frame layout
//!
//! The single definition of the frame the interrupt trampoline materialises
//! on the kernel stack. Task priming builds the same layout by hand when it
//! fabricates the first frame of a new task, so both sides live here and a
//! set of compile-time offset checks pins the layout down.
//!
//! Memory order, from the stack pointer the dispatcher receives upwards:
//! segment registers (pushed last), the eight general-purpose registers in
//! `pushad` order, vector number and error code, then the part the CPU
//! pushed itself. When the interrupted code was in ring 3 the CPU also
//! pushed the user stack pointer and stack segment.

use core::mem::{offset_of, size_of};

// -- Segment selectors
//
// Fixed by the GDT layout; user programs are linked against these values.

/// Kernel code segment selector.
pub const KERNEL_CODE_SELECTOR: u32 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_DATA_SELECTOR: u32 = 0x10;
/// User code segment selector (RPL 3).
pub const USER_CODE_SELECTOR: u32 = 0x1B;
/// User data segment selector (RPL 3).
pub const USER_DATA_SELECTOR: u32 = 0x23;

/// EFLAGS value for a freshly primed task: reserved bit 1 plus IF, so the
/// task starts with interrupts deliverable.
pub const INITIAL_EFLAGS: u32 = 0x202;

/// An interrupt frame for code interrupted in ring 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptStackFrame {
    // Pushed by the trampoline, segment registers last.
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,

    // `pushad` order: EDI ends up lowest.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// ESP as captured by `pushad`. Ignored by `popad` on the way out.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    /// Vector number pushed by the per-vector stub.
    pub intno: u32,
    /// Error code pushed by the CPU, or 0 from the stub.
    pub err: u32,

    // Pushed by the CPU on interrupt entry.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

/// An interrupt frame for code interrupted in ring 3.
///
/// Identical to [`InterruptStackFrame`] with the CPU's extra pushes for the
/// privilege change appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UserInterruptStackFrame {
    pub inner: InterruptStackFrame,
    /// User stack pointer at the time of the interrupt.
    pub user_esp: u32,
    /// User stack segment.
    pub ss: u32,
}

impl InterruptStackFrame {
    /// Fabricate the first frame of a kernel task.
    ///
    /// When the scheduler switches to the primed stack and the trampoline
    /// IRETs through this frame, execution starts at `entry` in ring 0 with
    /// interrupts enabled.
    #[must_use]
    pub fn prime_kernel(entry: u32) -> Self {
        Self {
            gs: KERNEL_DATA_SELECTOR,
            fs: KERNEL_DATA_SELECTOR,
            es: KERNEL_DATA_SELECTOR,
            ds: KERNEL_DATA_SELECTOR,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            intno: 0,
            err: 0,
            eip: entry,
            cs: KERNEL_CODE_SELECTOR,
            eflags: INITIAL_EFLAGS,
        }
    }

    /// True when the interrupted instruction pointer lies in the user range.
    #[must_use]
    pub const fn from_user_code(&self, user_base: u32) -> bool {
        self.eip >= user_base
    }
}

impl UserInterruptStackFrame {
    /// Fabricate the first frame of a user task.
    #[must_use]
    pub fn prime_user(entry: u32, user_esp: u32) -> Self {
        Self {
            inner: InterruptStackFrame {
                gs: USER_DATA_SELECTOR,
                fs: USER_DATA_SELECTOR,
                es: USER_DATA_SELECTOR,
                ds: USER_DATA_SELECTOR,
                edi: 0,
                esi: 0,
                ebp: 0,
                esp: 0,
                ebx: 0,
                edx: 0,
                ecx: 0,
                eax: 0,
                intno: 0,
                err: 0,
                eip: entry,
                cs: USER_CODE_SELECTOR,
                eflags: INITIAL_EFLAGS,
            },
            user_esp,
            ss: USER_DATA_SELECTOR,
        }
    }
}

// The trampoline and `popad`/`iretd` depend on these exact offsets.
const _: () = {
    assert!(size_of::<InterruptStackFrame>() == 17 * 4);
    assert!(size_of::<UserInterruptStackFrame>() == 19 * 4);
    assert!(offset_of!(InterruptStackFrame, gs) == 0);
    assert!(offset_of!(InterruptStackFrame, edi) == 16);
    assert!(offset_of!(InterruptStackFrame, eax) == 44);
    assert!(offset_of!(InterruptStackFrame, intno) == 48);
    assert!(offset_of!(InterruptStackFrame, err) == 52);
    assert!(offset_of!(InterruptStackFrame, eip) == 56);
    assert!(offset_of!(InterruptStackFrame, eflags) == 64);
    assert!(offset_of!(UserInterruptStackFrame, user_esp) == 68);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primed_kernel_frame() {
        let f = InterruptStackFrame::prime_kernel(0x0010_2000);
        assert_eq!(f.eip, 0x0010_2000);
        assert_eq!(f.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(f.ds, KERNEL_DATA_SELECTOR);
        // A primed task must come up with interrupts deliverable.
        assert_ne!(f.eflags & 0x200, 0);
    }

    #[test]
    fn test_primed_user_frame() {
        let f = UserInterruptStackFrame::prime_user(0x4000_0000, 0xFF00_1000);
        assert_eq!(f.inner.cs, USER_CODE_SELECTOR);
        assert_eq!(f.ss, USER_DATA_SELECTOR);
        assert_eq!(f.user_esp, 0xFF00_1000);
        assert_eq!(f.inner.eflags, INITIAL_EFLAGS);
    }

    #[test]
    fn test_user_range_check() {
        let mut f = InterruptStackFrame::prime_kernel(0x0010_0000);
        assert!(!f.from_user_code(0x4000_0000));
        f.eip = 0x4000_1000;
        assert!(f.from_user_code(0x4000_0000));
    }
}
