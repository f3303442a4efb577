//! # minos-arch
//!
//! The architecture port consumed by the kernel core. The surface is narrow
//! on purpose: interrupt masking, the interrupt stack frame layout, context
//! save/restore, the yield trap, timekeeping, debug output, and power
//! control.
//!
//! Two backends implement it:
//!
//! - `x86`: the real 32-bit x86 port (GDT/TSS, IDT and trampolines, 8259
//!   PIC, 8254 PIT, COM1 debug output). Compiled only for
//!   `target_arch = "x86"`.
//! - `hosted`: a simulation used on every other target so the kernel crates
//!   build and their unit tests run on a development host. The interrupt
//!   flag becomes an atomic, the debug console a ring buffer.

// The real port is freestanding; the hosted backend leans on std for
// per-thread state so parallel test runs stay independent.
#![cfg_attr(target_arch = "x86", no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cpu;
pub mod frame;
pub mod sync;

#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(not(target_arch = "x86"))]
pub mod hosted;

pub use frame::{InterruptStackFrame, UserInterruptStackFrame};
pub use sync::{AtomicScope, IrqSpinMutex, IrqSpinMutexGuard};

/// Seconds since the Unix epoch, as read from the hardware clock.
pub type TimeStamp = u64;

/// Timer tick rate in Hz. A boot constant; all timeouts are expressed in
/// ticks of this clock.
pub const TICK_HZ: u32 = 1000;

/// The software interrupt vector used by [`cpu::yield_now`].
pub const YIELD_VECTOR: u8 = 127;

/// The system call vector.
pub const SYSCALL_VECTOR: u8 = 128;

/// Signature of the kernel's interrupt dispatcher.
///
/// Receives the kernel stack pointer holding an [`InterruptStackFrame`] and
/// returns the stack pointer to resume from. Returning a different value is
/// the context switch.
pub type Dispatcher = fn(u32) -> u32;
