//! CPU control
//!
//! The functions the kernel core calls to drive the processor: interrupt
//! masking, halting, the yield trap, context save/restore, timekeeping,
//! debug output, and power control. Each resolves to the x86 backend on the
//! real target and to the hosted simulation everywhere else.

use crate::{Dispatcher, TimeStamp};

#[cfg(target_arch = "x86")]
use crate::x86 as backend;

#[cfg(not(target_arch = "x86"))]
use crate::hosted as backend;

/// Initialise the processor side of the port and install the kernel's
/// interrupt dispatcher.
///
/// On x86 this loads the GDT and TSS, builds and loads the IDT, remaps the
/// 8259 PICs, and programs the 8254 timer to [`crate::TICK_HZ`]. Interrupts
/// stay masked; the caller enables them once the scheduler is ready.
pub fn initialize(dispatcher: Dispatcher) {
    backend::initialize(dispatcher);
}

/// Mask interrupts, returning the previous flag state for
/// [`restore_interrupts`].
#[must_use]
pub fn disable_interrupts() -> u32 {
    backend::disable_interrupts()
}

/// Restore a flag state previously returned by [`disable_interrupts`].
pub fn restore_interrupts(flags: u32) {
    backend::restore_interrupts(flags);
}

/// Unmask interrupts unconditionally.
pub fn enable_interrupts() {
    backend::enable_interrupts();
}

/// Check whether interrupts are currently deliverable.
#[must_use]
pub fn interrupts_enabled() -> bool {
    backend::interrupts_enabled()
}

/// Stop the CPU until the next interrupt.
pub fn wait_for_interrupt() {
    backend::wait_for_interrupt();
}

/// Halt forever.
pub fn halt() -> ! {
    backend::halt()
}

/// Enter the scheduler through the yield trap.
///
/// Raises vector [`crate::YIELD_VECTOR`], which takes the same path as the
/// timer interrupt minus the tick increment. On the hosted backend this is a
/// no-op; tests drive the scheduler directly.
pub fn yield_now() {
    backend::yield_now();
}

/// The faulting address of the most recent page fault (CR2).
#[must_use]
pub fn fault_address() -> u32 {
    backend::fault_address()
}

/// Load the address-space root register (CR3) with the physical address of
/// a page directory.
///
/// Calling this with interrupts enabled is permitted; the caller must not
/// reference task-private memory across the switch.
pub fn load_page_directory(directory: u32) {
    backend::load_page_directory(directory);
}

/// Turn paging on. Called once at boot, after the kernel directory is
/// loaded.
pub fn enable_paging() {
    backend::enable_paging();
}

/// Acknowledge a hardware interrupt at the interrupt controller.
///
/// Must be called once for every delivered IRQ vector, whatever the handler
/// outcome was.
pub fn ack_interrupt(vector: u32) {
    backend::ack_interrupt(vector);
}

/// Check whether a pending IRQ is spurious (the controller raised it but no
/// longer asserts it). Only meaningful for the vectors mapped to IRQ 7 and
/// IRQ 15.
#[must_use]
pub fn is_spurious_interrupt(irq: u8) -> bool {
    backend::is_spurious_interrupt(irq)
}

/// Point the ring-0 entry stack at `esp0`.
///
/// The scheduler calls this when switching to a user task so the next trap
/// out of ring 3 lands on that task's kernel stack.
pub fn set_kernel_stack(esp0: u32) {
    backend::set_kernel_stack(esp0);
}

/// Write bytes to the debug console.
pub fn debug_write(buf: &[u8]) {
    backend::debug_write(buf);
}

/// Read the wall-clock time from the hardware clock.
#[must_use]
pub fn get_time() -> TimeStamp {
    backend::get_time()
}

/// Reboot the machine.
pub fn reboot() -> ! {
    backend::reboot()
}

/// Power off, or halt if the platform cannot.
pub fn shutdown() -> ! {
    backend::shutdown()
}

// -- Extended processor state

/// Storage for the FPU/SSE register file of one task.
///
/// 512 bytes, 16-byte aligned, as FXSAVE requires.
#[derive(Clone)]
#[repr(C, align(16))]
pub struct FpuState {
    data: [u8; 512],
}

impl FpuState {
    #[must_use]
    pub const fn new() -> Self {
        Self { data: [0; 512] }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the extended processor state into `state`.
///
/// The general-purpose registers travel with the interrupt stack frame; this
/// covers the part the trampoline does not touch.
pub fn save_context(state: &mut FpuState) {
    backend::save_context(state);
}

/// Load the extended processor state from `state`.
pub fn load_context(state: &FpuState) {
    backend::load_context(state);
}
