//! Kernel panic
//!
//! A panic is a broken kernel invariant: report everything that is known
//! and halt. Only built for the real target; hosted builds use the host's
//! panic machinery so tests can assert on panics.

use core::panic::PanicInfo;

use minos_arch::cpu;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // Whatever was in flight stays interrupted.
    let _ = cpu::disable_interrupts();

    log::error!("KERNEL PANIC: {}", info.message());
    if let Some(location) = info.location() {
        log::error!("  at {}:{}", location.file(), location.line());
    }

    let ebp: u32;
    // SAFETY: Reading EBP has no side effects.
    unsafe {
        core::arch::asm!("mov {}, ebp", out(reg) ebp, options(nomem, nostack));
    }
    crate::interrupts::backtrace(ebp);

    cpu::halt()
}
