//! 8254 Programmable Interval Timer
//!
//! Channel 0 drives IRQ 0, the scheduler tick.

use x86::io::outb;

const CHANNEL_0: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// The PIT input clock in Hz.
const BASE_FREQUENCY: u32 = 1_193_182;

/// Program channel 0 as a rate generator at `frequency` Hz.
pub fn init(frequency: u32) {
    let divisor = (BASE_FREQUENCY / frequency).clamp(1, 65535);

    // SAFETY: Command 0x34 selects channel 0, lobyte/hibyte access, mode 2
    // (rate generator); the divisor follows in two writes.
    unsafe {
        outb(COMMAND, 0x34);
        outb(CHANNEL_0, divisor as u8);
        outb(CHANNEL_0, (divisor >> 8) as u8);
    }

    log::debug!("pit: {} Hz (divisor {})", frequency, divisor);
}
