//! COM1 serial port, the debug console.

use spin::Once;
use x86::io::{inb, outb};

const COM1: u16 = 0x3F8;

const DATA: u16 = COM1;
const INTERRUPT_ENABLE: u16 = COM1 + 1;
const FIFO_CONTROL: u16 = COM1 + 2;
const LINE_CONTROL: u16 = COM1 + 3;
const MODEM_CONTROL: u16 = COM1 + 4;
const LINE_STATUS: u16 = COM1 + 5;

static READY: Once<()> = Once::new();

/// 8N1 at 38400 baud, FIFOs on, interrupts off (the console is polled).
///
/// Runs once; `write` calls it lazily so logging works from the first
/// instruction of boot.
pub fn init() {
    READY.call_once(|| {
        // SAFETY: Standard 16550 programming sequence on the COM1 ports.
        unsafe {
            outb(INTERRUPT_ENABLE, 0x00);
            outb(LINE_CONTROL, 0x80); // DLAB on
            outb(DATA, 3); // divisor low: 115200 / 3
            outb(INTERRUPT_ENABLE, 0); // divisor high
            outb(LINE_CONTROL, 0x03); // 8N1, DLAB off
            outb(FIFO_CONTROL, 0xC7);
            outb(MODEM_CONTROL, 0x0B);
        }
    });
}

fn write_byte(byte: u8) {
    // SAFETY: Polling the line status register then writing the data
    // register is the documented transmit sequence.
    unsafe {
        while inb(LINE_STATUS) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        outb(DATA, byte);
    }
}

pub fn write(buf: &[u8]) {
    init();
    for &byte in buf {
        if byte == b'\n' {
            write_byte(b'\r');
        }
        write_byte(byte);
    }
}
