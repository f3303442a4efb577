//! 8259 Programmable Interrupt Controller pair
//!
//! Remaps the sixteen legacy IRQ lines away from the CPU exception range to
//! vectors 32..48 and provides acknowledgement plus spurious-interrupt
//! detection.

use x86::io::{inb, outb};

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

/// First vector of the master PIC after remapping.
pub const IRQ_BASE: u32 = 32;

const EOI: u8 = 0x20;
const READ_ISR: u8 = 0x0B;

/// Remap both PICs to vectors 32..48 and unmask every line.
///
/// Lines nobody subscribed to are routed to the kernel's IRQ dispatcher,
/// which counts them and moves on, so leaving them unmasked is harmless.
pub fn remap() {
    // SAFETY: The initialisation word sequence below is the documented 8259
    // programming protocol; no memory is touched.
    unsafe {
        // ICW1: initialise, expect ICW4.
        outb(MASTER_COMMAND, 0x11);
        outb(SLAVE_COMMAND, 0x11);

        // ICW2: vector offsets.
        outb(MASTER_DATA, IRQ_BASE as u8);
        outb(SLAVE_DATA, IRQ_BASE as u8 + 8);

        // ICW3: master has a slave on line 2; slave has cascade identity 2.
        outb(MASTER_DATA, 1 << 2);
        outb(SLAVE_DATA, 2);

        // ICW4: 8086 mode.
        outb(MASTER_DATA, 0x01);
        outb(SLAVE_DATA, 0x01);

        // Unmask everything.
        outb(MASTER_DATA, 0x00);
        outb(SLAVE_DATA, 0x00);
    }
}

/// Acknowledge the interrupt behind `vector`.
///
/// Vectors handled by the slave need an EOI at both controllers. Vectors
/// outside the remapped range are ignored.
pub fn ack(vector: u32) {
    if !(IRQ_BASE..IRQ_BASE + 16).contains(&vector) {
        return;
    }

    // SAFETY: Writing EOI to the command ports is the documented protocol.
    unsafe {
        if vector >= IRQ_BASE + 8 {
            outb(SLAVE_COMMAND, EOI);
        }
        outb(MASTER_COMMAND, EOI);
    }
}

/// Check whether a just-delivered IRQ 7 or IRQ 15 is spurious.
///
/// A spurious interrupt is delivered without the corresponding in-service
/// bit being set. For IRQ 15 the master still saw the cascade, so the caller
/// must still acknowledge the master in that case; [`ack`] handles that.
#[must_use]
pub fn is_spurious(irq: u8) -> bool {
    match irq {
        7 => {
            // SAFETY: OCW3 read of the in-service register.
            let isr = unsafe {
                outb(MASTER_COMMAND, READ_ISR);
                inb(MASTER_COMMAND)
            };
            isr & (1 << 7) == 0
        }
        15 => {
            // SAFETY: OCW3 read of the in-service register.
            let isr = unsafe {
                outb(SLAVE_COMMAND, READ_ISR);
                inb(SLAVE_COMMAND)
            };
            isr & (1 << 7) == 0
        }
        _ => false,
    }
}
