//! Hardware IRQ routing
//!
//! Device drivers subscribe to IRQ lines; the interrupt dispatcher calls
//! [`dispatch`] for every firing that is not the timer. Spurious and
//! unclaimed interrupts are counted and otherwise tolerated.

use core::sync::atomic::{AtomicU64, Ordering};

use minos_arch::{cpu, IrqSpinMutex};

/// An IRQ line handler, called with the line number, interrupts masked.
pub type IrqHandler = fn(u8);

/// Legacy interrupt lines.
pub const IRQ_COUNT: usize = 16;

static HANDLERS: IrqSpinMutex<[Option<IrqHandler>; IRQ_COUNT]> =
    IrqSpinMutex::new([None; IRQ_COUNT]);

static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);
static UNCLAIMED_COUNT: AtomicU64 = AtomicU64::new(0);

/// Subscribe a driver to an IRQ line.
///
/// Returns `false` when the line is out of range or already claimed. IRQ 0
/// belongs to the scheduler and cannot be subscribed.
pub fn subscribe(irq: u8, handler: IrqHandler) -> bool {
    if irq == 0 {
        return false;
    }

    let mut handlers = HANDLERS.lock();
    match handlers.get_mut(irq as usize) {
        Some(slot @ None) => {
            *slot = Some(handler);
            log::debug!("irq: line {} subscribed", irq);
            true
        }
        _ => false,
    }
}

/// Route one firing of `irq` to its subscriber.
pub fn dispatch(irq: u8) {
    if cpu::is_spurious_interrupt(irq) {
        SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let handler = {
        let handlers = HANDLERS.lock();
        handlers.get(irq as usize).copied().flatten()
    };

    match handler {
        Some(handler) => handler(irq),
        None => {
            UNCLAIMED_COUNT.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Spurious interrupts seen so far.
#[must_use]
pub fn spurious_count() -> u64 {
    SPURIOUS_COUNT.load(Ordering::Relaxed)
}

/// Firings on lines nobody subscribed to.
#[must_use]
pub fn unclaimed_count() -> u64 {
    UNCLAIMED_COUNT.load(Ordering::Relaxed)
}
