//! Hosted backend
//!
//! Stands in for the x86 port when the workspace is built for a development
//! host, so the kernel's logic crates compile and their unit tests run
//! anywhere. The interrupt flag is simulated per thread (tests run
//! concurrently), the debug console is captured in a buffer, and the power
//! and trap operations degrade to the closest sensible thing.

use std::cell::Cell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cpu::FpuState;
use crate::{Dispatcher, TimeStamp};

std::thread_local! {
    /// Simulated interrupt flag, on by default as after boot-time `sti`.
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// The registered kernel dispatcher. Unused by the simulation itself, but
/// kept so `initialize` has the same contract as the real port.
static DISPATCHER: Mutex<Option<Dispatcher>> = Mutex::new(None);

/// Bytes written to the simulated debug console.
static DEBUG_SINK: Mutex<Vec<u8>> = Mutex::new(Vec::new());

/// Number of interrupt acknowledgements issued.
static ACK_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn initialize(dispatcher: Dispatcher) {
    *DISPATCHER.lock().unwrap() = Some(dispatcher);
}

#[must_use]
pub fn disable_interrupts() -> u32 {
    INTERRUPTS_ENABLED.with(|f| {
        let was = f.get();
        f.set(false);
        was as u32
    })
}

pub fn restore_interrupts(flags: u32) {
    INTERRUPTS_ENABLED.with(|f| f.set(flags != 0));
}

pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.with(|f| f.set(true));
}

#[must_use]
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(Cell::get)
}

pub fn wait_for_interrupt() {
    std::thread::yield_now();
}

pub fn halt() -> ! {
    panic!("halt() reached on the hosted backend");
}

pub fn yield_now() {
    // Tests drive the scheduler directly instead of trapping.
}

#[must_use]
pub fn fault_address() -> u32 {
    0
}

pub fn load_page_directory(_directory: u32) {}

pub fn enable_paging() {}

pub fn ack_interrupt(_vector: u32) {
    ACK_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Number of acknowledgements issued so far. Test observability.
#[must_use]
pub fn ack_count() -> usize {
    ACK_COUNT.load(Ordering::Relaxed)
}

#[must_use]
pub fn is_spurious_interrupt(_irq: u8) -> bool {
    false
}

pub fn set_kernel_stack(_esp0: u32) {}

pub fn debug_write(buf: &[u8]) {
    DEBUG_SINK.lock().unwrap().extend_from_slice(buf);
}

/// Drain the captured debug output. Test observability.
#[must_use]
pub fn take_debug_output() -> Vec<u8> {
    std::mem::take(&mut *DEBUG_SINK.lock().unwrap())
}

#[must_use]
pub fn get_time() -> TimeStamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn reboot() -> ! {
    panic!("reboot() reached on the hosted backend");
}

pub fn shutdown() -> ! {
    panic!("shutdown() reached on the hosted backend");
}

pub fn save_context(_state: &mut FpuState) {}

pub fn load_context(_state: &FpuState) {}
