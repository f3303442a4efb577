//! Interrupt and exception dispatch
//!
//! Every hardware vector funnels into [`dispatch`] with the kernel stack
//! pointer holding the trampoline-built frame. The routing:
//!
//! - `0..=31` CPU exceptions. A faulting instruction pointer in the user
//!   range costs the offending task its life (exit `-1`) and the rest of
//!   the system continues; a kernel-mode fault is fatal.
//! - `32..=47` hardware IRQs. IRQ 0 advances the tick and runs a scheduler
//!   pass; the rest go to the driver dispatcher. The controller is
//!   acknowledged on every IRQ whatever the handler did.
//! - `127` the yield trap: a scheduler pass without a tick.
//! - `128` the system call gate.
//!
//! The returned stack pointer is what the trampoline resumes from; when a
//! pass picked another task, that is the context switch.

use core::sync::atomic::{AtomicU64, Ordering};

use minos_arch::cpu;
use minos_arch::frame::InterruptStackFrame;
use minos_common::PhysAddr;

use crate::memory::{self, USER_BASE};
use crate::sched::{self, Scheduler};
use crate::{irq, syscall};

/// Exception names, indexed by vector.
pub const EXCEPTION_NAMES: [&str; 32] = [
    "Division by zero",
    "Debug",
    "Non-maskable interrupt",
    "Breakpoint",
    "Detected overflow",
    "Out-of-bounds",
    "Invalid opcode",
    "No coprocessor",
    "Double fault",
    "Coprocessor segment overrun",
    "Bad TSS",
    "Segment not present",
    "Stack fault",
    "General protection fault",
    "Page fault",
    "Unknown interrupt",
    "Coprocessor fault",
    "Alignment check",
    "Machine check",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
];

/// Vectors delivered without any installed handler. Acknowledged, counted,
/// otherwise ignored.
static STRAY_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of stray vectors seen so far.
#[must_use]
pub fn stray_count() -> u64 {
    STRAY_COUNT.load(Ordering::Relaxed)
}

/// The dispatcher handed to the trampoline at boot.
///
/// `esp` points at the [`InterruptStackFrame`]; the return value is the
/// stack pointer to resume from.
pub fn dispatch(esp: u32) -> u32 {
    // The frame sits on an identity-placed kernel stack, so the physical
    // window reaches it on every backend.
    // SAFETY: The trampoline (or a test fabricating an interrupt) built a
    // frame at this address.
    let frame = unsafe { &mut *minos_paging::phys_to_ptr::<InterruptStackFrame>(PhysAddr::new(esp)) };

    let new_esp = match frame.intno {
        0..=31 => handle_exception(esp, frame),
        32..=47 => {
            let irq_number = (frame.intno - 32) as u8;
            if irq_number == 0 {
                schedule(esp, true)
            } else {
                irq::dispatch(irq_number);
                esp
            }
        }
        127 => schedule(esp, false),
        128 => {
            handle_syscall(frame);
            esp
        }
        _ => {
            STRAY_COUNT.fetch_add(1, Ordering::Relaxed);
            esp
        }
    };

    // Acknowledge the controller whatever happened above.
    cpu::ack_interrupt(frame.intno);

    new_esp
}

/// Run a scheduler pass, with or without a tick.
fn schedule(esp: u32, tick: bool) -> u32 {
    memory::with_memory(|mem| {
        sched::with_scheduler(|s: &mut Scheduler| {
            if tick {
                s.timer_tick(mem, esp)
            } else {
                s.schedule(mem, esp)
            }
        })
    })
}

/// Route a CPU exception.
fn handle_exception(esp: u32, frame: &mut InterruptStackFrame) -> u32 {
    let name = EXCEPTION_NAMES[frame.intno as usize];

    if frame.from_user_code(USER_BASE) {
        // A user task faulted. The task dies; the system does not.
        cpu::enable_interrupts();

        let fault_addr = cpu::fault_address();
        sched::with_scheduler(|s| {
            let current = s.current();
            if let Some(id) = current {
                s.with_task(id, |task| {
                    log::error!(
                        "task {} '{}' raised '{}' {:#x}.{:#x} (eip={:#010x} addr={:#010x})",
                        id.value(),
                        task.name(),
                        name,
                        frame.intno,
                        frame.err,
                        frame.eip,
                        fault_addr,
                    );
                });
                let _ = s.cancel(id, -1);
            }
        });
        sched::dump_tasks();
        backtrace(frame.ebp);

        // Switch away; the canceled task is reaped on a later pass.
        cpu::disable_interrupts();
        schedule(esp, false)
    } else {
        kernel_fault(name, frame);
    }
}

/// A kernel-mode exception is a broken kernel. Dump everything and stop.
fn kernel_fault(name: &str, frame: &InterruptStackFrame) -> ! {
    log::error!("KERNEL EXCEPTION: '{}' ({:#x}.{:#x})", name, frame.intno, frame.err);
    dump_frame(frame);
    backtrace(frame.ebp);
    panic!(
        "unhandled kernel exception '{}' at eip {:#010x}",
        name, frame.eip
    );
}

/// Log every register of a frame.
pub fn dump_frame(frame: &InterruptStackFrame) {
    log::error!(
        "  cs={:04x} ds={:04x} es={:04x} fs={:04x} gs={:04x}",
        frame.cs,
        frame.ds,
        frame.es,
        frame.fs,
        frame.gs
    );
    log::error!(
        "  eax={:08x} ebx={:08x} ecx={:08x} edx={:08x}",
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx
    );
    log::error!(
        "  edi={:08x} esi={:08x} ebp={:08x} esp={:08x}",
        frame.edi,
        frame.esi,
        frame.ebp,
        frame.esp
    );
    log::error!(
        "  int={:08x} err={:08x} eip={:08x} flg={:08x} addr={:08x}",
        frame.intno,
        frame.err,
        frame.eip,
        frame.eflags,
        cpu::fault_address()
    );
}

/// Walk the saved frame-pointer chain and log the return addresses.
///
/// Only meaningful on the real machine; the hosted backend has no
/// walkable kernel stacks.
pub fn backtrace(ebp: u32) {
    #[cfg(target_arch = "x86")]
    {
        let mut frame_ptr = ebp;
        for _ in 0..32 {
            if frame_ptr == 0 || frame_ptr % 4 != 0 {
                break;
            }
            // SAFETY: Best effort over a dying context; alignment and null
            // are checked, and the walk is bounded.
            let (next, eip) = unsafe {
                let p = frame_ptr as *const u32;
                (*p, *p.add(1))
            };
            if eip == 0 {
                break;
            }
            log::error!("  frame {:#010x}", eip);
            if next <= frame_ptr {
                break;
            }
            frame_ptr = next;
        }
    }
    #[cfg(not(target_arch = "x86"))]
    {
        let _ = ebp;
    }
}

/// Decode and run a system call, writing the result back into the frame.
///
/// Calls run with interrupts enabled; the timer may preempt them and the
/// argument registers live in the caller's frame, untouched by any switch.
fn handle_syscall(frame: &mut InterruptStackFrame) {
    cpu::enable_interrupts();
    let result = syscall::dispatch(frame.eax, frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi);
    cpu::disable_interrupts();
    frame.eax = result as u32;
}
