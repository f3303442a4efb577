//! Interrupt Descriptor Table and trampolines
//!
//! Every installed vector funnels through one common stub that materialises
//! an [`InterruptStackFrame`](crate::frame::InterruptStackFrame) on the
//! current kernel stack, calls the registered dispatcher with the stack
//! pointer, and resumes from whatever stack pointer the dispatcher returns.
//! Returning a different pointer than it was given is how the scheduler
//! switches tasks.
//!
//! Per-vector stubs only normalise the frame: the CPU pushes an error code
//! for some exceptions and not for others, so stubs for the latter push a
//! zero before pushing their vector number.

use core::arch::naked_asm;
use core::mem::size_of;
use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Once;

use crate::Dispatcher;

// -- Dispatcher registration

fn unset_dispatcher(_esp: u32) -> u32 {
    panic!("interrupt delivered before a dispatcher was installed");
}

static DISPATCHER: AtomicPtr<()> = AtomicPtr::new(unset_dispatcher as *mut ());

/// Called by the common stub. Hands the frame pointer to the kernel and
/// returns the stack pointer to resume from.
extern "C" fn dispatch(esp: u32) -> u32 {
    let ptr = DISPATCHER.load(Ordering::Acquire);
    // SAFETY: The pointer is only ever a `Dispatcher` stored below.
    let dispatcher: Dispatcher = unsafe { core::mem::transmute(ptr) };
    dispatcher(esp)
}

// -- Trampolines

/// The common stub. On entry the stack holds, top down: vector number,
/// error code, then the CPU-pushed EIP/CS/EFLAGS (and user ESP/SS on a
/// privilege change).
#[unsafe(naked)]
unsafe extern "C" fn interrupt_common() {
    naked_asm!(
        "pushad",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        // Data segments may hold user selectors; switch to kernel data.
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        // Hand the frame pointer to the dispatcher; its return value is the
        // stack pointer of the task to resume.
        "push esp",
        "call {dispatch}",
        "add esp, 4",
        "mov esp, eax",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popad",
        // Drop the vector number and error code.
        "add esp, 8",
        "iretd",
        dispatch = sym dispatch,
    );
}

/// Declare a per-vector entry stub.
///
/// `noerr` vectors push a zero where the CPU would have pushed an error
/// code, so the frame layout is uniform.
macro_rules! stub {
    ($name:ident, $vector:literal, noerr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                concat!("push ", stringify!($vector)),
                "jmp {common}",
                common = sym interrupt_common,
            );
        }
    };
    ($name:ident, $vector:literal, err) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                concat!("push ", stringify!($vector)),
                "jmp {common}",
                common = sym interrupt_common,
            );
        }
    };
}

macro_rules! stubs {
    ($(($name:ident, $vector:literal, $kind:ident)),* $(,)?) => {
        $(stub!($name, $vector, $kind);)*

        /// All installed vectors with their entry points.
        const STUBS: &[(u8, unsafe extern "C" fn())] = &[$(($vector, $name)),*];
    };
}

stubs![
    // CPU exceptions. The CPU pushes an error code for 8, 10..=14 and 17.
    (vector_0, 0, noerr),
    (vector_1, 1, noerr),
    (vector_2, 2, noerr),
    (vector_3, 3, noerr),
    (vector_4, 4, noerr),
    (vector_5, 5, noerr),
    (vector_6, 6, noerr),
    (vector_7, 7, noerr),
    (vector_8, 8, err),
    (vector_9, 9, noerr),
    (vector_10, 10, err),
    (vector_11, 11, err),
    (vector_12, 12, err),
    (vector_13, 13, err),
    (vector_14, 14, err),
    (vector_15, 15, noerr),
    (vector_16, 16, noerr),
    (vector_17, 17, err),
    (vector_18, 18, noerr),
    (vector_19, 19, noerr),
    (vector_20, 20, noerr),
    (vector_21, 21, noerr),
    (vector_22, 22, noerr),
    (vector_23, 23, noerr),
    (vector_24, 24, noerr),
    (vector_25, 25, noerr),
    (vector_26, 26, noerr),
    (vector_27, 27, noerr),
    (vector_28, 28, noerr),
    (vector_29, 29, noerr),
    (vector_30, 30, noerr),
    (vector_31, 31, noerr),
    // Hardware interrupts, PIC-remapped.
    (vector_32, 32, noerr),
    (vector_33, 33, noerr),
    (vector_34, 34, noerr),
    (vector_35, 35, noerr),
    (vector_36, 36, noerr),
    (vector_37, 37, noerr),
    (vector_38, 38, noerr),
    (vector_39, 39, noerr),
    (vector_40, 40, noerr),
    (vector_41, 41, noerr),
    (vector_42, 42, noerr),
    (vector_43, 43, noerr),
    (vector_44, 44, noerr),
    (vector_45, 45, noerr),
    (vector_46, 46, noerr),
    (vector_47, 47, noerr),
    // Software traps.
    (vector_127, 127, noerr),
    (vector_128, 128, noerr),
];

// -- Descriptor table

/// An 8-byte interrupt gate.
#[derive(Clone, Copy)]
#[repr(C)]
struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl GateDescriptor {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn interrupt_gate(handler: u32, dpl: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: crate::frame::KERNEL_CODE_SELECTOR as u16,
            zero: 0,
            // Present, 32-bit interrupt gate. Interrupt gates mask IF on
            // entry; the dispatcher decides when to unmask.
            type_attr: 0x8E | (dpl << 5),
            offset_high: (handler >> 16) as u16,
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

static IDT: Once<[GateDescriptor; 256]> = Once::new();

pub fn init(dispatcher: Dispatcher) {
    DISPATCHER.store(dispatcher as *mut (), Ordering::Release);

    let idt = IDT.call_once(|| {
        let mut idt = [GateDescriptor::missing(); 256];
        for &(vector, stub) in STUBS {
            // The system call gate is reachable from ring 3.
            let dpl = if vector == crate::SYSCALL_VECTOR { 3 } else { 0 };
            idt[vector as usize] = GateDescriptor::interrupt_gate(stub as u32, dpl);
        }
        idt
    });

    let pointer = DescriptorTablePointer {
        limit: (size_of::<[GateDescriptor; 256]>() - 1) as u16,
        base: idt.as_ptr() as u32,
    };

    // SAFETY: The IDT lives in a `Once` for the lifetime of the kernel and
    // the pointer describes it exactly.
    unsafe {
        core::arch::asm!("lidt ({})", in(reg) &raw const pointer, options(att_syntax, nostack));
    }

    log::debug!("idt: {} vectors installed", STUBS.len());
}
