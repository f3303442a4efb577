//! End-to-end exercise of the interrupt dispatch seam against the real
//! global kernel state: boot initialisation, timer ticks, the yield trap,
//! system calls, user fault isolation and stray vectors.
//!
//! "Physical memory" is an arena registered as the paging access window;
//! interrupt frames are fabricated in kernel allocations exactly where the
//! trampoline would have built them.

use minos_arch::frame::InterruptStackFrame;
use minos_common::handover::{FramebufferInfo, COMMAND_LINE_SIZE, HANDOVER_MAGIC, HANDOVER_VERSION};
use minos_common::memory::{page, MemoryRegion, MemoryRegionKind};
use minos_common::{Handover, MemoryMap, PhysAddr};
use minos_kernel::{interrupts, irq, memory, sched, syscall};
use minos_kernel::memory::MemoryFlags;
use minos_kernel::task::TaskId;

/// Simulated RAM: 64 MiB at the 1 MiB mark.
const RAM_BASE: u32 = 0x0010_0000;
const RAM_SIZE: usize = 64 * 1024 * 1024;

/// Bring the kernel globals up once for the whole test process.
fn setup() {
    static BOOT: spin::Once<()> = spin::Once::new();

    BOOT.call_once(|| {
        let storage = vec![0u8; RAM_SIZE + page::SIZE].leak();
        let base = (storage.as_mut_ptr() as usize + page::SIZE - 1) & !(page::SIZE - 1);
        minos_paging::set_phys_window(base - RAM_BASE as usize);

        let mut map = MemoryMap::empty();
        map.regions[0] = MemoryRegion {
            base: PhysAddr::new(RAM_BASE),
            size: RAM_SIZE as u32,
            kind: MemoryRegionKind::Available,
        };
        map.entry_count = 1;

        let mut command_line = [0u8; COMMAND_LINE_SIZE];
        command_line[..5].copy_from_slice(b"test\0");

        let handover = Handover {
            magic: HANDOVER_MAGIC,
            version: HANDOVER_VERSION,
            memory_map: map,
            framebuffer: FramebufferInfo::empty(),
            command_line,
            kernel_start: PhysAddr::new(RAM_BASE),
            kernel_end: PhysAddr::new(RAM_BASE),
        };

        memory::init(&handover);
        sched::init();
    });
}

/// Fabricate an interrupt frame the way the trampoline would, at the top
/// of a fresh kernel allocation. Returns the stack pointer to dispatch
/// with.
fn make_frame(intno: u32, eip: u32, regs: [u32; 5]) -> u32 {
    let va = memory::with_memory(|m| m.alloc_kernel(page::SIZE, MemoryFlags::CLEAR))
        .expect("frame allocation");

    let esp = va.as_u32() + (page::SIZE - size_of::<InterruptStackFrame>()) as u32;
    let mut frame = InterruptStackFrame::prime_kernel(eip);
    frame.intno = intno;
    frame.eax = regs[0];
    frame.ebx = regs[1];
    frame.ecx = regs[2];
    frame.edx = regs[3];
    frame.esi = regs[4];

    // SAFETY: The allocation is identity placed inside the arena.
    unsafe {
        *frame_at(esp) = frame;
    }
    esp
}

/// View a fabricated frame.
///
/// # Safety
///
/// `esp` must come from `make_frame`.
unsafe fn frame_at(esp: u32) -> *mut InterruptStackFrame {
    // SAFETY: Caller contract; the window maps the whole arena.
    unsafe { minos_paging::phys_to_ptr::<InterruptStackFrame>(PhysAddr::new(esp)) }
}

fn current_task() -> Option<TaskId> {
    sched::with_scheduler(|s| s.current())
}

/// Tick the timer through the dispatch seam until `id` is current.
fn run_until_current(id: TaskId) {
    for _ in 0..16 {
        if current_task() == Some(id) {
            return;
        }
        let esp = make_frame(32, 0, [0; 5]);
        interrupts::dispatch(esp);
    }
    panic!("task {:?} never became current", id);
}

fn sys_sum(a: u32, b: u32, c: u32, d: u32, e: u32) -> i32 {
    (a + b + c + d + e) as i32
}

#[test]
fn test_dispatch_seam_end_to_end() {
    setup();

    // -- Timer: the first tick switches from the boot context to a task
    // and advances the clock.
    let boot_esp = make_frame(32, 0, [0; 5]);
    let next_esp = interrupts::dispatch(boot_esp);
    assert_ne!(next_esp, boot_esp, "the first pass must switch stacks");
    assert_eq!(sched::tick(), 1);
    assert_eq!(sched::uptime_ticks(), 1);

    // -- Yield trap: enters the scheduler without advancing the tick.
    let a = memory::with_memory(|m| {
        sched::with_scheduler(|s| s.spawn(m, None, "a", 0x0030_0000, &[], false))
    })
    .expect("spawn a");
    let tick_before = sched::tick();
    let esp = make_frame(127, 0, [0; 5]);
    interrupts::dispatch(esp);
    assert_eq!(sched::tick(), tick_before, "yield must not tick");
    assert_eq!(current_task(), Some(a));

    // -- System call: decoded from EAX, result written back, argument
    // registers untouched even when the timer fires mid-call.
    assert!(syscall::register(7, sys_sum));
    let sys_esp = make_frame(128, 0x0030_0000, [7, 10, 20, 30, 40]);
    // SAFETY: Frame fabricated above.
    unsafe {
        (*frame_at(sys_esp)).edi = 50;
    }

    // A tick in between simulates preemption during the call's lifetime.
    let tick_esp = make_frame(32, 0, [0; 5]);
    interrupts::dispatch(tick_esp);

    let ret = interrupts::dispatch(sys_esp);
    assert_eq!(ret, sys_esp, "a syscall alone must not switch stacks");
    // SAFETY: Same frame.
    let frame = unsafe { &*frame_at(sys_esp) };
    assert_eq!(frame.eax as i32, 150, "result lands in eax");
    assert_eq!(
        (frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi),
        (10, 20, 30, 40, 50),
        "argument registers survive"
    );

    // -- Unknown syscall numbers report Invalid.
    let bad_esp = make_frame(128, 0x0030_0000, [63, 0, 0, 0, 0]);
    interrupts::dispatch(bad_esp);
    // SAFETY: Same frame.
    let bad = unsafe { &*frame_at(bad_esp) };
    assert_eq!(bad.eax as i32, syscall::SyscallCode::Invalid.as_i32());

    // -- Driver IRQs are routed and unclaimed ones tolerated.
    let unclaimed_before = irq::unclaimed_count();
    let esp = make_frame(35, 0, [0; 5]);
    let ret = interrupts::dispatch(esp);
    assert_eq!(ret, esp, "a driver IRQ does not schedule");
    assert_eq!(irq::unclaimed_count(), unclaimed_before + 1);

    // -- Stray vectors: acknowledged, counted, ignored.
    let stray_before = interrupts::stray_count();
    let esp = make_frame(200, 0, [0; 5]);
    interrupts::dispatch(esp);
    assert_eq!(interrupts::stray_count(), stray_before + 1);

    // -- User fault isolation: a faulting user task dies with exit -1,
    // its sibling and the clock keep going.
    let sibling = a;
    let user = memory::with_memory(|m| {
        sched::with_scheduler(|s| s.spawn(m, None, "u", 0x4000_0000, &["u"], true))
    })
    .expect("spawn user");

    run_until_current(user);
    let baseline = sched::with_scheduler(|s| s.task_count());

    // Page fault out of user code, on the current (user) task.
    let fault_esp = make_frame(14, 0x4000_1000, [0; 5]);
    let after_fault = interrupts::dispatch(fault_esp);
    assert_ne!(after_fault, fault_esp, "the faulting task loses the CPU");
    assert_ne!(current_task(), Some(user));

    let exit_value = sched::with_scheduler(|s| s.with_task(user, |t| t.exit_value()));
    assert_eq!(exit_value, Some(-1), "user faults cancel with exit -1");

    // A couple of ticks reap it; the sibling is still schedulable and the
    // tick keeps advancing.
    let tick_before = sched::tick();
    for _ in 0..3 {
        let esp = make_frame(32, 0, [0; 5]);
        interrupts::dispatch(esp);
    }
    assert_eq!(sched::tick(), tick_before + 3);
    sched::with_scheduler(|s| {
        assert!(s.with_task(user, |_| ()).is_none(), "faulting task reaped");
        assert!(s.with_task(sibling, |_| ()).is_some(), "sibling survives");
        assert_eq!(s.task_count(), baseline - 1);
    });
}

#[test]
#[should_panic(expected = "unhandled kernel exception")]
fn test_kernel_mode_exception_is_fatal() {
    setup();

    // A general protection fault with a kernel-range instruction pointer.
    let esp = make_frame(13, 0x0020_0000, [0; 5]);
    interrupts::dispatch(esp);
}
