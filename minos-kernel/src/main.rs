//! Boot entry
//!
//! The loader drops us here with interrupts masked, paging off, and a
//! pointer to the handover structure. Initialisation order matters:
//! logging first so everything after it can report, then the processor
//! port with the kernel's dispatcher, then memory, then the scheduler.
//! Enabling interrupts is the moment multitasking starts.

#![cfg_attr(target_arch = "x86", no_std)]
#![cfg_attr(target_arch = "x86", no_main)]

#[cfg(target_arch = "x86")]
mod boot {
    use minos_common::Handover;
    use minos_kernel::{interrupts, logging, memory, sched, syscall};

    /// Entry point named by the loader.
    ///
    /// # Safety
    ///
    /// Called exactly once by the loader with a valid handover pointer.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn _start(handover: *const Handover) -> ! {
        // SAFETY: The loader contract gives us a readable handover.
        let handover = unsafe { &*handover };

        logging::init();
        log::info!("minos: booting, cmdline '{}'", handover.command_line());

        // Descriptor tables and the controllers first, so a fault during
        // memory bring-up is reported instead of triple faulting.
        // Interrupts stay masked until the scheduler can take them.
        minos_arch::cpu::initialize(interrupts::dispatch);
        memory::init(handover);
        sched::init();

        memory::with_memory(|m| {
            sched::with_scheduler(|s| {
                s.spawn(m, None, "system", system_entry as usize as u32, &[], false)
            })
        })
        .expect("spawning the system task failed");

        log::info!("minos: entering multitasking");
        minos_arch::cpu::enable_interrupts();

        // This boot context is not a task; the first tick switches away
        // for good and the idle task inherits the duty below.
        loop {
            minos_arch::cpu::wait_for_interrupt();
        }
    }

    /// The first real task: wire up the process system calls, then report
    /// vitals once a minute.
    extern "C" fn system_entry() -> ! {
        register_process_syscalls();

        log::info!(
            "system: up at tick {}, {} tasks",
            sched::tick(),
            sched::with_scheduler(|s| s.task_count())
        );

        loop {
            sched::sleep(60 * minos_arch::TICK_HZ as u64);
            memory::with_memory(|m| m.dump());
        }
    }

    // The process-lifecycle calls. Everything else on the call surface
    // (handles, streams, filesystem) is registered by its own subsystem.

    fn register_process_syscalls() {
        syscall::register(0, sys_exit);
        syscall::register(1, sys_yield);
        syscall::register(2, sys_sleep);
        syscall::register(3, sys_wait);
    }

    fn sys_exit(code: u32, _b: u32, _c: u32, _d: u32, _e: u32) -> i32 {
        sched::exit(code as i32)
    }

    fn sys_yield(_a: u32, _b: u32, _c: u32, _d: u32, _e: u32) -> i32 {
        sched::yield_now();
        syscall::SyscallCode::Success.as_i32()
    }

    fn sys_sleep(ticks: u32, _b: u32, _c: u32, _d: u32, _e: u32) -> i32 {
        match sched::sleep(ticks as u64) {
            minos_kernel::task::BlockerResult::Unblocked => {
                syscall::SyscallCode::Success.as_i32()
            }
            _ => syscall::SyscallCode::Invalid.as_i32(),
        }
    }

    fn sys_wait(task: u32, _b: u32, _c: u32, _d: u32, _e: u32) -> i32 {
        use minos_kernel::sched::TaskError;
        use minos_kernel::task::TaskId;

        match sched::wait(TaskId::from_raw(task)) {
            Ok(exit_value) => exit_value,
            Err(TaskError::NoSuchTask) => syscall::SyscallCode::NoSuchTask.as_i32(),
            Err(_) => syscall::SyscallCode::Invalid.as_i32(),
        }
    }
}

#[cfg(not(target_arch = "x86"))]
fn main() {
    eprintln!("the minos kernel image only targets 32-bit x86; run `cargo test` instead");
}
