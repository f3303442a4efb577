//! Tasks
//!
//! A task is an addressable execution context: identity, state, stacks, an
//! address space, its open resources and working directory, and a slot for
//! the blocker it is currently parked on. Tasks live in the scheduler's
//! registry; everything here that touches the registry or memory is driven
//! from `sched`.

use alloc::string::String;
use alloc::vec::Vec;

use minos_arch::cpu::FpuState;
use minos_arch::frame::{InterruptStackFrame, UserInterruptStackFrame};
use minos_common::{PhysAddr, VirtAddr};
use minos_paging::VirtRegion;
use spin::Mutex;

use crate::memory::{
    AddressSpace, MappingKind, Memory, MemoryError, MemoryFlags, MemoryMapping,
    KERNEL_STACK_SIZE, USER_STACK_BASE, USER_STACK_SIZE,
};

pub mod blocker;
pub mod handles;

pub use blocker::{Blocker, BlockerResult, PendingBlocker, Timeout};
pub use handles::{HandleTable, Resource};

/// Longest task name kept; anything longer is truncated at creation.
pub const TASK_NAME_SIZE: usize = 64;

/// Highest number of argv entries passed to a spawned task.
pub const TASK_ARG_COUNT: usize = 16;

/// A process-unique task identifier from the registry's monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u32);

impl TaskId {
    #[inline]
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Rebuild an id from its raw value, as decoded from a system call
    /// argument. An id that names no live task simply fails the lookup.
    #[inline]
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but never started, or already reaped.
    None,
    /// Schedulable; the current task keeps this state while it runs.
    Running,
    /// Schedulable and queued behind the current task.
    Ready,
    /// Parked on a blocker.
    Blocked,
    /// Suspended by hand; skipped by the scheduler until resumed or
    /// canceled.
    Waiting,
    /// Marked for teardown; reaped on the next scheduler pass.
    Canceled,
}

impl TaskState {
    /// States the scheduler may hand the CPU to.
    #[inline]
    #[must_use]
    pub const fn is_schedulable(self) -> bool {
        matches!(self, Self::Running | Self::Ready)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Blocked => "blocked",
            Self::Waiting => "waiting",
            Self::Canceled => "canceled",
        }
    }
}

/// One execution context.
pub struct Task {
    id: TaskId,
    name: String,
    pub(crate) state: TaskState,
    /// Owned user space, or `None` for kernel tasks sharing the kernel
    /// directory.
    pub(crate) space: Option<AddressSpace>,
    /// Named ranges of the task's virtual address space.
    pub(crate) mappings: Vec<MemoryMapping>,
    /// Current working path, behind its own lock. Taken only with
    /// interrupts enabled and never held across a yield.
    pub directory: Mutex<String>,
    /// Open resources, behind their own lock, same rules as `directory`.
    pub handles: Mutex<HandleTable>,
    /// The kernel stack allocation (identity placed).
    kernel_stack: VirtRegion,
    /// Push cursor into the kernel stack, growing down.
    kernel_stack_pointer: u32,
    /// Push cursor into the user stack, growing down.
    user_stack_pointer: u32,
    /// Kernel stack pointer to resume from, as saved by the scheduler.
    pub(crate) saved_stack_pointer: u32,
    entry_point: u32,
    user: bool,
    /// The blocker this task is parked on, consumed exactly once.
    pub(crate) blocker: Option<PendingBlocker>,
    pub(crate) exit_value: i32,
    /// Extended processor state saved across switches.
    pub(crate) fpu: FpuState,
}

impl Task {
    /// Build a task: address space, stacks, empty tables.
    ///
    /// Kernel tasks share the kernel directory; user tasks get a fresh
    /// space with the fixed-address user stack already mapped. The state
    /// starts at `None` until `go`.
    pub(crate) fn create(
        memory: &mut Memory,
        id: TaskId,
        name: &str,
        parent_directory: Option<&str>,
        user: bool,
    ) -> Result<Self, MemoryError> {
        let kernel_stack_base = memory.alloc_kernel(KERNEL_STACK_SIZE, MemoryFlags::CLEAR)?;
        let kernel_stack = VirtRegion::new(kernel_stack_base, KERNEL_STACK_SIZE);

        let mut space = None;
        let mut mappings = Vec::new();
        let mut user_stack_pointer = 0;

        if user {
            let mut user_space = match memory.create_user_space() {
                Ok(space) => space,
                Err(e) => {
                    let _ = memory.free_kernel(kernel_stack);
                    return Err(e);
                }
            };

            let stack = VirtRegion::new(VirtAddr::new(USER_STACK_BASE), USER_STACK_SIZE);
            if let Err(e) =
                memory.map_user(&mut user_space, stack, MemoryFlags::USER | MemoryFlags::CLEAR)
            {
                memory.destroy_user_space(user_space);
                let _ = memory.free_kernel(kernel_stack);
                return Err(e);
            }

            mappings.push(MemoryMapping {
                region: stack,
                kind: MappingKind::Private,
            });
            user_stack_pointer = USER_STACK_BASE + USER_STACK_SIZE as u32;
            space = Some(user_space);
        }

        let mut truncated = String::from(name);
        truncated.truncate(TASK_NAME_SIZE);

        Ok(Self {
            id,
            name: truncated,
            state: TaskState::None,
            space,
            mappings,
            directory: Mutex::new(String::from(parent_directory.unwrap_or("/"))),
            handles: Mutex::new(HandleTable::new()),
            kernel_stack,
            kernel_stack_pointer: kernel_stack_base.as_u32() + KERNEL_STACK_SIZE as u32,
            user_stack_pointer,
            saved_stack_pointer: 0,
            entry_point: 0,
            user,
            blocker: None,
            exit_value: 0,
            fpu: FpuState::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.user
    }

    #[inline]
    #[must_use]
    pub fn exit_value(&self) -> i32 {
        self.exit_value
    }

    /// The page directory this task runs under.
    #[must_use]
    pub fn directory_phys(&self, memory: &Memory) -> PhysAddr {
        match &self.space {
            Some(space) => space.directory_phys(),
            None => memory.kernel_space().directory_phys(),
        }
    }

    /// Top of the kernel stack, the ring-0 entry point for traps out of
    /// user mode.
    #[must_use]
    pub(crate) fn kernel_stack_top(&self) -> u32 {
        self.kernel_stack.base().as_u32() + KERNEL_STACK_SIZE as u32
    }

    pub(crate) fn set_entry(&mut self, entry: u32) {
        self.entry_point = entry;
    }

    /// Push bytes onto the kernel stack, growing down. Returns the new
    /// stack pointer, which is also where the bytes start.
    ///
    /// The kernel stack is identity placed, so it is written through the
    /// physical window regardless of the active directory.
    pub(crate) fn kernel_stack_push(&mut self, bytes: &[u8]) -> u32 {
        self.kernel_stack_pointer -= bytes.len() as u32;
        debug_assert!(self.kernel_stack_pointer >= self.kernel_stack.base().as_u32());

        // SAFETY: The cursor stays inside this task's own stack
        // allocation.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                minos_paging::phys_to_ptr::<u8>(PhysAddr::new(self.kernel_stack_pointer)),
                bytes.len(),
            );
        }
        self.kernel_stack_pointer
    }

    /// Pop bytes off the kernel stack into `out`, undoing a matching push.
    /// Returns the restored stack pointer.
    pub(crate) fn kernel_stack_pop(&mut self, out: &mut [u8]) -> u32 {
        debug_assert!(
            self.kernel_stack_pointer + (out.len() as u32)
                <= self.kernel_stack.base().as_u32() + KERNEL_STACK_SIZE as u32
        );

        // SAFETY: The cursor points at bytes previously pushed into this
        // task's own stack allocation.
        unsafe {
            core::ptr::copy_nonoverlapping(
                minos_paging::phys_to_ptr::<u8>(PhysAddr::new(self.kernel_stack_pointer)),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        self.kernel_stack_pointer += out.len() as u32;
        self.kernel_stack_pointer
    }

    /// Push bytes onto the user stack, growing down. Returns the new user
    /// stack pointer.
    ///
    /// Writes go through the task's own directory, so the target space
    /// need not be active.
    pub(crate) fn user_stack_push(&mut self, bytes: &[u8]) -> Result<u32, MemoryError> {
        let space = self.space.as_ref().ok_or(MemoryError::Invalid)?;

        self.user_stack_pointer -= bytes.len() as u32;
        if self.user_stack_pointer < USER_STACK_BASE {
            return Err(MemoryError::Invalid);
        }

        space.write_bytes(VirtAddr::new(self.user_stack_pointer), bytes)?;
        Ok(self.user_stack_pointer)
    }

    /// Push `argc`, `argv` and the argument strings onto the entry stack.
    ///
    /// Layout matches what a C runtime expects above its entry frame: the
    /// strings, then the pointer array, then `argv`, `argc`, and a null
    /// return-address slot. Entries never return; they exit.
    pub(crate) fn push_arguments(&mut self, args: &[&str]) -> Result<(), MemoryError> {
        let mut pointers = [0u32; TASK_ARG_COUNT];
        let argc = args.len().min(TASK_ARG_COUNT);

        if self.user {
            for (i, arg) in args.iter().take(argc).enumerate() {
                pointers[i] = self.push_user_str(arg)?;
            }
            let argv = self.push_user_words(&pointers[..argc])?;
            self.push_user_words(&[argc as u32, argv])?;
            self.push_user_words(&[0])?; // return-address slot
        } else {
            for (i, arg) in args.iter().take(argc).enumerate() {
                pointers[i] = self.push_kernel_str(arg);
            }
            let argv = self.push_kernel_words(&pointers[..argc]);
            self.push_kernel_words(&[argc as u32, argv]);
            self.push_kernel_words(&[0]);
        }

        Ok(())
    }

    fn push_kernel_str(&mut self, s: &str) -> u32 {
        let mut addr = self.kernel_stack_push(&[0]);
        if !s.is_empty() {
            addr = self.kernel_stack_push(s.as_bytes());
        }
        addr
    }

    fn push_kernel_words(&mut self, words: &[u32]) -> u32 {
        let mut addr = self.kernel_stack_pointer;
        for word in words.iter().rev() {
            addr = self.kernel_stack_push(&word.to_ne_bytes());
        }
        addr
    }

    fn push_user_str(&mut self, s: &str) -> Result<u32, MemoryError> {
        let mut addr = self.user_stack_push(&[0])?;
        if !s.is_empty() {
            addr = self.user_stack_push(s.as_bytes())?;
        }
        Ok(addr)
    }

    fn push_user_words(&mut self, words: &[u32]) -> Result<u32, MemoryError> {
        let mut addr = self.user_stack_pointer;
        for word in words.iter().rev() {
            addr = self.user_stack_push(&word.to_ne_bytes())?;
        }
        Ok(addr)
    }

    /// Prime the kernel stack with the synthetic interrupt frame that
    /// starts this task, and make it schedulable.
    ///
    /// The frame layout is the one the trampoline produces, so the first
    /// switch into this task is indistinguishable from a return from an
    /// interrupt.
    pub(crate) fn go(&mut self) {
        debug_assert_eq!(self.state, TaskState::None, "task started twice");

        if self.user {
            let frame = UserInterruptStackFrame::prime_user(self.entry_point, self.user_stack_pointer);
            // SAFETY: Plain #[repr(C)] integer struct viewed as bytes.
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    (&frame as *const UserInterruptStackFrame).cast::<u8>(),
                    core::mem::size_of::<UserInterruptStackFrame>(),
                )
            };
            self.saved_stack_pointer = self.kernel_stack_push(bytes);
        } else {
            let frame = InterruptStackFrame::prime_kernel(self.entry_point);
            // SAFETY: As above.
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    (&frame as *const InterruptStackFrame).cast::<u8>(),
                    core::mem::size_of::<InterruptStackFrame>(),
                )
            };
            self.saved_stack_pointer = self.kernel_stack_push(bytes);
        }

        self.state = TaskState::Running;
    }

    /// Release everything the task owns. Precondition: the task has been
    /// reaped (state `None`) and is off every scheduler list.
    pub(crate) fn destroy(mut self, memory: &mut Memory) {
        debug_assert_eq!(
            self.state,
            TaskState::None,
            "destroying a task that was not reaped"
        );

        if let Some(mut space) = self.space.take() {
            while let Some(mapping) = self.mappings.pop() {
                if let Err(e) = memory.retire_mapping(&mut space, &mapping) {
                    log::warn!(
                        "task {}: failed to retire mapping {:?}: {:?}",
                        self.id.value(),
                        mapping.region,
                        e
                    );
                }
            }
            memory.destroy_user_space(space);
        }

        self.handles.lock().close_all();

        if let Err(e) = memory.free_kernel(self.kernel_stack) {
            log::warn!(
                "task {}: failed to free kernel stack: {:?}",
                self.id.value(),
                e
            );
        }
    }

    /// Log the task's vitals.
    pub fn dump(&self, memory: &Memory) {
        log::info!(
            "task {} '{}': state={} {} pdir={:#010x}{}",
            self.id.value(),
            self.name,
            self.state.as_str(),
            if self.user { "user" } else { "kernel" },
            self.directory_phys(memory).as_u32(),
            if self.space.is_none() { " (kernel)" } else { "" },
        );
        if let Some(pending) = &self.blocker {
            log::info!(
                "  blocked on {} (deadline {:?})",
                pending.blocker.name(),
                pending.deadline
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::arena;
    use minos_arch::frame::{INITIAL_EFLAGS, KERNEL_CODE_SELECTOR, USER_CODE_SELECTOR};

    fn make_task(memory: &mut Memory, user: bool) -> Task {
        Task::create(memory, TaskId(1), "test", None, user).unwrap()
    }

    #[test]
    fn test_create_defaults() {
        let mut memory = arena::memory(1024);
        let task = make_task(&mut memory, false);

        assert_eq!(task.state(), TaskState::None);
        assert_eq!(task.name(), "test");
        assert_eq!(*task.directory.lock(), "/");
        assert_eq!(task.handles.lock().open_count(), 0);
        assert!(!task.is_user());

        task_drop(memory, task);
    }

    #[test]
    fn test_name_is_bounded() {
        let mut memory = arena::memory(1024);
        let long = "x".repeat(TASK_NAME_SIZE * 2);
        let task = Task::create(&mut memory, TaskId(2), &long, Some("/tmp"), false).unwrap();

        assert_eq!(task.name().len(), TASK_NAME_SIZE);
        assert_eq!(*task.directory.lock(), "/tmp");

        task_drop(memory, task);
    }

    #[test]
    fn test_kernel_stack_push_roundtrip() {
        let mut memory = arena::memory(1024);
        let mut task = make_task(&mut memory, false);

        let before = task.kernel_stack_pointer;
        let addr = task.kernel_stack_push(b"abcd");
        assert_eq!(addr, before - 4);

        // SAFETY: Identity-placed stack inside the test arena.
        let read = unsafe {
            core::slice::from_raw_parts(minos_paging::phys_to_ptr::<u8>(PhysAddr::new(addr)), 4)
        };
        assert_eq!(read, b"abcd");

        // Popping the same run restores the pointer and the bytes.
        let mut out = [0u8; 4];
        let restored = task.kernel_stack_pop(&mut out);
        assert_eq!(restored, before);
        assert_eq!(&out, b"abcd");

        task_drop(memory, task);
    }

    #[test]
    fn test_go_primes_kernel_frame() {
        let mut memory = arena::memory(1024);
        let mut task = make_task(&mut memory, false);

        task.set_entry(0x0030_0000);
        task.go();
        assert_eq!(task.state(), TaskState::Running);

        // SAFETY: The saved stack pointer names the primed frame inside
        // the arena-backed kernel stack.
        let frame = unsafe {
            &*minos_paging::phys_to_ptr::<InterruptStackFrame>(PhysAddr::new(
                task.saved_stack_pointer,
            ))
        };
        assert_eq!(frame.eip, 0x0030_0000);
        assert_eq!(frame.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(frame.eflags, INITIAL_EFLAGS);

        task.state = TaskState::None;
        task_drop(memory, task);
    }

    #[test]
    fn test_go_primes_user_frame_with_arguments() {
        let mut memory = arena::memory(1024);
        let mut task = make_task(&mut memory, true);

        task.set_entry(0x4000_0000);
        task.push_arguments(&["init", "-v"]).unwrap();
        task.go();

        // SAFETY: As in the kernel-frame test.
        let frame = unsafe {
            &*minos_paging::phys_to_ptr::<UserInterruptStackFrame>(PhysAddr::new(
                task.saved_stack_pointer,
            ))
        };
        assert_eq!(frame.inner.eip, 0x4000_0000);
        assert_eq!(frame.inner.cs, USER_CODE_SELECTOR);
        assert_eq!(frame.user_esp, task.user_stack_pointer);

        // The user stack now holds, top down: null return slot, argc,
        // argv pointer.
        let space = task.space.as_ref().unwrap();
        let esp = task.user_stack_pointer;
        let word = |va: u32| -> u32 {
            let pa = space.translate(VirtAddr::new(va)).unwrap();
            // SAFETY: Translated arena address.
            unsafe { *minos_paging::phys_to_ptr::<u32>(pa) }
        };
        assert_eq!(word(esp), 0, "return-address slot");
        assert_eq!(word(esp + 4), 2, "argc");
        let argv = word(esp + 8);
        let argv0 = word(argv);
        let pa = space.translate(VirtAddr::new(argv0)).unwrap();
        // SAFETY: Translated arena address.
        let name = unsafe { core::slice::from_raw_parts(minos_paging::phys_to_ptr::<u8>(pa), 4) };
        assert_eq!(name, b"init");

        task.state = TaskState::None;
        task_drop(memory, task);
    }

    #[test]
    fn test_destroy_returns_all_memory() {
        let mut memory = arena::memory(1024);
        let used_before = memory.used();

        let task = make_task(&mut memory, true);
        assert!(memory.used() > used_before);

        task.destroy(&mut memory);
        assert_eq!(memory.used(), used_before);
    }

    fn task_drop(mut memory: Memory, task: Task) {
        task.destroy(&mut memory);
    }
}
