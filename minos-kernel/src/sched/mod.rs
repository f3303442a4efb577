//! Scheduler and blocker protocol
//!
//! The scheduler owns the task registry: the global task list, the ready
//! queue, the monotonic id counter and the tick. Every core entry point
//! receives it explicitly; the kernel reaches it through one module-level
//! handle ([`with_scheduler`]), initialised as a distinct boot step.
//!
//! A scheduler pass runs with interrupts masked and is never reentered. It
//! saves the interrupted task's stack pointer, releases blocked tasks whose
//! predicate holds or whose deadline passed, reaps canceled tasks, picks
//! the next runnable task round-robin (the idle task when none), switches
//! the address space if it differs, and returns the chosen task's saved
//! kernel stack pointer for the trampoline to resume.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use minos_arch::sync::assert_atomic;
use minos_arch::{cpu, IrqSpinMutex, TICK_HZ};
use minos_common::PhysAddr;

use crate::memory::{self, Memory, MemoryError};
use crate::task::{
    Blocker, BlockerResult, PendingBlocker, Task, TaskId, TaskState, Timeout,
};

/// Errors from task-level operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// No task with that id.
    NoSuchTask,
    /// Physical or virtual memory exhausted.
    OutOfMemory,
    /// Malformed request.
    Invalid,
}

impl From<MemoryError> for TaskError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::OutOfMemory => Self::OutOfMemory,
            _ => Self::Invalid,
        }
    }
}

/// Outcome of installing a blocker.
#[derive(Debug)]
pub enum BlockOutcome {
    /// The predicate already held (or was already dead); the task never
    /// slept. Carries the consumed blocker with its result.
    Ready(PendingBlocker),
    /// The task is parked; it must yield and collect the result with
    /// [`Scheduler::block_finish`] after waking.
    Parked,
}

/// How the sweep releases one blocked task.
enum Release {
    Unblock { exit: Option<i32> },
    TimedOut,
    Invalid,
}

/// The task registry and scheduling state.
pub struct Scheduler {
    tasks: BTreeMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    current: Option<TaskId>,
    idle: TaskId,
    /// Monotonic tick counter advanced by the timer interrupt.
    tick: u64,
    /// Monotonic id counter; ids are never reused.
    next_id: u32,
    /// The directory currently loaded, to skip redundant switches.
    active_directory: PhysAddr,
    /// Guard against nested scheduler entry.
    in_pass: bool,
}

impl Scheduler {
    /// Build the registry and its idle task.
    pub fn new(memory: &mut Memory) -> Result<Self, MemoryError> {
        let mut scheduler = Self {
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            current: None,
            idle: TaskId(0),
            tick: 0,
            next_id: 0,
            active_directory: memory.kernel_space().directory_phys(),
            in_pass: false,
        };

        let idle = scheduler.create_task(memory, None, "idle", false)?;
        scheduler.set_entry(idle, idle_entry_address());
        scheduler.go(idle);
        // The idle task is the fallback, never a queue member.
        scheduler.ready.clear();
        scheduler.idle = idle;

        Ok(scheduler)
    }

    // -- Registry

    /// Create a task in state `None`. It joins the registry but is not
    /// schedulable until [`go`](Self::go).
    pub fn create_task(
        &mut self,
        memory: &mut Memory,
        parent: Option<TaskId>,
        name: &str,
        user: bool,
    ) -> Result<TaskId, MemoryError> {
        assert_atomic();

        let id = TaskId(self.next_id);
        let parent_directory = parent
            .and_then(|p| self.tasks.get(&p))
            .map(|p| p.directory.lock().clone());

        let task = Task::create(memory, id, name, parent_directory.as_deref(), user)?;
        self.next_id += 1;
        self.tasks.insert(id, task);

        log::debug!(
            "task {} '{}' created ({})",
            id.value(),
            name,
            if user { "user" } else { "kernel" }
        );
        Ok(id)
    }

    /// Create, prime and start a task in one step.
    pub fn spawn(
        &mut self,
        memory: &mut Memory,
        parent: Option<TaskId>,
        name: &str,
        entry: u32,
        args: &[&str],
        user: bool,
    ) -> Result<TaskId, TaskError> {
        assert_atomic();

        let id = self.create_task(memory, parent, name, user)?;
        let task = self.tasks.get_mut(&id).expect("task vanished after create");

        task.set_entry(entry);
        if let Err(e) = task.push_arguments(args) {
            // Unwind the half-built task.
            if let Some(task) = self.tasks.remove(&id) {
                let mut dead = task;
                dead.state = TaskState::None;
                dead.destroy(memory);
            }
            return Err(e.into());
        }

        self.go(id);
        Ok(id)
    }

    /// Transition a freshly created task to `Running` and queue it.
    pub fn go(&mut self, id: TaskId) {
        assert_atomic();

        if let Some(task) = self.tasks.get_mut(&id) {
            task.go();
            self.ready.push_back(id);
        }
    }

    pub(crate) fn set_entry(&mut self, id: TaskId, entry: u32) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.set_entry(entry);
        }
    }

    /// The running task's id. `None` only before the first pass.
    #[must_use]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// Number of registered tasks, the idle task included.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Run `f` against a task, if it exists.
    pub fn with_task<R>(&self, id: TaskId, f: impl FnOnce(&Task) -> R) -> Option<R> {
        self.tasks.get(&id).map(f)
    }

    /// Run `f` over every registered task.
    pub fn for_each_task(&self, mut f: impl FnMut(&Task)) {
        for task in self.tasks.values() {
            f(task);
        }
    }

    /// The current tick count.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Monotonic uptime derived from the tick, in milliseconds.
    #[must_use]
    pub fn uptime_ms(&self) -> u64 {
        self.tick * 1000 / TICK_HZ as u64
    }

    // -- Cancellation

    /// Mark a task for teardown. The scheduler reaps it on a later pass;
    /// a blocked victim has its blocker resolved with `Canceled` first.
    pub fn cancel(&mut self, id: TaskId, exit_value: i32) -> Result<(), TaskError> {
        assert_atomic();

        let task = self.tasks.get_mut(&id).ok_or(TaskError::NoSuchTask)?;
        task.exit_value = exit_value;
        task.state = TaskState::Canceled;
        log::debug!("task {} canceled (exit {})", id.value(), exit_value);
        Ok(())
    }

    // -- Blocking

    /// Install a blocker on a task.
    ///
    /// If the predicate already holds the blocker resolves immediately and
    /// the task never sleeps. Otherwise the deadline is armed, the task is
    /// marked `Blocked`, and the caller must yield.
    ///
    /// # Panics
    ///
    /// Panics if the task already has a blocker installed; blocking twice
    /// is a kernel bug.
    pub fn block_begin(
        &mut self,
        id: TaskId,
        blocker: Blocker,
        timeout: Timeout,
    ) -> Result<BlockOutcome, TaskError> {
        assert_atomic();

        let task = self.tasks.get(&id).ok_or(TaskError::NoSuchTask)?;
        assert!(task.blocker.is_none(), "task {} blocked twice", id.value());

        let mut pending = PendingBlocker::new(blocker, timeout.map(|t| self.tick + t));

        // Fast path: predicate already true (or its subject already gone).
        // The deadline plays no part here; a zero timeout with a false
        // predicate still parks until the next pass.
        if let Some(release) = self.check_predicate(&pending.blocker) {
            Self::resolve(&mut pending, release);
            return Ok(BlockOutcome::Ready(pending));
        }

        let task = self.tasks.get_mut(&id).expect("checked above");
        task.blocker = Some(pending);
        task.state = TaskState::Blocked;
        Ok(BlockOutcome::Parked)
    }

    /// Collect the result after a parked task has been released and
    /// rescheduled. Clears the blocker slot.
    ///
    /// # Panics
    ///
    /// Panics if the task has no resolved blocker; calling this before the
    /// scheduler released the task is a kernel bug.
    pub fn block_finish(&mut self, id: TaskId) -> PendingBlocker {
        assert_atomic();

        let task = self.tasks.get_mut(&id).expect("blocked task vanished");
        let pending = task.blocker.take().expect("no blocker installed");
        assert!(pending.is_resolved(), "blocker collected while unresolved");
        pending
    }

    /// Evaluate a blocker's predicate against the registry.
    ///
    /// Conditions inspected here must be re-checked on every pass, never
    /// cached, so a wake that happens after atomicity is released is
    /// observed on the following pass.
    fn check_predicate(&self, blocker: &Blocker) -> Option<Release> {
        match blocker {
            Blocker::Time { wake_at } => (self.tick >= *wake_at).then_some(Release::Unblock { exit: None }),
            Blocker::Wait { child, .. } => match self.tasks.get(child) {
                None => Some(Release::Invalid),
                Some(c) if c.state == TaskState::Canceled => Some(Release::Unblock {
                    exit: Some(c.exit_value),
                }),
                Some(_) => None,
            },
            Blocker::Read { resource } => resource.can_read().then_some(Release::Unblock { exit: None }),
            Blocker::Write { resource } => resource.can_write().then_some(Release::Unblock { exit: None }),
            Blocker::Connect { resource } => {
                resource.is_connected().then_some(Release::Unblock { exit: None })
            }
        }
    }

    /// Write the outcome into a pending blocker, running the variant's
    /// unblock side effect.
    fn resolve(pending: &mut PendingBlocker, release: Release) {
        match release {
            Release::Unblock { exit } => {
                if let Blocker::Wait { exit_value, .. } = &mut pending.blocker {
                    *exit_value = exit;
                }
                pending.result = Some(BlockerResult::Unblocked);
            }
            Release::TimedOut => pending.result = Some(BlockerResult::Timeout),
            Release::Invalid => pending.result = Some(BlockerResult::Invalid),
        }
    }

    // -- The pass

    /// Advance the tick and run a pass. The timer interrupt's entry point.
    pub fn timer_tick(&mut self, memory: &mut Memory, saved_esp: u32) -> u32 {
        self.tick += 1;
        SYSTEM_TICK.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        self.schedule(memory, saved_esp)
    }

    /// One scheduler pass. See the module documentation for the steps.
    pub fn schedule(&mut self, memory: &mut Memory, saved_esp: u32) -> u32 {
        assert_atomic();
        assert!(!self.in_pass, "scheduler entered recursively");
        self.in_pass = true;

        // 1. Put the interrupted task back.
        if let Some(current) = self.current {
            if let Some(task) = self.tasks.get_mut(&current) {
                task.saved_stack_pointer = saved_esp;
                cpu::save_context(&mut task.fpu);
                if task.state == TaskState::Running {
                    task.state = TaskState::Ready;
                    if current != self.idle {
                        self.ready.push_back(current);
                    }
                }
            }
        }

        // 2. Sweep blocked tasks.
        self.sweep_blocked();

        // 3. Reap canceled tasks that are not on the CPU.
        self.reap(memory);

        // 4. Round-robin over the ready queue; fall back to idle.
        let next = self.pick_next();

        // 5. Switch the address space if the chosen task lives in another.
        let directory = self
            .tasks
            .get(&next)
            .map(|t| t.directory_phys(memory))
            .expect("picked task vanished");
        if directory != self.active_directory {
            cpu::load_page_directory(directory.as_u32());
            self.active_directory = directory;
        }

        // 6. Hand over.
        let task = self.tasks.get_mut(&next).expect("picked task vanished");
        if task.is_user() {
            cpu::set_kernel_stack(task.kernel_stack_top());
        }
        task.state = TaskState::Running;
        cpu::load_context(&task.fpu);
        let next_esp = task.saved_stack_pointer;
        self.current = Some(next);

        self.in_pass = false;
        next_esp
    }

    /// Release blocked tasks whose predicate holds, whose deadline has
    /// passed, or whose task was canceled underneath them.
    fn sweep_blocked(&mut self) {
        let mut released: Vec<(TaskId, Release)> = Vec::new();
        let mut canceled_blocked: Vec<TaskId> = Vec::new();

        for (id, task) in &self.tasks {
            match task.state {
                TaskState::Blocked => {
                    let Some(pending) = &task.blocker else {
                        continue;
                    };
                    if let Some(release) = self.check_predicate(&pending.blocker) {
                        released.push((*id, release));
                    } else if pending.deadline.is_some_and(|d| d <= self.tick) {
                        released.push((*id, Release::TimedOut));
                    }
                }
                TaskState::Canceled => {
                    if task.blocker.as_ref().is_some_and(|p| !p.is_resolved()) {
                        canceled_blocked.push(*id);
                    }
                }
                _ => {}
            }
        }

        for (id, release) in released {
            let task = self.tasks.get_mut(&id).expect("swept task vanished");
            if let Some(pending) = task.blocker.as_mut() {
                Self::resolve(pending, release);
            }
            task.state = TaskState::Ready;
            self.ready.push_back(id);
        }

        // A canceled task never runs again; its blocker just records why
        // it stopped waiting.
        for id in canceled_blocked {
            let task = self.tasks.get_mut(&id).expect("swept task vanished");
            if let Some(pending) = task.blocker.as_mut() {
                pending.result = Some(BlockerResult::Canceled);
            }
        }
    }

    /// Destroy canceled tasks that are not currently on the CPU, waking
    /// any task waiting on them first.
    fn reap(&mut self, memory: &mut Memory) {
        let dead: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(id, task)| {
                task.state == TaskState::Canceled && Some(**id) != self.current
            })
            .map(|(id, _)| *id)
            .collect();

        for id in dead {
            let exit_value = self.tasks.get(&id).map(|t| t.exit_value).unwrap_or(-1);

            // Waiters observing the dying task unblock with its exit value.
            let waiters: Vec<TaskId> = self
                .tasks
                .iter()
                .filter(|(_, t)| {
                    t.state == TaskState::Blocked
                        && matches!(
                            t.blocker.as_ref().map(|p| &p.blocker),
                            Some(Blocker::Wait { child, .. }) if *child == id
                        )
                })
                .map(|(wid, _)| *wid)
                .collect();

            for waiter in waiters {
                let task = self.tasks.get_mut(&waiter).expect("waiter vanished");
                if let Some(pending) = task.blocker.as_mut() {
                    Self::resolve(
                        pending,
                        Release::Unblock {
                            exit: Some(exit_value),
                        },
                    );
                }
                task.state = TaskState::Ready;
                self.ready.push_back(waiter);
            }

            let mut task = self.tasks.remove(&id).expect("reaped task vanished");
            log::debug!("task {} reaped (exit {})", id.value(), exit_value);
            task.state = TaskState::None;
            task.destroy(memory);
        }
    }

    /// Pop the next schedulable task off the ready queue, skipping stale
    /// entries, falling back to the idle task.
    fn pick_next(&mut self) -> TaskId {
        while let Some(id) = self.ready.pop_front() {
            if self
                .tasks
                .get(&id)
                .is_some_and(|t| t.state.is_schedulable())
            {
                return id;
            }
        }
        self.idle
    }
}

/// The address the idle task starts at.
///
/// On the real machine this is a halt loop; the hosted backend never
/// executes task entries, so the value is only a number in a frame.
fn idle_entry_address() -> u32 {
    #[cfg(target_arch = "x86")]
    {
        idle_entry as usize as u32
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

/// The idle task: wait for interrupts forever.
#[cfg(target_arch = "x86")]
extern "C" fn idle_entry() -> ! {
    loop {
        cpu::wait_for_interrupt();
    }
}

// -- Global instance

/// Lock-free mirror of the tick counter for readers that must not take the
/// scheduler lock (the logger, mainly). The scheduler's own field stays the
/// authoritative value for deadlines.
static SYSTEM_TICK: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// The tick count without locking. May trail the scheduler by one pass.
#[must_use]
pub fn uptime_ticks() -> u64 {
    SYSTEM_TICK.load(core::sync::atomic::Ordering::Relaxed)
}

static SCHEDULER: IrqSpinMutex<Option<Scheduler>> = IrqSpinMutex::new(None);

/// Initialise the scheduler. A distinct boot step, after [`memory::init`].
pub fn init() {
    let scheduler = memory::with_memory(Scheduler::new).expect("scheduler initialisation failed");
    *SCHEDULER.lock() = Some(scheduler);
    log::info!("scheduler: ready (idle task installed)");
}

/// Run `f` with the scheduler locked (interrupts masked).
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let mut guard = SCHEDULER.lock();
    let scheduler = guard.as_mut().expect("scheduler not initialised");
    f(scheduler)
}

/// Give up the CPU voluntarily through the yield trap.
pub fn yield_now() {
    cpu::yield_now();
}

/// Block the running task on `blocker`.
///
/// Composes the protocol: install under atomicity, yield if parked, then
/// collect the result. Returns the consumed blocker carrying the result
/// and any captured exit value.
pub fn block_current(blocker: Blocker, timeout: Timeout) -> PendingBlocker {
    let (id, outcome) = with_scheduler(|s| {
        let id = s.current().expect("no current task to block");
        let outcome = s.block_begin(id, blocker, timeout);
        (id, outcome)
    });

    match outcome.expect("current task must exist") {
        BlockOutcome::Ready(pending) => pending,
        BlockOutcome::Parked => {
            yield_now();
            with_scheduler(|s| s.block_finish(id))
        }
    }
}

/// Park the running task until `ticks` ticks from now have elapsed.
pub fn sleep(ticks: u64) -> BlockerResult {
    let wake_at = with_scheduler(|s| s.tick()) + ticks;
    block_current(Blocker::Time { wake_at }, None)
        .result
        .unwrap_or(BlockerResult::Invalid)
}

/// Wait for `child` to exit, returning its exit value.
pub fn wait(child: TaskId) -> Result<i32, TaskError> {
    with_scheduler(|s| {
        if s.with_task(child, |_| ()).is_none() {
            return Err(TaskError::NoSuchTask);
        }
        Ok(())
    })?;

    let pending = block_current(
        Blocker::Wait {
            child,
            exit_value: None,
        },
        None,
    );

    match pending.result {
        Some(BlockerResult::Unblocked) => {
            if let Blocker::Wait { exit_value, .. } = pending.blocker {
                Ok(exit_value.unwrap_or(-1))
            } else {
                Err(TaskError::Invalid)
            }
        }
        _ => Err(TaskError::Invalid),
    }
}

/// Terminate the running task with `exit_value`.
///
/// The cancellation is observed by the next pass; the yield makes that
/// pass happen now. Never returns.
#[cfg(target_arch = "x86")]
pub fn exit(exit_value: i32) -> ! {
    with_scheduler(|s| {
        let id = s.current().expect("no current task to exit");
        let _ = s.cancel(id, exit_value);
    });
    yield_now();
    unreachable!("canceled task was rescheduled");
}

/// Cancel a task by id.
pub fn cancel(id: TaskId, exit_value: i32) -> Result<(), TaskError> {
    with_scheduler(|s| s.cancel(id, exit_value))
}

/// The current tick count.
#[must_use]
pub fn tick() -> u64 {
    with_scheduler(|s| s.tick())
}

/// Monotonic uptime in milliseconds.
#[must_use]
pub fn uptime_ms() -> u64 {
    with_scheduler(|s| s.uptime_ms())
}

/// Log every task's vitals.
pub fn dump_tasks() {
    memory::with_memory(|memory| {
        with_scheduler(|s| {
            s.for_each_task(|task| task.dump(memory));
        });
    });
}
