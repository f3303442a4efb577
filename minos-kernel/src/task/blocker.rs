//! Blockers
//!
//! A blocker is what a task attaches to itself to be put to sleep until a
//! predicate holds, a deadline passes, or the task is canceled. The
//! variants form a closed set with a dispatch function per operation; the
//! scheduler is the only caller of the predicate side.

use alloc::sync::Arc;
use core::fmt;

use super::handles::Resource;
use super::TaskId;

/// Relative timeout in ticks. `None` waits forever.
pub type Timeout = Option<u64>;

/// Why a blocked task woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockerResult {
    /// The predicate became true.
    Unblocked,
    /// The deadline passed first.
    Timeout,
    /// The task was canceled while blocked.
    Canceled,
    /// The predicate's subject no longer exists.
    Invalid,
}

/// What a task is waiting for.
pub enum Blocker {
    /// The tick counter reaching `wake_at`.
    Time { wake_at: u64 },
    /// A child task exiting. The exit value is captured on unblock.
    Wait {
        child: TaskId,
        exit_value: Option<i32>,
    },
    /// A resource becoming readable.
    Read { resource: Arc<dyn Resource> },
    /// A resource accepting writes.
    Write { resource: Arc<dyn Resource> },
    /// A connection on a resource being established.
    Connect { resource: Arc<dyn Resource> },
}

impl Blocker {
    /// Short name for logs and dumps.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Time { .. } => "time",
            Self::Wait { .. } => "wait",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Connect { .. } => "connect",
        }
    }
}

impl fmt::Debug for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time { wake_at } => write!(f, "Time(wake_at: {})", wake_at),
            Self::Wait { child, .. } => write!(f, "Wait({:?})", child),
            Self::Read { .. } => write!(f, "Read"),
            Self::Write { .. } => write!(f, "Write"),
            Self::Connect { .. } => write!(f, "Connect"),
        }
    }
}

/// A blocker installed in a task's slot, with its deadline and the result
/// the scheduler writes when resolving it.
#[derive(Debug)]
pub struct PendingBlocker {
    pub blocker: Blocker,
    /// Absolute deadline in ticks; `None` means no deadline.
    pub deadline: Option<u64>,
    /// Written exactly once by the scheduler when the task is released.
    pub result: Option<BlockerResult>,
}

impl PendingBlocker {
    #[must_use]
    pub fn new(blocker: Blocker, deadline: Option<u64>) -> Self {
        Self {
            blocker,
            deadline,
            result: None,
        }
    }

    /// True once the scheduler has resolved this blocker.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        let b = Blocker::Time { wake_at: 10 };
        assert_eq!(b.name(), "time");
        let b = Blocker::Wait {
            child: TaskId(3),
            exit_value: None,
        };
        assert_eq!(b.name(), "wait");
    }

    #[test]
    fn test_pending_resolution() {
        let mut pending = PendingBlocker::new(Blocker::Time { wake_at: 5 }, Some(7));
        assert!(!pending.is_resolved());
        pending.result = Some(BlockerResult::Timeout);
        assert!(pending.is_resolved());
    }
}
