//! Per-task handle table
//!
//! A bounded array of references to open resources. The resources
//! themselves (files, streams, sockets) live outside the core; the kernel
//! only manages slot allocation and lifetime, and asks readiness questions
//! on behalf of blockers.

use alloc::sync::Arc;

/// An open resource as the core sees it: readiness predicates for the
/// blocker framework and a close notification.
///
/// Implementations must answer the predicates without blocking; they are
/// polled from the scheduler with interrupts masked.
pub trait Resource: Send + Sync {
    fn can_read(&self) -> bool {
        false
    }

    fn can_write(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        false
    }

    /// Called when the last handle to the resource is dropped from a task.
    fn close(&self) {}
}

/// Handles per task.
pub const HANDLE_COUNT: usize = 64;

/// The bounded handle table of one task.
pub struct HandleTable {
    slots: [Option<Arc<dyn Resource>>; HANDLE_COUNT],
}

impl HandleTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; HANDLE_COUNT],
        }
    }

    /// Install a resource in the lowest free slot.
    ///
    /// Returns the handle index, or `None` when the table is full.
    pub fn open(&mut self, resource: Arc<dyn Resource>) -> Option<usize> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(resource);
        Some(slot)
    }

    /// The resource behind `handle`, if the slot is occupied.
    #[must_use]
    pub fn get(&self, handle: usize) -> Option<Arc<dyn Resource>> {
        self.slots.get(handle)?.clone()
    }

    /// Close one handle. Returns whether a resource was actually closed.
    pub fn close(&mut self, handle: usize) -> bool {
        match self.slots.get_mut(handle).and_then(Option::take) {
            Some(resource) => {
                resource.close();
                true
            }
            None => false,
        }
    }

    /// Close every handle. Called during task teardown.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(resource) = slot.take() {
                resource.close();
            }
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResource(AtomicUsize);

    impl Resource for CountingResource {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_open_lowest_slot() {
        let mut table = HandleTable::new();
        let r = Arc::new(CountingResource(AtomicUsize::new(0)));

        assert_eq!(table.open(r.clone()), Some(0));
        assert_eq!(table.open(r.clone()), Some(1));
        assert!(table.close(0));
        assert_eq!(table.open(r), Some(0));
    }

    #[test]
    fn test_close_all_notifies_each_resource() {
        let mut table = HandleTable::new();
        let r = Arc::new(CountingResource(AtomicUsize::new(0)));

        table.open(r.clone());
        table.open(r.clone());
        table.close_all();

        assert_eq!(r.0.load(Ordering::Relaxed), 2);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_table_is_bounded() {
        let mut table = HandleTable::new();
        let r = Arc::new(CountingResource(AtomicUsize::new(0)));

        for _ in 0..HANDLE_COUNT {
            assert!(table.open(r.clone()).is_some());
        }
        assert!(table.open(r).is_none());
    }
}
