//! Interrupt-safe synchronisation primitives
//!
//! Provides [`IrqSpinMutex`], a spinlock that disables interrupts while held,
//! and [`AtomicScope`], a counted interrupt-masking guard for code that needs
//! atomicity against the scheduler without protecting any particular datum.
//!
//! # Example
//!
//! ```ignore
//! use minos_arch::sync::IrqSpinMutex;
//!
//! static COUNTER: IrqSpinMutex<u64> = IrqSpinMutex::new(0);
//!
//! fn increment() {
//!     let mut guard = COUNTER.lock();
//!     *guard += 1;
//! }   // Interrupt flag restored here
//! ```

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::cpu::{disable_interrupts, interrupts_enabled, restore_interrupts};

// -- IrqSpinMutex

/// A spinlock that disables interrupts while held.
///
/// On a uniprocessor the spin never actually spins; the masking is the whole
/// point. It prevents the deadlock where a lock holder is preempted by an
/// interrupt handler that then tries to take the same lock.
///
/// # Safety Invariants
///
/// - The lock must be released (restoring the interrupt flag) before
///   blocking or yielding.
/// - Critical sections should be kept short.
pub struct IrqSpinMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqSpinMutex provides synchronisation for its data; the data is
// only reachable through a guard that holds the lock.
unsafe impl<T: Send> Sync for IrqSpinMutex<T> {}
unsafe impl<T: Send> Send for IrqSpinMutex<T> {}

impl<T> IrqSpinMutex<T> {
    /// Create a new mutex with the given value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, disabling interrupts.
    ///
    /// Returns a guard that restores the previous interrupt state when
    /// dropped.
    #[must_use]
    pub fn lock(&self) -> IrqSpinMutexGuard<'_, T> {
        // Mask before attempting to acquire, so an interrupt cannot fire
        // between the acquire and the masking.
        let saved_flags = disable_interrupts();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqSpinMutexGuard {
            mutex: self,
            saved_flags,
            _not_send: core::marker::PhantomData,
        }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Interrupts stay masked only if the lock was acquired.
    #[must_use]
    pub fn try_lock(&self) -> Option<IrqSpinMutexGuard<'_, T>> {
        let saved_flags = disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinMutexGuard {
                mutex: self,
                saved_flags,
                _not_send: core::marker::PhantomData,
            })
        } else {
            restore_interrupts(saved_flags);
            None
        }
    }

    /// Get a mutable reference to the underlying data.
    ///
    /// Safe because `&mut self` guarantees exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for IrqSpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Guard providing access to the locked data.
///
/// Interrupts are masked while the guard exists. Dropping it releases the
/// lock and restores the interrupt flag to its pre-lock state, not
/// unconditionally on.
///
/// The guard is `!Send`: it pairs a masking with an unmasking on the same
/// CPU.
pub struct IrqSpinMutexGuard<'a, T> {
    mutex: &'a IrqSpinMutex<T>,
    saved_flags: u32,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl<'a, T> Deref for IrqSpinMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqSpinMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqSpinMutexGuard<'a, T> {
    fn drop(&mut self) {
        // Release before restoring the flag, so a handler that fires the
        // instant interrupts come back can take the lock.
        self.mutex.locked.store(false, Ordering::Release);
        restore_interrupts(self.saved_flags);
    }
}

// -- AtomicScope

/// Nesting depth of open atomic scopes.
static ATOMIC_DEPTH: AtomicU32 = AtomicU32::new(0);

/// A counted, scoped atomic region.
///
/// Opening a scope masks interrupts and increments a depth counter; dropping
/// it decrements the counter and restores the interrupt state the scope
/// observed on entry, not unconditionally on. Scopes therefore nest freely,
/// replacing hand-paired mask/unmask calls: only the outermost drop actually
/// unmasks.
pub struct AtomicScope {
    saved_flags: u32,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl AtomicScope {
    /// Open an atomic scope.
    #[must_use]
    pub fn enter() -> Self {
        let saved_flags = disable_interrupts();
        ATOMIC_DEPTH.fetch_add(1, Ordering::Acquire);
        Self {
            saved_flags,
            _not_send: core::marker::PhantomData,
        }
    }

    /// Current nesting depth. Zero means no scope is open.
    #[must_use]
    pub fn depth() -> u32 {
        ATOMIC_DEPTH.load(Ordering::Acquire)
    }
}

impl Drop for AtomicScope {
    fn drop(&mut self) {
        let prev = ATOMIC_DEPTH.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "atomic scope underflow");
        restore_interrupts(self.saved_flags);
    }
}

/// Assert that the caller runs inside an atomic region.
///
/// Several core entry points (task creation, state transitions, scheduler
/// entry) are only sound with interrupts masked; they call this on entry.
/// Interrupt handlers run masked by the hardware without an `AtomicScope`,
/// so the check is on the flag itself, not on the depth counter.
#[track_caller]
pub fn assert_atomic() {
    debug_assert!(!interrupts_enabled(), "must be called with interrupts masked");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutex_roundtrip() {
        let m = IrqSpinMutex::new(7u32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 8);
    }

    #[test]
    fn test_try_lock_contended() {
        let m = IrqSpinMutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn test_scope_restores_interrupts() {
        crate::cpu::enable_interrupts();
        {
            let _outer = AtomicScope::enter();
            assert!(!crate::cpu::interrupts_enabled());
            {
                let _inner = AtomicScope::enter();
                assert!(!crate::cpu::interrupts_enabled());
            }
            // Still masked: only the outermost close restores.
            assert!(!crate::cpu::interrupts_enabled());
        }
        assert!(crate::cpu::interrupts_enabled());
    }
}
