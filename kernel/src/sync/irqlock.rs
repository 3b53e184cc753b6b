//! Interrupt-scoped critical sections and locks.
//!
//! The kernel's one and only mutual-exclusion primitive is "disable local
//! interrupts, scoped": every entry point that mutates a shared structure
//! saves the interrupt-enable state on entry and restores it on every exit
//! path. [`IrqGuard`] is that pattern as an RAII value; [`IrqMutex`] couples
//! it with a `spin::Mutex` so that the same types also stay sound if the
//! code is ever linked on a host (where the tests run threaded).

use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use crate::arch::irq;

/// RAII interrupt-off critical section.
///
/// Saves the current interrupt-enable state on construction, disables
/// interrupts, and restores the saved state on drop. Nesting is fine: inner
/// guards observe the already-disabled state and restore it unchanged.
pub struct IrqGuard {
    flags: usize,
}

impl IrqGuard {
    pub fn new() -> Self {
        Self {
            flags: irq::save_and_disable(),
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        irq::restore(self.flags);
    }
}

/// Run `f` with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new();
    f()
}

/// A spinlock whose critical sections additionally run with interrupts
/// disabled.
///
/// On the single supported CPU the spin part never actually spins (the
/// interrupt-off section cannot be preempted); it is what makes the type a
/// proper `Sync` container, and it does real work under the host test
/// harness, which is multi-threaded.
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let flags = irq::save_and_disable();
        IrqMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            flags,
        }
    }
}

/// Guard returned by [`IrqMutex::lock`]. Releases the spinlock, then
/// restores the saved interrupt state.
pub struct IrqMutexGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    flags: usize,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard is never used again; dropping it here releases
        // the spinlock before interrupts are re-enabled.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        irq::restore(self.flags);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_irq_mutex_basic() {
        let m = IrqMutex::new(41);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 42);
    }

    #[test]
    fn test_nested_guards() {
        let _outer = IrqGuard::new();
        {
            let _inner = IrqGuard::new();
        }
        // No state to observe on the host; this only checks that nesting
        // does not deadlock or panic.
        assert!(without_interrupts(|| true));
    }
}
