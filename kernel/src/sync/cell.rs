//! Interrupt-gated global cell.
//!
//! The memory subsystems (ranges, slabs, kmalloc) call back into each other
//! while allocating their own descriptors, so they cannot sit behind
//! individual non-reentrant locks. On a single processor their mutual
//! exclusion is the classic one: interrupts disabled for the duration of
//! the structural update. [`GlobalCell`] is the storage half of that
//! discipline; the caller provides the interrupt-off critical section
//! (usually an [`super::irqlock::IrqGuard`]).

use core::cell::UnsafeCell;

/// A `Sync` wrapper around mutable global state whose accesses are
/// serialized by disabling local interrupts.
#[repr(transparent)]
pub struct GlobalCell<T>(UnsafeCell<T>);

// SAFETY: all mutation goes through raw pointers obtained from
// `as_mut_ptr`, and every call site is required to run with interrupts
// disabled on the single supported CPU (or under the host test lock),
// which serializes access.
unsafe impl<T> Sync for GlobalCell<T> {}

impl<T> GlobalCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Raw pointer to the protected value.
    ///
    /// Dereferencing it is only sound inside an interrupt-off critical
    /// section (see the module documentation).
    pub fn as_mut_ptr(&self) -> *mut T {
        self.0.get()
    }
}
