//! Blocking mutex with ownership transfer.
//!
//! `unlock` with waiters does *not* clear the owner field: it wakes the
//! oldest waiter and leaves the stale owner pointer in place as a
//! sentinel, so a thread racing through `lock`/`try_lock` between the
//! wakeup and the waiter actually resuming cannot steal the mutex. The
//! woken waiter overwrites the owner with itself on its way out of
//! `lock`.

use core::cell::UnsafeCell;

use crate::{
    error::{KernelError, KernelResult},
    sched::{thread, waitq::WaitQueue, Thread},
    sync::irqlock::IrqGuard,
    time::Time,
};

pub struct Mutex {
    owner: UnsafeCell<*mut Thread>,
    queue: WaitQueue,
}

// SAFETY: the owner pointer is only touched inside interrupt-off critical
// sections on a single CPU (or under the host test lock); the wait queue
// carries its own locking.
unsafe impl Sync for Mutex {}
// SAFETY: as above.
unsafe impl Send for Mutex {}

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Self {
            owner: UnsafeCell::new(core::ptr::null_mut()),
            queue: WaitQueue::new(name),
        }
    }

    /// A mutex may only be torn down with no waiters.
    pub fn dispose(&self) -> KernelResult<()> {
        self.queue.dispose()
    }

    /// Acquire the mutex, waiting (with an optional timeout) while
    /// another thread holds it. Re-locking by the owner does not
    /// deadlock: it returns `Busy`.
    pub fn lock(&self, timeout: Option<&mut Time>) -> KernelResult<()> {
        let _irq = IrqGuard::new();
        // SAFETY: owner access is serialized by the critical section.
        unsafe {
            let owner = *self.owner.get();
            if !owner.is_null() {
                if owner == thread::current() {
                    return Err(KernelError::Busy);
                }
                // Wait for the previous owner to hand the mutex over.
                self.queue.wait(timeout)?;
            }
            // Either the mutex was free, or its ownership was transferred
            // to us by the unlocking thread.
            *self.owner.get() = thread::current();
        }
        Ok(())
    }

    /// Non-blocking acquire: `Busy` when held (even by the caller).
    pub fn try_lock(&self) -> KernelResult<()> {
        let _irq = IrqGuard::new();
        // SAFETY: as in `lock`.
        unsafe {
            if (*self.owner.get()).is_null() {
                *self.owner.get() = thread::current();
                Ok(())
            } else {
                Err(KernelError::Busy)
            }
        }
    }

    /// Release the mutex. Only the owner may unlock. With waiters, the
    /// oldest is woken and the owner field is left non-null (see the
    /// module documentation).
    pub fn unlock(&self) -> KernelResult<()> {
        let _irq = IrqGuard::new();
        // SAFETY: as in `lock`.
        unsafe {
            if *self.owner.get() != thread::current() {
                return Err(KernelError::PermissionDenied);
            }
            if self.queue.is_empty() {
                *self.owner.get() = core::ptr::null_mut();
                Ok(())
            } else {
                // Ownership transfer: the stale owner pointer stays as a
                // sentinel until the woken waiter claims the mutex.
                self.queue.wakeup(1, Ok(()))
            }
        }
    }

    /// Is the mutex currently held (diagnostics and tests)?
    pub fn is_locked(&self) -> bool {
        let _irq = IrqGuard::new();
        // SAFETY: as in `lock`.
        unsafe { !(*self.owner.get()).is_null() }
    }

    /// The wait queue, exposed for host-side tests that fabricate
    /// waiters.
    #[cfg(not(target_os = "none"))]
    pub fn wait_queue(&self) -> &WaitQueue {
        &self.queue
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::thread::ThreadState;
    use crate::sched::waitq::WaitEntry;

    #[test]
    fn test_lock_unlock_uncontended() {
        let _guard = crate::test_support::lock();
        crate::test_support::init_kernel();

        let m = Mutex::new("m");
        assert!(!m.is_locked());
        assert_eq!(m.lock(None), Ok(()));
        assert!(m.is_locked());

        // Re-locking by the owner reports Busy instead of deadlocking,
        // for both the blocking and non-blocking paths.
        assert_eq!(m.lock(None), Err(KernelError::Busy));
        assert_eq!(m.try_lock(), Err(KernelError::Busy));

        assert_eq!(m.unlock(), Ok(()));
        assert!(!m.is_locked());
        assert_eq!(m.try_lock(), Ok(()));
        assert_eq!(m.unlock(), Ok(()));
        assert_eq!(m.dispose(), Ok(()));
    }

    #[test]
    fn test_unlock_requires_ownership() {
        let _guard = crate::test_support::lock();
        crate::test_support::init_kernel();

        let m = Mutex::new("m");
        assert_eq!(m.unlock(), Err(KernelError::PermissionDenied));
    }

    #[test]
    fn test_unlock_transfers_ownership_to_waiter() {
        let _guard = crate::test_support::lock();
        crate::test_support::init_kernel();

        let m = Mutex::new("m");
        assert_eq!(m.lock(None), Ok(()));

        // A fabricated blocked waiter, as lock() would have parked it.
        let waiter = Box::into_raw(Box::new(crate::sched::Thread::new_record("w", 0, 0)));
        // SAFETY: live record.
        unsafe { (*waiter).set_state(ThreadState::Blocked) };
        let mut entry = WaitEntry::new_for(waiter);
        m.wait_queue().add_entry(&mut entry);

        // Unlock with a waiter: the waiter is woken with Ok...
        assert_eq!(m.unlock(), Ok(()));
        assert!(entry.triggered());
        assert_eq!(entry.status(), Ok(()));
        // SAFETY: live record.
        unsafe { assert_eq!((*waiter).state(), ThreadState::Ready) };

        // ...and the owner field stays non-null, so nobody can steal the
        // mutex before the waiter finishes acquiring it.
        assert!(m.is_locked());
        assert_eq!(m.try_lock(), Err(KernelError::Busy));

        crate::sched::scheduler::setup();
        // SAFETY: created above.
        drop(unsafe { Box::from_raw(waiter) });
    }
}
