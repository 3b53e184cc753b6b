//! Counting semaphore.

use core::cell::UnsafeCell;

use crate::{
    error::{KernelError, KernelResult},
    sched::waitq::WaitQueue,
    sync::irqlock::IrqGuard,
    time::Time,
};

/// A counting semaphore: a signed counter plus a wait queue. A negative
/// counter's magnitude is the number of waiters.
pub struct Semaphore {
    value: UnsafeCell<i32>,
    queue: WaitQueue,
}

// SAFETY: the counter is only touched inside interrupt-off critical
// sections on a single CPU (or under the host test lock); the wait queue
// carries its own locking.
unsafe impl Sync for Semaphore {}
// SAFETY: as above.
unsafe impl Send for Semaphore {}

impl Semaphore {
    pub const fn new(name: &'static str, initial: i32) -> Self {
        Self {
            value: UnsafeCell::new(initial),
            queue: WaitQueue::new(name),
        }
    }

    /// A semaphore may only be torn down with no waiters.
    pub fn dispose(&self) -> KernelResult<()> {
        self.queue.dispose()
    }

    /// Take one unit, waiting (with an optional timeout, semantics of
    /// [`crate::sched::thread::sleep`]) when none is available. On
    /// timeout or foreign wakeup, the taken-back decrement is reverted
    /// and the error surfaced.
    pub fn down(&self, timeout: Option<&mut Time>) -> KernelResult<()> {
        let _irq = IrqGuard::new();
        // SAFETY: counter access is serialized by the critical section.
        unsafe {
            *self.value.get() -= 1;
            if *self.value.get() < 0 {
                let result = self.queue.wait(timeout);
                if result.is_err() {
                    // Pretend we never asked.
                    *self.value.get() += 1;
                }
                result
            } else {
                Ok(())
            }
        }
    }

    /// Non-blocking take: `Busy` when no unit is available.
    pub fn try_down(&self) -> KernelResult<()> {
        let _irq = IrqGuard::new();
        // SAFETY: as in `down`.
        unsafe {
            if *self.value.get() >= 1 {
                *self.value.get() -= 1;
                Ok(())
            } else {
                Err(KernelError::Busy)
            }
        }
    }

    /// Release one unit and wake the oldest waiter, if any.
    pub fn up(&self) -> KernelResult<()> {
        let _irq = IrqGuard::new();
        // SAFETY: as in `down`.
        unsafe {
            *self.value.get() += 1;
        }
        self.queue.wakeup(1, Ok(()))
    }

    /// Current counter value (diagnostics and tests).
    pub fn value(&self) -> i32 {
        let _irq = IrqGuard::new();
        // SAFETY: as in `down`.
        unsafe { *self.value.get() }
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
    use crate::sched::thread::{Thread, ThreadState};
    use crate::sched::waitq::WaitEntry;

    #[test]
    fn test_try_down_tracks_counter() {
        let sem = Semaphore::new("sem", 2);
        assert_eq!(sem.try_down(), Ok(()));
        assert_eq!(sem.try_down(), Ok(()));
        assert_eq!(sem.value(), 0);
        assert_eq!(sem.try_down(), Err(KernelError::Busy));

        sem.up().unwrap();
        assert_eq!(sem.value(), 1);
        assert_eq!(sem.try_down(), Ok(()));
        assert_eq!(sem.dispose(), Ok(()));
    }

    #[test]
    fn test_up_wakes_oldest_waiter() {
        let _guard = crate::test_support::lock();
        crate::sched::scheduler::setup();

        let sem = Semaphore::new("sem", 0);
        let waiter = Box::into_raw(Box::new(Thread::new_record("w", 0, 0)));
        // SAFETY: live record.
        unsafe { (*waiter).set_state(ThreadState::Blocked) };

        // Fabricate the state down() would leave: counter at -1, entry
        // queued.
        assert_eq!(sem.try_down(), Err(KernelError::Busy));
        // SAFETY: counter poke mirrors the blocking down() path.
        unsafe { *sem.value.get() -= 1 };
        let mut entry = WaitEntry::new_for(waiter);
        sem.wait_queue().add_entry(&mut entry);

        sem.up().unwrap();
        assert_eq!(sem.value(), 0);
        assert!(entry.triggered());
        assert_eq!(entry.status(), Ok(()));
        // SAFETY: live record.
        unsafe { assert_eq!((*waiter).state(), ThreadState::Ready) };

        crate::sched::scheduler::setup();
        // SAFETY: created above.
        drop(unsafe { Box::from_raw(waiter) });
    }
}
