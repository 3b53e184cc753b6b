//! The ready queue.
//!
//! A single FIFO of runnable threads, linked through dedicated fields of
//! the thread record. The scheduler makes exactly one decision: which
//! thread runs next; everything else (blocking, timeouts, wakeups) lives
//! in the thread and wait-queue layers.

use crate::sync::irqlock::IrqMutex;

use super::thread::{Thread, ThreadState};

/// FIFO of ready threads.
pub struct ReadyQueue {
    head: *mut Thread,
    tail: *mut Thread,
    count: usize,
}

// SAFETY: thread records outlive their queue membership and all accesses
// run under the queue lock with interrupts disabled (or the host test
// lock).
unsafe impl Send for ReadyQueue {}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append `thread` and mark it Ready. Only threads that are being
    /// born, yielding, or waking from a block may enter the queue.
    fn enqueue(&mut self, thread: *mut Thread, at_tail: bool) {
        // SAFETY: the caller passes a live thread record; the queue lock
        // is held.
        unsafe {
            let state = (*thread).state();
            assert!(
                matches!(
                    state,
                    ThreadState::Created | ThreadState::Running | ThreadState::Blocked
                ),
                "thread {} entering the ready queue in state {state:?}",
                (*thread).name(),
            );

            if at_tail {
                (*thread).ready_prev = self.tail;
                (*thread).ready_next = core::ptr::null_mut();
                if self.tail.is_null() {
                    self.head = thread;
                } else {
                    (*self.tail).ready_next = thread;
                }
                self.tail = thread;
            } else {
                (*thread).ready_prev = core::ptr::null_mut();
                (*thread).ready_next = self.head;
                if self.head.is_null() {
                    self.tail = thread;
                } else {
                    (*self.head).ready_prev = thread;
                }
                self.head = thread;
            }
            self.count += 1;
            (*thread).set_state(ThreadState::Ready);
        }
    }

    fn pop_head(&mut self) -> *mut Thread {
        let thread = self.head;
        assert!(!thread.is_null());
        // SAFETY: a queued thread record is live; lock held.
        unsafe {
            self.head = (*thread).ready_next;
            if self.head.is_null() {
                self.tail = core::ptr::null_mut();
            } else {
                (*self.head).ready_prev = core::ptr::null_mut();
            }
            (*thread).ready_prev = core::ptr::null_mut();
            (*thread).ready_next = core::ptr::null_mut();
        }
        self.count -= 1;
        thread
    }

    /// Make `thread` runnable. Idempotent: an already-Ready thread is left
    /// where it is.
    pub fn set_ready(&mut self, thread: *mut Thread) {
        // SAFETY: live thread record, lock held.
        if unsafe { (*thread).state() } == ThreadState::Ready {
            return;
        }
        self.enqueue(thread, true);
    }

    /// Pick the next thread to run. `current` is reinserted (at the tail
    /// when yielding, at the head otherwise) unless it is terminating or
    /// blocked. An empty queue is fatal: the idle thread must always be
    /// runnable.
    pub fn reschedule(&mut self, current: *mut Thread, do_yield: bool) -> *mut Thread {
        // SAFETY: live thread record, lock held.
        let state = unsafe { (*current).state() };
        match state {
            ThreadState::Zombie => {
                // Never coming back.
            }
            ThreadState::Blocked => {
                // Parked on a wait queue or sleeping; a wakeup will
                // reinsert it.
            }
            _ => self.enqueue(current, do_yield),
        }

        if self.is_empty() {
            panic!("no kernel thread ready to run");
        }
        self.pop_head()
    }
}

static READY_QUEUE: IrqMutex<ReadyQueue> = IrqMutex::new(ReadyQueue::new());

/// Reset the scheduler at boot.
pub fn setup() {
    *READY_QUEUE.lock() = ReadyQueue::new();
}

/// Make `thread` runnable (idempotent).
pub fn set_ready(thread: *mut Thread) {
    READY_QUEUE.lock().set_ready(thread);
}

/// Pick the next thread, reinserting `current` per the policy above.
pub(crate) fn reschedule(current: *mut Thread, do_yield: bool) -> *mut Thread {
    READY_QUEUE.lock().reschedule(current, do_yield)
}

/// Number of threads currently queued.
pub fn ready_count() -> usize {
    READY_QUEUE.lock().len()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::thread::Thread;

    fn spawn_record(name: &str) -> *mut Thread {
        Box::into_raw(Box::new(Thread::new_record(name, 0, 0)))
    }

    fn release_record(t: *mut Thread) {
        // SAFETY: created by `spawn_record`.
        drop(unsafe { Box::from_raw(t) });
    }

    #[test]
    fn test_fifo_order_and_set_ready_idempotence() {
        let mut q = ReadyQueue::new();
        let a = spawn_record("a");
        let b = spawn_record("b");
        let c = spawn_record("c");

        q.set_ready(a);
        q.set_ready(b);
        q.set_ready(c);
        assert_eq!(q.len(), 3);

        // Idempotent: re-readying a Ready thread changes nothing.
        q.set_ready(b);
        assert_eq!(q.len(), 3);

        assert_eq!(q.pop_head(), a);
        assert_eq!(q.pop_head(), b);
        assert_eq!(q.pop_head(), c);
        assert!(q.is_empty());

        for t in [a, b, c] {
            release_record(t);
        }
    }

    #[test]
    fn test_reschedule_yield_goes_to_tail() {
        let mut q = ReadyQueue::new();
        let a = spawn_record("a");
        let b = spawn_record("b");
        q.set_ready(a);
        q.set_ready(b);

        // `a` runs, then yields: it must requeue behind `b`.
        let running = q.pop_head();
        assert_eq!(running, a);
        // SAFETY: live record.
        unsafe { (*running).set_state(ThreadState::Running) };
        let next = q.reschedule(running, true);
        assert_eq!(next, b);
        // `b` runs and yields in turn: back to `a`.
        // SAFETY: live record.
        unsafe { (*next).set_state(ThreadState::Running) };
        let after = q.reschedule(next, true);
        assert_eq!(after, a);

        // Drain: the two records are still queued/selected states.
        release_record(a);
        release_record(b);
    }

    #[test]
    fn test_reschedule_skips_blocked_and_zombie() {
        let mut q = ReadyQueue::new();
        let a = spawn_record("a");
        let idle = spawn_record("idle");
        q.set_ready(idle);

        // A blocked thread is not reinserted.
        // SAFETY: live record.
        unsafe { (*a).set_state(ThreadState::Blocked) };
        let next = q.reschedule(a, false);
        assert_eq!(next, idle);
        assert!(q.is_empty());

        // Neither is a zombie.
        // SAFETY: live record (the popped thread is now "running").
        unsafe { (*idle).set_state(ThreadState::Running) };
        q.set_ready(idle);
        // SAFETY: live record.
        unsafe { (*a).set_state(ThreadState::Zombie) };
        let next = q.reschedule(a, true);
        assert_eq!(next, idle);

        release_record(a);
        release_record(idle);
    }

    #[test]
    #[should_panic(expected = "no kernel thread ready")]
    fn test_empty_queue_is_fatal() {
        let mut q = ReadyQueue::new();
        let a = spawn_record("a");
        // SAFETY: live record.
        unsafe { (*a).set_state(ThreadState::Blocked) };
        // No other runnable thread exists: fatal.
        let _ = q.reschedule(a, false);
    }
}
