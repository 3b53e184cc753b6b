//! Wait queues.
//!
//! The core "block a thread / wake N threads" primitive. A waiter places a
//! stack-resident [`WaitEntry`] into the queue and sleeps; a waker marks
//! entries as triggered (recording a status code), unlinks them, and makes
//! their threads ready, in FIFO order. An entry that is still linked when
//! the waiter comes back means the wakeup came from somewhere else
//! (timeout or a foreign queue), and the wait reports `Interrupted`.

use crate::{
    error::{KernelError, KernelResult},
    sync::irqlock::IrqMutex,
    time::Time,
};

use super::thread::{self, Thread, ThreadState};

/// A thread's token in a wait queue. Stack-allocated inside the blocking
/// call; must never outlive its wait.
pub struct WaitEntry {
    thread: *mut Thread,
    /// The queue this entry is linked into, or null.
    queue: *const WaitQueue,
    /// Set by a waker of this queue (as opposed to a timeout or a foreign
    /// wakeup).
    triggered: bool,
    status: KernelResult<()>,
    // Links in the wait queue.
    q_prev: *mut WaitEntry,
    q_next: *mut WaitEntry,
    // Links in the owning thread's entry list.
    t_prev: *mut WaitEntry,
    t_next: *mut WaitEntry,
}

impl WaitEntry {
    /// An entry bound to the calling thread.
    pub fn new() -> Self {
        Self::new_for(thread::current())
    }

    /// An entry bound to an explicit thread (waker-side bookkeeping and
    /// tests).
    pub(crate) fn new_for(thread: *mut Thread) -> Self {
        WaitEntry {
            thread,
            queue: core::ptr::null(),
            triggered: false,
            status: Ok(()),
            q_prev: core::ptr::null_mut(),
            q_next: core::ptr::null_mut(),
            t_prev: core::ptr::null_mut(),
            t_next: core::ptr::null_mut(),
        }
    }

    pub fn triggered(&self) -> bool {
        self.triggered
    }

    pub fn status(&self) -> KernelResult<()> {
        self.status
    }
}

impl Default for WaitEntry {
    fn default() -> Self {
        Self::new()
    }
}

struct WaitList {
    head: *mut WaitEntry,
    tail: *mut WaitEntry,
}

// SAFETY: entries are stack-resident in their waiting threads and only
// touched inside the queue's interrupt-off critical section (or under the
// host test lock).
unsafe impl Send for WaitList {}

/// A FIFO wait queue.
pub struct WaitQueue {
    name: &'static str,
    list: IrqMutex<WaitList>,
}

impl WaitQueue {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            list: IrqMutex::new(WaitList {
                head: core::ptr::null_mut(),
                tail: core::ptr::null_mut(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A queue may only be torn down empty.
    pub fn dispose(&self) -> KernelResult<()> {
        let list = self.list.lock();
        if list.head.is_null() {
            Ok(())
        } else {
            Err(KernelError::Busy)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().head.is_null()
    }

    /// Link `entry` at the tail and into its thread's entry list. Must
    /// not cause a reschedule.
    pub fn add_entry(&self, entry: &mut WaitEntry) {
        let mut list = self.list.lock();
        assert!(entry.queue.is_null(), "wait entry added twice");
        assert!(!entry.thread.is_null(), "wait entry without a thread");

        entry.triggered = false;
        entry.status = Ok(());
        entry.queue = self as *const WaitQueue;

        let entry_ptr = entry as *mut WaitEntry;
        // SAFETY: critical section held; the entry and its neighbors are
        // live stack-resident entries; the thread record is live.
        unsafe {
            // Queue tail.
            (*entry_ptr).q_prev = list.tail;
            (*entry_ptr).q_next = core::ptr::null_mut();
            if list.tail.is_null() {
                list.head = entry_ptr;
            } else {
                (*list.tail).q_next = entry_ptr;
            }
            list.tail = entry_ptr;

            // Thread's entry list tail.
            let thread = entry.thread;
            (*entry_ptr).t_prev = (*thread).wait_tail;
            (*entry_ptr).t_next = core::ptr::null_mut();
            if (*thread).wait_tail.is_null() {
                (*thread).wait_head = entry_ptr;
            } else {
                (*(*thread).wait_tail).t_next = entry_ptr;
            }
            (*thread).wait_tail = entry_ptr;
        }
    }

    /// Unlink `entry` from this queue and its thread. Must not cause a
    /// reschedule.
    pub fn remove_entry(&self, entry: &mut WaitEntry) {
        let mut list = self.list.lock();
        assert!(
            core::ptr::eq(entry.queue, self),
            "wait entry removed from the wrong queue"
        );
        // SAFETY: critical section held; same liveness as in `add_entry`.
        unsafe {
            Self::unlink_locked(&mut list, entry as *mut WaitEntry);
        }
    }

    /// Detach `entry` from the queue list and the thread list.
    ///
    /// # Safety
    ///
    /// The queue lock must be held and `entry` linked in this queue.
    unsafe fn unlink_locked(list: &mut WaitList, entry: *mut WaitEntry) {
        // SAFETY: per the contract; all touched nodes are live.
        unsafe {
            if (*entry).q_prev.is_null() {
                list.head = (*entry).q_next;
            } else {
                (*(*entry).q_prev).q_next = (*entry).q_next;
            }
            if (*entry).q_next.is_null() {
                list.tail = (*entry).q_prev;
            } else {
                (*(*entry).q_next).q_prev = (*entry).q_prev;
            }
            (*entry).q_prev = core::ptr::null_mut();
            (*entry).q_next = core::ptr::null_mut();

            let thread = (*entry).thread;
            if (*entry).t_prev.is_null() {
                (*thread).wait_head = (*entry).t_next;
            } else {
                (*(*entry).t_prev).t_next = (*entry).t_next;
            }
            if (*entry).t_next.is_null() {
                (*thread).wait_tail = (*entry).t_prev;
            } else {
                (*(*entry).t_next).t_prev = (*entry).t_prev;
            }
            (*entry).t_prev = core::ptr::null_mut();
            (*entry).t_next = core::ptr::null_mut();

            (*entry).queue = core::ptr::null();
        }
    }

    /// Park the calling thread on this queue, with an optional timeout
    /// (semantics of [`thread::sleep`]). Returns the waker's status code
    /// when this queue woke us, `Interrupted` when the sleep ended for
    /// any other reason (the entry is then unlinked here).
    pub fn wait(&self, timeout: Option<&mut Time>) -> KernelResult<()> {
        let mut entry = WaitEntry::new();
        // Keep interrupts off from the moment the entry is visible until
        // we are back: nobody can wake us between linking and sleeping.
        let _irq = crate::sync::irqlock::IrqGuard::new();
        self.add_entry(&mut entry);

        let _ = thread::sleep(timeout);
        // Woken: either this queue's waker triggered us (and unlinked the
        // entry), or the timeout/foreign path left the entry linked.
        if entry.triggered() {
            entry.status()
        } else {
            self.remove_entry(&mut entry);
            Err(KernelError::Interrupted)
        }
    }

    /// Wake up to `nb` threads in FIFO order, recording `status` in their
    /// entries. An entry whose thread is Running is the caller itself
    /// waiting on its own queue: it is skipped, not woken.
    pub fn wakeup(&self, nb: usize, status: KernelResult<()>) -> KernelResult<()> {
        let mut list = self.list.lock();
        let mut remaining = nb;
        let mut cursor = list.head;
        while !cursor.is_null() && remaining > 0 {
            // SAFETY: critical section held; linked entries and their
            // threads are live.
            unsafe {
                let next = (*cursor).q_next;
                let waiter = (*cursor).thread;
                if (*waiter).state() == ThreadState::Running {
                    // The current thread parked here but has not slept
                    // yet; leave its entry alone.
                    cursor = next;
                    continue;
                }

                thread::force_unblock(waiter)?;
                Self::unlink_locked(&mut list, cursor);
                (*cursor).triggered = true;
                (*cursor).status = status;

                remaining -= 1;
                cursor = next;
            }
        }
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn spawn_record(name: &str) -> *mut Thread {
        let t = Box::into_raw(Box::new(Thread::new_record(name, 0, 0)));
        // A blocked thread, as if it had parked itself.
        // SAFETY: freshly created record.
        unsafe { (*t).set_state(ThreadState::Blocked) };
        t
    }

    fn release_record(t: *mut Thread) {
        // SAFETY: created by `spawn_record`.
        drop(unsafe { Box::from_raw(t) });
    }

    #[test]
    fn test_add_remove_tracks_thread_list() {
        let q = WaitQueue::new("test");
        let t = spawn_record("w");
        let mut e = WaitEntry::new_for(t);

        assert!(q.is_empty());
        q.add_entry(&mut e);
        assert!(!q.is_empty());
        // SAFETY: live record.
        assert!(unsafe { (*t).has_wait_entries() });
        assert_eq!(q.dispose(), Err(KernelError::Busy));

        q.remove_entry(&mut e);
        assert!(q.is_empty());
        // SAFETY: live record.
        assert!(!unsafe { (*t).has_wait_entries() });
        assert_eq!(q.dispose(), Ok(()));

        release_record(t);
    }

    #[test]
    fn test_wakeup_is_fifo_and_counts() {
        // Wakeups go through the global ready queue: serialize and reset.
        let _guard = crate::test_support::lock();
        crate::sched::scheduler::setup();

        let q = WaitQueue::new("fifo");
        let a = spawn_record("a");
        let b = spawn_record("b");
        let c = spawn_record("c");
        let mut ea = WaitEntry::new_for(a);
        let mut eb = WaitEntry::new_for(b);
        let mut ec = WaitEntry::new_for(c);
        q.add_entry(&mut ea);
        q.add_entry(&mut eb);
        q.add_entry(&mut ec);

        // Wake two: strictly the two oldest waiters.
        q.wakeup(2, Ok(())).unwrap();
        assert!(ea.triggered() && eb.triggered());
        assert!(!ec.triggered());
        // SAFETY: live records.
        unsafe {
            assert_eq!((*a).state(), ThreadState::Ready);
            assert_eq!((*b).state(), ThreadState::Ready);
            assert_eq!((*c).state(), ThreadState::Blocked);
        }

        q.wakeup(1, Err(KernelError::Busy)).unwrap();
        assert!(ec.triggered());
        assert_eq!(ec.status(), Err(KernelError::Busy));
        assert!(q.is_empty());

        // Reset the global queue before the records go away.
        crate::sched::scheduler::setup();
        for t in [a, b, c] {
            release_record(t);
        }
    }

    #[test]
    fn test_wakeup_skips_the_running_caller() {
        let _guard = crate::test_support::lock();
        crate::sched::scheduler::setup();

        let q = WaitQueue::new("skip");
        let runner = spawn_record("runner");
        // SAFETY: live record.
        unsafe { (*runner).set_state(ThreadState::Running) };
        let sleeper = spawn_record("sleeper");

        let mut er = WaitEntry::new_for(runner);
        let mut es = WaitEntry::new_for(sleeper);
        q.add_entry(&mut er);
        q.add_entry(&mut es);

        // One wakeup: the Running head entry is skipped, the Blocked
        // second entry gets the wakeup.
        q.wakeup(1, Ok(())).unwrap();
        assert!(!er.triggered());
        assert!(es.triggered());
        // SAFETY: live record.
        unsafe { assert_eq!((*sleeper).state(), ThreadState::Ready) };

        q.remove_entry(&mut er);
        crate::sched::scheduler::setup();
        release_record(runner);
        release_record(sleeper);
    }
}
