//! System time and timeout actions.
//!
//! The clock advances only on timer ticks, so `now()` has tick resolution.
//! Timeout actions are caller-owned structures kept on a list sorted by
//! ascending absolute deadline; [`do_tick`] advances the clock and fires
//! every action whose deadline has passed, in deadline order, with
//! interrupts disabled.

use crate::{
    error::{KernelError, KernelResult},
    sync::irqlock::{IrqGuard, IrqMutex},
};

const NSEC_PER_SEC: u32 = 1_000_000_000;

/// A `(seconds, nanoseconds)` instant or duration. `nsec` is always in
/// `[0, 1e9)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time {
    sec: u64,
    nsec: u32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };

    pub const fn new(sec: u64, nsec: u32) -> Self {
        assert!(nsec < NSEC_PER_SEC);
        Self { sec, nsec }
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self {
            sec: ms / 1000,
            nsec: (ms % 1000) as u32 * 1_000_000,
        }
    }

    pub const fn sec(&self) -> u64 {
        self.sec
    }

    pub const fn nsec(&self) -> u32 {
        self.nsec
    }

    pub const fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// `self += other`, with carry from the nanosecond field.
    pub fn inc(&mut self, other: &Time) {
        // Both nsec fields are < 1e9, so their sum fits a u32.
        let total = self.nsec + other.nsec;
        self.sec += other.sec + (total / NSEC_PER_SEC) as u64;
        self.nsec = total % NSEC_PER_SEC;
    }

    /// `self -= other`. The subtraction must not go negative; a
    /// non-monotonic argument is a kernel bug and halts.
    pub fn dec(&mut self, other: &Time) {
        assert!(
            *self >= *other,
            "time subtraction would be negative ({:?} - {:?})",
            self,
            other
        );
        if self.nsec >= other.nsec {
            self.nsec -= other.nsec;
        } else {
            self.nsec = self.nsec + NSEC_PER_SEC - other.nsec;
            self.sec -= 1;
        }
        self.sec -= other.sec;
    }
}

/// Callback type of a timeout action. Runs from the timer tick with
/// interrupts disabled; must not block.
pub type TimeoutRoutine = fn(&mut TimeoutAction);

/// A pending timeout: absolute deadline plus callback. The structure is
/// caller-owned (typically stack-resident in a sleeping thread) and must
/// stay alive while registered.
pub struct TimeoutAction {
    /// Absolute deadline while queued; after the action is removed (fired
    /// or unregistered) this holds the *remaining* time, zero if expired.
    deadline: Time,
    routine: Option<TimeoutRoutine>,
    data: *mut (),
    prev: *mut TimeoutAction,
    next: *mut TimeoutAction,
    queued: bool,
}

impl TimeoutAction {
    pub const fn new() -> Self {
        Self {
            deadline: Time::ZERO,
            routine: None,
            data: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            queued: false,
        }
    }

    /// User pointer registered with the action.
    pub fn data(&self) -> *mut () {
        self.data
    }

    /// Residual timeout after the action left the list: zero if it fired,
    /// the unelapsed remainder if it was unregistered early.
    pub fn remaining(&self) -> Time {
        self.deadline
    }
}

impl Default for TimeoutAction {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock state: current time, tick resolution and the deadline-ordered
/// action list.
pub struct Clock {
    now: Time,
    resolution: Time,
    head: *mut TimeoutAction,
}

// SAFETY: the raw pointers link caller-owned actions; all accesses happen
// inside interrupt-off critical sections on a single CPU (or under the
// host test lock).
unsafe impl Send for Clock {}

impl Clock {
    pub const fn new() -> Self {
        Self {
            now: Time::ZERO,
            resolution: Time::ZERO,
            head: core::ptr::null_mut(),
        }
    }

    pub fn now(&self) -> Time {
        self.now
    }

    pub fn resolution(&self) -> Time {
        self.resolution
    }

    pub fn set_resolution(&mut self, resolution: Time) {
        self.resolution = resolution;
    }

    /// Queue `act`, computing the absolute deadline from `date` (relative
    /// to now or absolute). Fails with `Busy` if already queued, `Invalid`
    /// for an absolute date in the past.
    pub fn add_action(
        &mut self,
        act: &mut TimeoutAction,
        date: &Time,
        relative: bool,
        routine: TimeoutRoutine,
        data: *mut (),
    ) -> KernelResult<()> {
        if act.queued {
            return Err(KernelError::Busy);
        }
        if relative {
            let mut deadline = self.now;
            deadline.inc(date);
            act.deadline = deadline;
        } else {
            if *date < self.now {
                return Err(KernelError::Invalid);
            }
            act.deadline = *date;
        }
        act.routine = Some(routine);
        act.data = data;

        // Insert before the first action with a later deadline, keeping
        // the list sorted; FIFO among equal deadlines.
        let mut insert_before: *mut TimeoutAction = core::ptr::null_mut();
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: queued actions are alive per the type contract, and
            // we are inside the caller's critical section.
            let c = unsafe { &*cursor };
            if act.deadline < c.deadline {
                insert_before = cursor;
                break;
            }
            cursor = c.next;
        }

        let act_ptr = act as *mut TimeoutAction;
        if insert_before.is_null() {
            // Append at the tail.
            if self.head.is_null() {
                act.prev = core::ptr::null_mut();
                act.next = core::ptr::null_mut();
                self.head = act_ptr;
            } else {
                let mut tail = self.head;
                // SAFETY: as above; the list is finite and well-formed.
                unsafe {
                    while !(*tail).next.is_null() {
                        tail = (*tail).next;
                    }
                    (*tail).next = act_ptr;
                }
                act.prev = tail;
                act.next = core::ptr::null_mut();
            }
        } else {
            // SAFETY: `insert_before` is a live queued action.
            unsafe {
                act.prev = (*insert_before).prev;
                act.next = insert_before;
                if act.prev.is_null() {
                    self.head = act_ptr;
                } else {
                    (*act.prev).next = act_ptr;
                }
                (*insert_before).prev = act_ptr;
            }
        }
        act.queued = true;
        Ok(())
    }

    /// Unlink `act`, leaving its residual timeout in `deadline`.
    pub fn remove_action(&mut self, act: &mut TimeoutAction) -> KernelResult<()> {
        if !act.queued {
            return Err(KernelError::Invalid);
        }

        // Compute the residual timeout.
        if act.deadline <= self.now {
            act.deadline = Time::ZERO;
        } else {
            act.deadline.dec(&self.now);
        }

        // SAFETY: neighbors of a queued action are live queued actions.
        unsafe {
            if act.prev.is_null() {
                self.head = act.next;
            } else {
                (*act.prev).next = act.next;
            }
            if !act.next.is_null() {
                (*act.next).prev = act.prev;
            }
        }
        act.prev = core::ptr::null_mut();
        act.next = core::ptr::null_mut();
        act.queued = false;
        Ok(())
    }

    /// Advance the clock by one tick.
    pub fn advance(&mut self) {
        let resolution = self.resolution;
        self.now.inc(&resolution);
    }

    /// Detach and return the first action whose deadline has passed, or
    /// `None`. The returned action already carries its residual (zero)
    /// timeout.
    pub fn pop_due(&mut self) -> Option<*mut TimeoutAction> {
        let head = self.head;
        if head.is_null() {
            return None;
        }
        // SAFETY: the head of the list is a live queued action.
        unsafe {
            if (*head).deadline > self.now {
                return None;
            }
            self.remove_action(&mut *head).expect("head must be queued");
        }
        Some(head)
    }
}

static CLOCK: IrqMutex<Clock> = IrqMutex::new(Clock::new());

/// Initialize the clock with the timer tick resolution.
pub fn setup(resolution: Time) {
    let mut clock = CLOCK.lock();
    clock.now = Time::ZERO;
    clock.set_resolution(resolution);
    clock.head = core::ptr::null_mut();
}

/// Time elapsed since boot, at tick resolution.
pub fn now() -> Time {
    CLOCK.lock().now()
}

/// Current tick resolution.
pub fn tick_resolution() -> Time {
    CLOCK.lock().resolution()
}

/// Change the tick resolution (after reprogramming the hardware timer).
pub fn set_tick_resolution(resolution: Time) {
    CLOCK.lock().set_resolution(resolution);
}

/// Queue `act` to fire `delay` from now.
pub fn register_action_relative(
    act: &mut TimeoutAction,
    delay: &Time,
    routine: TimeoutRoutine,
    data: *mut (),
) -> KernelResult<()> {
    CLOCK.lock().add_action(act, delay, true, routine, data)
}

/// Queue `act` to fire at the absolute instant `date`.
pub fn register_action_absolute(
    act: &mut TimeoutAction,
    date: &Time,
    routine: TimeoutRoutine,
    data: *mut (),
) -> KernelResult<()> {
    CLOCK.lock().add_action(act, date, false, routine, data)
}

/// Remove a pending action. Its residual timeout is left in the action.
pub fn unregister_action(act: &mut TimeoutAction) -> KernelResult<()> {
    CLOCK.lock().remove_action(act)
}

/// Timer-tick entry point: advance the clock, then fire every action that
/// became due, in deadline order. Callbacks run with interrupts disabled.
pub fn do_tick() {
    let _irq = IrqGuard::new();

    CLOCK.lock().advance();
    loop {
        let due = CLOCK.lock().pop_due();
        let Some(act) = due else { break };
        // SAFETY: a queued action is alive per the type contract; it was
        // detached above so the callback may do anything with it,
        // including re-registering it.
        unsafe {
            if let Some(routine) = (*act).routine {
                routine(&mut *act);
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_inc_carries_nanoseconds() {
        let mut t = Time::new(1, 999_999_999);
        t.inc(&Time::new(0, 2));
        assert_eq!(t, Time::new(2, 1));

        // Identity: adding zero changes nothing.
        let before = t;
        t.inc(&Time::ZERO);
        assert_eq!(t, before);
    }

    #[test]
    fn test_dec_borrows_and_roundtrips() {
        let mut t = Time::new(2, 1);
        t.dec(&Time::new(0, 2));
        assert_eq!(t, Time::new(1, 999_999_999));

        // dec(t, t) == 0.
        let copy = t;
        t.dec(&copy);
        assert!(t.is_zero());

        // inc then dec restores the original.
        let mut a = Time::new(7, 123);
        let b = Time::new(3, 999_999_877);
        let orig = a;
        a.inc(&b);
        a.dec(&b);
        assert_eq!(a, orig);
    }

    #[test]
    #[should_panic(expected = "negative")]
    fn test_dec_below_zero_is_fatal() {
        let mut t = Time::new(0, 100);
        t.dec(&Time::new(0, 200));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(Time::new(1, 0) < Time::new(1, 1));
        assert!(Time::new(1, 999_999_999) < Time::new(2, 0));
        assert_eq!(Time::new(3, 5), Time::new(3, 5));
    }

    fn noop(_act: &mut TimeoutAction) {}

    #[test]
    fn test_actions_stay_sorted_by_deadline() {
        let mut clock = Clock::new();
        clock.set_resolution(Time::from_millis(10));

        let mut a = TimeoutAction::new();
        let mut b = TimeoutAction::new();
        let mut c = TimeoutAction::new();
        clock
            .add_action(&mut b, &Time::from_millis(50), true, noop, core::ptr::null_mut())
            .unwrap();
        clock
            .add_action(&mut a, &Time::from_millis(20), true, noop, core::ptr::null_mut())
            .unwrap();
        clock
            .add_action(&mut c, &Time::from_millis(90), true, noop, core::ptr::null_mut())
            .unwrap();

        // Walk the list and assert ascending deadlines.
        let mut cursor = clock.head;
        let mut last = Time::ZERO;
        let mut count = 0;
        while !cursor.is_null() {
            let act = unsafe { &*cursor };
            assert!(act.deadline >= last);
            last = act.deadline;
            cursor = act.next;
            count += 1;
        }
        assert_eq!(count, 3);

        // Double registration is refused.
        assert_eq!(
            clock.add_action(&mut a, &Time::from_millis(1), true, noop, core::ptr::null_mut()),
            Err(KernelError::Busy)
        );

        clock.remove_action(&mut a).unwrap();
        clock.remove_action(&mut b).unwrap();
        clock.remove_action(&mut c).unwrap();
        assert!(clock.head.is_null());
    }

    #[test]
    fn test_pop_due_fires_in_deadline_order() {
        let mut clock = Clock::new();
        clock.set_resolution(Time::from_millis(10));

        let mut a = TimeoutAction::new();
        let mut b = TimeoutAction::new();
        clock
            .add_action(&mut a, &Time::from_millis(10), true, noop, core::ptr::null_mut())
            .unwrap();
        clock
            .add_action(&mut b, &Time::from_millis(20), true, noop, core::ptr::null_mut())
            .unwrap();

        assert!(clock.pop_due().is_none());

        clock.advance(); // now = 10ms
        let first = clock.pop_due().expect("a is due");
        assert_eq!(first, &mut a as *mut _);
        assert!(a.remaining().is_zero());
        assert!(clock.pop_due().is_none());

        clock.advance(); // now = 20ms
        let second = clock.pop_due().expect("b is due");
        assert_eq!(second, &mut b as *mut _);
        assert!(!b.queued);
    }

    #[test]
    fn test_unregister_keeps_residual_timeout() {
        let mut clock = Clock::new();
        clock.set_resolution(Time::from_millis(10));

        let mut act = TimeoutAction::new();
        clock
            .add_action(&mut act, &Time::from_millis(50), true, noop, core::ptr::null_mut())
            .unwrap();
        clock.advance(); // 10ms elapsed
        clock.remove_action(&mut act).unwrap();
        assert_eq!(act.remaining(), Time::from_millis(40));

        // Absolute registration in the past is refused.
        let mut late = TimeoutAction::new();
        assert_eq!(
            clock.add_action(&mut late, &Time::ZERO, false, noop, core::ptr::null_mut()),
            Err(KernelError::Invalid)
        );
    }
}
