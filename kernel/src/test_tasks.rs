//! In-kernel scenario threads (feature `testing`).
//!
//! These exercise the pieces that need real context switching and a live
//! timer (mutex contention under preemption, sleep/force-unblock timing,
//! progress under random yielding) and report over the serial console.
//! Everything host-testable lives in the ordinary test modules instead.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    error::KernelError,
    sched::thread,
    sync::{cell::GlobalCell, Mutex, Semaphore},
    time::Time,
};

const MUTEX_ROUNDS: u64 = 100_000;
const YIELDERS: usize = 6;

static COUNTER_MUTEX: Mutex = Mutex::new("test counter");
static SHARED_COUNTER: GlobalCell<u64> = GlobalCell::new(0);
static DONE: Semaphore = Semaphore::new("test done", 0);

static YIELD_PROGRESS: [AtomicUsize; YIELDERS] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

/// Tiny deterministic PRNG (xorshift32): no clock needed.
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// Two of these race on the shared counter under the mutex.
extern "C" fn mutex_worker(_arg: usize) {
    for _ in 0..MUTEX_ROUNDS {
        COUNTER_MUTEX.lock(None).expect("mutex lock");
        // SAFETY: the counter is only touched under COUNTER_MUTEX.
        unsafe {
            *SHARED_COUNTER.as_mut_ptr() += 1;
        }
        COUNTER_MUTEX.unlock().expect("mutex unlock");
    }
    DONE.up().expect("completion signal");
}

/// Sleeps "for 50 ms" but expects to be force-unblocked early.
extern "C" fn early_riser(_arg: usize) {
    let mut timeout = Time::from_millis(50);
    let result = thread::sleep(Some(&mut timeout));
    assert!(
        result == Err(KernelError::Interrupted),
        "sleeper woke by timeout instead of force-unblock"
    );
    // ~40 ms of the timeout should remain (tick granularity allows one
    // tick of slack either way).
    assert!(timeout.sec() == 0);
    let ms = timeout.nsec() / 1_000_000;
    assert!((30..=50).contains(&ms), "unexpected residual timeout {ms} ms");
    crate::serial_println!("test: early wakeup ok, {ms} ms left");
    DONE.up().expect("completion signal");
}

/// Wakes the early riser after 10 ms.
extern "C" fn waker(arg: usize) {
    let sleeper = arg as *mut thread::Thread;
    let mut nap = Time::from_millis(10);
    let result = thread::sleep(Some(&mut nap));
    assert!(result.is_ok(), "waker's own timeout must fire");
    thread::force_unblock(sleeper).expect("force unblock");
    DONE.up().expect("completion signal");
}

/// Spins forever, yielding and napping on a random schedule.
extern "C" fn yielder(arg: usize) {
    let mut rng = Rng(0x9e37_79b9 ^ (arg as u32 + 1));
    loop {
        YIELD_PROGRESS[arg].fetch_add(1, Ordering::Relaxed);
        match rng.next() % 300 {
            0..=2 => {
                let _ = thread::yield_cpu();
            }
            3 => {
                let mut nap = Time::from_millis(20);
                let _ = thread::sleep(Some(&mut nap));
            }
            _ => {}
        }
    }
}

/// The orchestrating thread: runs each scenario in sequence.
extern "C" fn test_main(_arg: usize) {
    crate::serial_println!("test: starting in-kernel scenarios");

    // Mutual exclusion under preemption: the total must be exact.
    thread::create("test-mutex-a", mutex_worker, 0).expect("spawn worker");
    thread::create("test-mutex-b", mutex_worker, 1).expect("spawn worker");
    DONE.down(None).expect("join worker");
    DONE.down(None).expect("join worker");
    // SAFETY: both workers have finished; no concurrent access remains.
    let total = unsafe { *SHARED_COUNTER.as_mut_ptr() };
    assert!(total == 2 * MUTEX_ROUNDS, "lost updates: {total}");
    crate::serial_println!("test: mutex counter ok ({total})");

    // Sleep interruption with residual timeout.
    let sleeper = thread::create("test-sleeper", early_riser, 0).expect("spawn sleeper");
    thread::create("test-waker", waker, sleeper as usize).expect("spawn waker");
    DONE.down(None).expect("join sleeper");
    DONE.down(None).expect("join waker");

    // Progress under random yielding: give the herd a second, then check
    // that every thread moved.
    for i in 0..YIELDERS {
        thread::create("test-yielder", yielder, i).expect("spawn yielder");
    }
    let mut pause = Time::from_millis(1000);
    let _ = thread::sleep(Some(&mut pause));
    for (i, progress) in YIELD_PROGRESS.iter().enumerate() {
        let count = progress.load(Ordering::Relaxed);
        assert!(count > 0, "yielder {i} made no progress");
        crate::serial_println!("test: yielder {i} progressed to {count}");
    }

    crate::serial_println!("test: all in-kernel scenarios passed");
}

/// Spawn the orchestrator. Called from the boot path once the scheduler
/// and the timer are live.
pub fn launch() {
    thread::create("test-main", test_main, 0).expect("spawn test-main");
}
