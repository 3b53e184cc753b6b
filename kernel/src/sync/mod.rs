//! Synchronization primitives.
//!
//! [`irqlock`] carries the kernel's one mutual-exclusion mechanism
//! (scoped interrupt disabling); [`Semaphore`] and [`Mutex`] are the
//! blocking primitives layered on wait queues.

pub mod cell;
pub mod irqlock;
pub mod mutex;
pub mod semaphore;

pub use irqlock::{IrqGuard, IrqMutex};
pub use mutex::Mutex;
pub use semaphore::Semaphore;
