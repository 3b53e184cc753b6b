//! Kernel threads and scheduling.

pub mod scheduler;
pub mod thread;
pub mod waitq;

pub use thread::{Thread, ThreadState};
pub use waitq::{WaitEntry, WaitQueue};
